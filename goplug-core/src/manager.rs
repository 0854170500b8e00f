//! Top-level plugin manager
//!
//! Owns the plugin root, the discovery glob and the loader, and orchestrates
//! scan, build, load, dispatch and unload. Every public call clears the
//! standing error slot and warning list first; a failing call leaves its
//! diagnostic behind for [`Manager::error`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use goplug_plugin_api::{
    CallbackKind, Capabilities, HookResponse, Identity, Plugin, PluginType, TypeRegistry, Value,
};
use serde::Serialize;

use crate::builder::{BuildReport, Builder};
use crate::config::HostConfig;
use crate::discovery::{self, Candidate, ScanReport};
use crate::error::{Diagnostic, ErrorKind, PluginHostError, Result};
use crate::handle::PluginHandle;
use crate::lifecycle::{LifecycleState, Mechanism};
use crate::loader::{LoadOutcome, Loader};
use crate::validate::{ShapeCheck, ValidationContext, Validator};

/// Summary of a loaded plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub key: PathBuf,
    pub mechanism: Mechanism,
    pub state: LifecycleState,
    pub hooks: usize,
}

impl From<&PluginHandle> for PluginInfo {
    fn from(handle: &PluginHandle) -> Self {
        Self {
            name: handle.name().to_string(),
            version: handle.identity().version.clone(),
            key: handle.key().to_path_buf(),
            mechanism: handle.mechanism(),
            state: handle.state(),
            hooks: handle.hook_count(),
        }
    }
}

/// Outcome of a bulk register or unregister
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub done: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<Diagnostic>,
}

impl BulkReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Discovery {
    directory: PathBuf,
    glob: String,
    pattern: glob::Pattern,
}

pub struct Manager {
    config: HostConfig,
    discovery: RwLock<Discovery>,
    host_identity: RwLock<Option<Identity>>,
    types: Arc<RwLock<TypeRegistry>>,
    loader: Loader,
    builder: Builder,
    discovered: RwLock<Vec<Candidate>>,
    error: Mutex<Option<Diagnostic>>,
    warnings: Mutex<Vec<Diagnostic>>,
}

impl Manager {
    /// Create a manager over `config.plugin_dir`. The directory is not
    /// touched until [`Manager::set_directory`] or the first scan.
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::with_validator(config, Validator::new())
    }

    /// Create a manager with a custom validation pipeline
    pub fn with_validator(config: HostConfig, validator: Validator) -> Result<Self> {
        let pattern = discovery::pattern(&config.file_glob)?;
        let types = Arc::new(RwLock::new(TypeRegistry::new()));
        let loader = Loader::new(&config, Arc::new(validator), Arc::clone(&types));
        let builder = Builder::new(&config);
        Ok(Self {
            discovery: RwLock::new(Discovery {
                directory: config.plugin_dir.clone(),
                glob: config.file_glob.clone(),
                pattern,
            }),
            config,
            host_identity: RwLock::new(None),
            types,
            loader,
            builder,
            discovered: RwLock::new(Vec::new()),
            error: Mutex::new(None),
            warnings: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    // ---- error slot ----

    fn begin(&self) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn warn(&self, diagnostic: Diagnostic) {
        tracing::warn!(prefix = %diagnostic.prefix, kind = %diagnostic.kind, "{}", diagnostic.message);
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }

    fn fail(&self, diagnostic: Diagnostic) {
        tracing::error!(prefix = %diagnostic.prefix, kind = %diagnostic.kind, "{}", diagnostic.message);
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(diagnostic);
    }

    /// Record the outcome of a public operation
    fn record<T>(&self, prefix: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            let diagnostic = e.diagnostic(prefix);
            if e.is_warning() {
                self.warn(diagnostic);
            } else {
                self.fail(diagnostic);
            }
        }
        result
    }

    /// Whether the last public call left an error behind
    pub fn is_error(&self) -> bool {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn error(&self) -> Option<Diagnostic> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn warnings(&self) -> Vec<Diagnostic> {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ---- configuration ----

    /// Point the manager at a plugin root, creating it if absent
    pub fn set_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        self.begin();
        let result = resolve_directory(path.as_ref()).map(|dir| {
            tracing::debug!(dir = %dir.display(), "Plugin directory set");
            self.discovery
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .directory = dir;
        });
        self.record("set_directory", result)
    }

    pub fn directory(&self) -> PathBuf {
        self.discovery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .directory
            .clone()
    }

    pub fn set_file_glob(&self, glob: &str) -> Result<()> {
        self.begin();
        let result = discovery::pattern(glob).map(|pattern| {
            let mut discovery = self.discovery.write().unwrap_or_else(PoisonError::into_inner);
            discovery.glob = glob.to_string();
            discovery.pattern = pattern;
        });
        self.record("set_file_glob", result)
    }

    pub fn file_glob(&self) -> String {
        self.discovery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .glob
            .clone()
    }

    /// Set the host's own identity. Only its shape is checked.
    pub fn set_identity(&self, identity: Identity) -> Result<()> {
        self.begin();
        let report = Validator::empty()
            .with_stage(ShapeCheck)
            .validate(&identity, &ValidationContext::default());
        for warning in &report.warnings {
            self.warn(Diagnostic::warning(ErrorKind::Validation, "set_identity", warning));
        }
        let result = report.into_result(&identity.name).map(|_| {
            *self
                .host_identity
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(identity);
        });
        self.record("set_identity", result)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.host_identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Accept a user type on the RPC wire
    pub fn declare_type<T: PluginType>(&self) {
        self.types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .declare::<T>();
    }

    pub fn declare_type_name(&self, type_name: impl Into<String>) {
        self.types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .declare_name(type_name);
    }

    // ---- discovery and build ----

    /// Discover candidates under the plugin root
    pub fn scan(&self) -> Result<ScanReport> {
        self.begin();
        let result = self.scan_inner();
        self.record("scan", result)
    }

    fn scan_inner(&self) -> Result<ScanReport> {
        let (directory, pattern) = {
            let discovery = self.discovery.read().unwrap_or_else(PoisonError::into_inner);
            (discovery.directory.clone(), discovery.pattern.clone())
        };
        let directory = resolve_directory(&directory)?;
        let mut report = discovery::scan(
            &directory,
            &pattern,
            self.loader.mask(),
            &self.config.build.source_extension,
        )?;

        for candidate in &report.candidates {
            let Some(cached) = &candidate.cached_identity else {
                continue;
            };
            let Some(live) = std::fs::canonicalize(&candidate.path)
                .ok()
                .and_then(|path| self.loader.get_path(&path))
            else {
                continue;
            };
            if live.name() != cached.name || live.identity().version != cached.version {
                report.warnings.push(format!(
                    "cached identity {}@{} of {} differs from live {}@{}",
                    cached.name,
                    cached.version,
                    candidate.path.display(),
                    live.name(),
                    live.identity().version
                ));
            }
        }
        for warning in &report.warnings {
            self.warn(Diagnostic::warning(ErrorKind::Serialization, "scan", warning));
        }

        tracing::info!(dir = %directory.display(), candidates = report.candidates.len(), "Scan complete");
        *self.discovered.write().unwrap_or_else(PoisonError::into_inner) =
            report.candidates.clone();
        Ok(report)
    }

    /// Candidates found by the last scan
    pub fn discovered(&self) -> Vec<Candidate> {
        self.discovered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebuild every stale native plugin source under the plugin root
    pub async fn build_plugins(&self) -> Result<BuildReport> {
        self.begin();
        let (directory, pattern) = {
            let discovery = self.discovery.read().unwrap_or_else(PoisonError::into_inner);
            (discovery.directory.clone(), discovery.pattern.clone())
        };
        let result = match resolve_directory(&directory) {
            Ok(directory) => self.builder.build_all(&directory, &pattern).await,
            Err(e) => Err(e),
        };
        if let Ok(report) = &result
            && let Some(last) = report.failed.last()
        {
            self.fail(last.clone());
        }
        self.record("build_plugins", result)
    }

    // ---- load and unload ----

    /// Scan, then load every candidate not already loaded.
    ///
    /// A failing candidate does not stop the loop; the last failure is left
    /// in the error slot.
    pub async fn register_plugins(&self) -> Result<BulkReport> {
        self.begin();
        let scanned = self.scan_inner();
        let scanned = self.record("register_plugins", scanned)?;

        let mut report = BulkReport::default();
        for candidate in scanned.candidates {
            let already = std::fs::canonicalize(&candidate.path)
                .ok()
                .and_then(|path| self.loader.get_path(&path));
            if already.is_some() {
                tracing::debug!(path = %candidate.path.display(), "Already loaded, skipping");
                report.skipped.push(candidate.path);
                continue;
            }
            let mask = match candidate.mechanism {
                Mechanism::Native => Capabilities::NATIVE,
                Mechanism::Rpc => Capabilities::RPC,
            };
            match self.loader.load(&candidate.path, mask).await {
                Ok(outcome) => {
                    let key = outcome.handle.key().to_path_buf();
                    self.absorb(outcome);
                    report.done.push(key);
                }
                Err(e) => {
                    let diagnostic = e.diagnostic(candidate.path.display().to_string());
                    self.fail(diagnostic.clone());
                    report.failed.push(diagnostic);
                }
            }
        }
        tracing::info!(
            loaded = report.done.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Registration complete"
        );
        Ok(report)
    }

    /// Unload every plugin. Failures are recorded, none stops the loop.
    pub async fn unregister_plugins(&self) -> BulkReport {
        self.begin();
        let mut report = BulkReport::default();
        for handle in self.loader.get_all() {
            let key = handle.key().to_path_buf();
            match self.loader.unload(&key.to_string_lossy()).await {
                Ok(_) => report.done.push(key),
                Err(e) => {
                    let diagnostic = e.diagnostic(handle.logger());
                    self.fail(diagnostic.clone());
                    report.failed.push(diagnostic);
                }
            }
        }
        report
    }

    fn absorb(&self, outcome: LoadOutcome) -> Arc<PluginHandle> {
        for warning in outcome.warnings {
            self.warn(warning);
        }
        outcome.handle
    }

    /// Load and initialise the plugin at `path` with every active mechanism
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<Arc<PluginHandle>> {
        self.load_with(path, Capabilities::BOTH).await
    }

    /// Load and initialise with only the mechanisms in `mask`
    pub async fn load_with(
        &self,
        path: impl AsRef<Path>,
        mask: Capabilities,
    ) -> Result<Arc<PluginHandle>> {
        self.begin();
        let result = self.loader.load(path.as_ref(), mask).await;
        self.record("load", result).map(|outcome| self.absorb(outcome))
    }

    /// Register a plugin compiled into the host
    pub async fn register_static(&self, plugin: Arc<dyn Plugin>) -> Result<Arc<PluginHandle>> {
        self.begin();
        plugin.declare_types(&mut self.types.write().unwrap_or_else(PoisonError::into_inner));
        let result = self.loader.register_static(plugin).await;
        self.record("register_static", result)
            .map(|outcome| self.absorb(outcome))
    }

    /// Unload by path or declared name
    pub async fn unload(&self, key: &str) -> Result<()> {
        self.begin();
        let result = match self.lookup(key) {
            Ok(handle) => self
                .loader
                .unload(&handle.key().to_string_lossy())
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        self.record("unload", result)
    }

    /// Unload everything and wait for every `run` task
    pub async fn dispose(&self) -> Result<()> {
        let report = self.unregister_plugins().await;
        self.discovered
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        match report.failed.last() {
            None => Ok(()),
            Some(last) => Err(PluginHostError::Structural(format!(
                "{} plugin(s) failed to unload, last: {last}",
                report.failed.len()
            ))),
        }
    }

    // ---- lookup ----

    fn lookup(&self, key: &str) -> Result<Arc<PluginHandle>> {
        self.loader.get(key).or_else(|e| {
            std::fs::canonicalize(key)
                .ok()
                .and_then(|path| self.loader.get_path(&path))
                .ok_or(e)
        })
    }

    /// By path, canonicalised when it exists on disk
    pub fn get(&self, path: impl AsRef<Path>) -> Result<Arc<PluginHandle>> {
        self.begin();
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let result = self
            .loader
            .get_path(&canonical)
            .ok_or_else(|| PluginHostError::not_found(path.display().to_string()));
        self.record("get", result)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<PluginHandle>> {
        self.begin();
        let result = self
            .loader
            .get_all()
            .into_iter()
            .find(|h| h.name() == name)
            .ok_or_else(|| PluginHostError::not_found(name));
        self.record("get_by_name", result)
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.loader
            .get_all()
            .iter()
            .map(|h| PluginInfo::from(h.as_ref()))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.loader.size()
    }

    // ---- dispatch ----

    /// Call a hook on the plugin with the given path or name
    pub async fn call_hook(&self, key: &str, hook: &str, args: Vec<Value>) -> Result<HookResponse> {
        self.begin();
        let result = match self.lookup(key) {
            Ok(handle) => handle.call_hook(hook, args).await,
            Err(e) => Err(e),
        };
        self.record("call_hook", result)
    }

    /// Invoke a lifecycle callback on the plugin with the given path or name
    pub async fn invoke(&self, key: &str, kind: CallbackKind, args: Vec<Value>) -> Result<()> {
        self.begin();
        let result = match self.lookup(key) {
            Ok(handle) => handle.invoke_lifecycle(kind, args).await,
            Err(e) => Err(e),
        };
        self.record(kind.as_str(), result)
    }
}

/// Create `path` if absent and require a directory
fn resolve_directory(path: &Path) -> Result<PathBuf> {
    if let Err(e) = std::fs::create_dir_all(path) {
        return Err(PluginHostError::InvalidDirectory {
            path: path.to_path_buf(),
            reason: e.to_string(),
        });
    }
    let canonical = std::fs::canonicalize(path)?;
    if !canonical.is_dir() {
        return Err(PluginHostError::InvalidDirectory {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(canonical)
}
