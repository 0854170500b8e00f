//! Loader composite over the native and RPC mechanisms
//!
//! Each mechanism keeps its own store. Loads try the active mechanisms in the
//! order native, RPC and stop at the first success; unloads are routed by the
//! mechanism recorded in the handle.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use goplug_plugin_api::{CallbackKind, Capabilities, Plugin, PluginId, TypeRegistry};

use crate::config::HostConfig;
use crate::error::{Diagnostic, ErrorKind, PluginHostError, Result};
use crate::handle::PluginHandle;
use crate::lifecycle::Mechanism;
use crate::native::NativeMechanism;
use crate::rpc::RpcMechanism;
use crate::store::PluginStore;
use crate::validate::Validator;

/// A plugin that made it into a store, with what went wrong along the way
#[derive(Debug)]
pub struct LoadOutcome {
    pub handle: Arc<PluginHandle>,
    pub warnings: Vec<Diagnostic>,
}

pub struct Loader {
    mask: Capabilities,
    native: NativeMechanism,
    rpc: RpcMechanism,
    native_store: PluginStore,
    rpc_store: PluginStore,
    next_id: AtomicU64,
    /// Serialises the name check with the store insert
    admit: Mutex<()>,
    unload_grace: Duration,
    cache_identities: bool,
}

impl Loader {
    pub fn new(
        config: &HostConfig,
        validator: Arc<Validator>,
        types: Arc<RwLock<TypeRegistry>>,
    ) -> Self {
        Self {
            mask: config.mechanisms,
            native: NativeMechanism::new(Arc::clone(&validator), config.build.source_extension.clone()),
            rpc: RpcMechanism::new(validator, config, types),
            native_store: PluginStore::new(),
            rpc_store: PluginStore::new(),
            next_id: AtomicU64::new(1),
            admit: Mutex::new(()),
            unload_grace: config.unload_grace,
            cache_identities: config.cache_identities,
        }
    }

    /// Mechanisms enabled for this host
    pub fn mask(&self) -> Capabilities {
        self.mask
    }

    fn next_id(&self) -> PluginId {
        PluginId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn store(&self, mechanism: Mechanism) -> &PluginStore {
        match mechanism {
            Mechanism::Native => &self.native_store,
            Mechanism::Rpc => &self.rpc_store,
        }
    }

    fn accepts(&self, mechanism: Mechanism, path: &Path) -> bool {
        match mechanism {
            Mechanism::Native => self.native.accepts(path),
            Mechanism::Rpc => self.rpc.accepts(path),
        }
    }

    /// Load, store and initialise the plugin at `path`.
    ///
    /// `mask` narrows the host's mechanisms for this call. If `initialise`
    /// fails the handle stays stored, marked FAILED, and the error is returned.
    pub async fn load(&self, path: &Path, mask: Capabilities) -> Result<LoadOutcome> {
        let mut last_error = None;
        for mechanism in [Mechanism::Native, Mechanism::Rpc] {
            let active = match mechanism {
                Mechanism::Native => self.mask.native && mask.native,
                Mechanism::Rpc => self.mask.rpc && mask.rpc,
            };
            if !active || !self.accepts(mechanism, path) {
                continue;
            }
            match self.load_with(mechanism, path).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    tracing::debug!(path = %path.display(), %mechanism, error = %e, "Mechanism failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| PluginHostError::Unsupported {
            path: path.to_path_buf(),
        }))
    }

    async fn load_with(&self, mechanism: Mechanism, path: &Path) -> Result<LoadOutcome> {
        let id = self.next_id();
        let handle = match mechanism {
            Mechanism::Native => self.native.load(id, path)?,
            Mechanism::Rpc => {
                if let Ok(canonical) = std::fs::canonicalize(path)
                    && self.rpc_store.get_path(&canonical).is_some()
                {
                    return Err(PluginHostError::Duplicate {
                        key: canonical.display().to_string(),
                    });
                }
                self.rpc.load(id, path).await?
            }
        };
        self.insert(Arc::new(handle), mechanism == Mechanism::Native).await
    }

    /// Register a plugin linked into the host
    pub async fn register_static(&self, plugin: Arc<dyn Plugin>) -> Result<LoadOutcome> {
        if !self.mask.native {
            return Err(PluginHostError::Config(
                "native mechanism is disabled".to_string(),
            ));
        }
        let handle = self.native.load_static(self.next_id(), plugin)?;
        self.insert(Arc::new(handle), false).await
    }

    /// Store first, then initialise.
    ///
    /// Native stores replace on reload; RPC stores refuse duplicates. A name
    /// already held under another key, in either store, is refused.
    async fn insert(&self, handle: Arc<PluginHandle>, force: bool) -> Result<LoadOutcome> {
        let store = self.store(handle.mechanism());
        let admitted = {
            let _admit = self.admit.lock().unwrap_or_else(PoisonError::into_inner);
            self.check_name(&handle)
                .and_then(|()| store.put(Arc::clone(&handle), force))
        };
        match admitted {
            Ok(Some(replaced)) => {
                tracing::info!(plugin = %replaced.logger(), "Replacing previously loaded plugin");
                if let Err(e) = replaced.unload(self.unload_grace).await {
                    tracing::warn!(plugin = %replaced.logger(), error = %e, "Replaced plugin did not unload cleanly");
                }
            }
            Ok(None) => {}
            Err(e) => {
                if let Err(unload) = handle.unload(self.unload_grace).await {
                    tracing::debug!(plugin = %handle.logger(), error = %unload, "Discarding duplicate");
                }
                return Err(e);
            }
        }

        let prefix = handle.logger().to_string();
        let mut warnings: Vec<Diagnostic> = handle
            .warnings()
            .iter()
            .map(|w| Diagnostic::warning(ErrorKind::Validation, &prefix, w))
            .collect();

        match handle
            .invoke_lifecycle(CallbackKind::Initialise, Vec::new())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_warning() => warnings.push(e.diagnostic(&prefix)),
            Err(e) => return Err(e),
        }

        if self.cache_identities && handle.key().is_absolute() {
            let cache = handle.key().with_extension("json");
            if let Err(e) = handle.identity().save_identity(&cache) {
                tracing::warn!(plugin = %prefix, path = %cache.display(), error = %e, "Failed to cache identity");
            }
        }

        Ok(LoadOutcome { handle, warnings })
    }

    fn check_name(&self, handle: &PluginHandle) -> Result<()> {
        match self
            .get_all()
            .into_iter()
            .find(|other| other.name() == handle.name() && other.key() != handle.key())
        {
            Some(other) => Err(PluginHostError::DuplicateName {
                name: handle.name().to_string(),
                existing: other.key().display().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Remove from its store, then retire the handle
    pub async fn unload(&self, key: &str) -> Result<Arc<PluginHandle>> {
        let handle = self.get(key)?;
        self.store(handle.mechanism()).remove(handle.key())?;
        handle.unload(self.unload_grace).await?;
        Ok(handle)
    }

    /// Unload everything; every failure is reported, none stops the loop
    pub async fn unload_all(&self) -> Vec<(String, PluginHostError)> {
        let mut failures = Vec::new();
        for handle in self.get_all() {
            let key = handle.key().display().to_string();
            if let Err(e) = self.unload(&key).await {
                tracing::warn!(plugin = %handle.logger(), error = %e, "Unload failed");
                failures.push((key, e));
            }
        }
        failures
    }

    /// By canonical path or declared name, native store first
    pub fn get(&self, key: &str) -> Result<Arc<PluginHandle>> {
        self.native_store
            .get(key)
            .or_else(|_| self.rpc_store.get(key))
    }

    pub fn get_path(&self, path: &Path) -> Option<Arc<PluginHandle>> {
        self.native_store
            .get_path(path)
            .or_else(|| self.rpc_store.get_path(path))
    }

    pub fn get_all(&self) -> Vec<Arc<PluginHandle>> {
        let mut all = self.native_store.get_all();
        all.extend(self.rpc_store.get_all());
        all
    }

    pub fn size(&self) -> usize {
        self.native_store.size() + self.rpc_store.size()
    }

    pub fn is_valid(&self) -> bool {
        self.native_store.is_valid() && self.rpc_store.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goplug_plugin_api::{HookRegistry, Identity, PluginContext, PluginError, Value};

    struct Greeter {
        name: &'static str,
        fail_init: bool,
    }

    fn ok(_ctx: &PluginContext, _args: &[Value]) -> std::result::Result<(), PluginError> {
        Ok(())
    }

    fn bad(_ctx: &PluginContext, _args: &[Value]) -> std::result::Result<(), PluginError> {
        Err(PluginError::custom("init exploded"))
    }

    impl Plugin for Greeter {
        fn identity(&self) -> Identity {
            let init = if self.fail_init { bad } else { ok };
            Identity::new(self.name, "1.0.0")
                .maintainer("x@y")
                .description("greets")
                .repository("r")
                .native()
                .on(CallbackKind::Initialise, "Init", init)
        }

        fn register_hooks(&self, hooks: &HookRegistry) {
            hooks.register("Greet", |_: &PluginContext, _: &[Value]| Ok(Value::Nil), Vec::<&str>::new());
        }
    }

    fn loader() -> Loader {
        Loader::new(
            &HostConfig::default(),
            Arc::new(Validator::new()),
            Arc::new(RwLock::new(TypeRegistry::new())),
        )
    }

    fn greeter(name: &'static str) -> Arc<dyn Plugin> {
        Arc::new(Greeter {
            name,
            fail_init: false,
        })
    }

    #[tokio::test]
    async fn test_static_register_initialises() {
        let loader = loader();
        let outcome = loader.register_static(greeter("hello")).await.unwrap();
        assert_eq!(outcome.handle.state(), crate::LifecycleState::Initialized);
        // Only the "no source declared" validation warning
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].is_warning());
        assert_eq!(loader.size(), 1);
        assert!(loader.get("hello").is_ok());
    }

    #[tokio::test]
    async fn test_static_duplicate_is_refused() {
        let loader = loader();
        loader.register_static(greeter("hello")).await.unwrap();
        let err = loader.register_static(greeter("hello")).await.unwrap_err();
        assert!(matches!(err, PluginHostError::Duplicate { .. }));
        assert_eq!(loader.size(), 1);
    }

    #[tokio::test]
    async fn test_failed_initialise_keeps_handle_stored() {
        let loader = loader();
        let err = loader
            .register_static(Arc::new(Greeter {
                name: "broken",
                fail_init: true,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginHostError::CallbackFailed { .. }));
        let handle = loader.get("broken").unwrap();
        assert_eq!(handle.state(), crate::LifecycleState::Failed);
        assert!(handle.values().get("native-init").is_some());
    }

    #[tokio::test]
    async fn test_unload_removes_from_store() {
        let loader = loader();
        loader.register_static(greeter("a")).await.unwrap();
        loader.register_static(greeter("b")).await.unwrap();
        let handle = loader.unload("a").await.unwrap();
        assert_eq!(handle.state(), crate::LifecycleState::Unloaded);
        assert!(matches!(
            loader.get("a").unwrap_err(),
            PluginHostError::NotFound { .. }
        ));
        assert_eq!(loader.size(), 1);
        assert!(loader.unload_all().await.is_empty());
        assert_eq!(loader.size(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("goplug-readme.txt");
        std::fs::write(&path, "hi").unwrap();
        let err = loader().load(&path, Capabilities::BOTH).await.unwrap_err();
        assert!(matches!(err, PluginHostError::Unsupported { .. }));
    }
}
