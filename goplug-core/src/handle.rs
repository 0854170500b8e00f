//! The unified plugin handle
//!
//! Callers never see which mechanism loaded a plugin. Every operation branches
//! on [`Backend`] at its own boundary: native hooks and callbacks run on a
//! blocking thread inside the host, RPC ones are forwarded to the child.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use goplug_plugin_api::rpc::DynamicData;
use goplug_plugin_api::{
    Callback, CallbackKind, HookInfo, HookRegistry, HookResponse, Identity, Plugin, PluginContext,
    PluginId, TypeRegistry, Value, ValueBag,
};
use libloading::Library;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{PluginHostError, Result};
use crate::lifecycle::{LifecycleState, Mechanism, StateCell};
use crate::rpc::RpcClient;
use crate::services::ServiceRegistry;

/// Value written under a lifecycle key when the callback succeeded
pub const STATUS_OK: &str = "OK";
/// Value written under the run key when unload interrupted the task
pub const STATUS_CANCELLED: &str = "cancelled";

/// Value-bag key holding the outcome of `kind`, e.g. `native-init`
pub fn status_key(mechanism: Mechanism, kind: CallbackKind) -> String {
    format!("{}-{}", mechanism.as_str(), kind.short())
}

/// Value-bag key holding when `kind` was last invoked, e.g. `rpc-run-timestamp`
pub fn timestamp_key(mechanism: Mechanism, kind: CallbackKind) -> String {
    format!("{}-{}-timestamp", mechanism.as_str(), kind.short())
}

/// Mechanism-specific half of a handle
pub(crate) enum Backend {
    Native {
        plugin: Arc<dyn Plugin>,
        /// `None` for plugins linked into the host
        library: Option<Arc<Library>>,
    },
    Rpc {
        client: RpcClient,
        /// Service the child answers by default
        service: String,
        /// Host-side declarations of user types allowed on the wire
        types: Arc<RwLock<TypeRegistry>>,
        /// Hooks the child reported at load
        hooks: Vec<HookInfo>,
    },
}

impl Backend {
    fn mechanism(&self) -> Mechanism {
        match self {
            Self::Native { .. } => Mechanism::Native,
            Self::Rpc { .. } => Mechanism::Rpc,
        }
    }
}

/// Everything a mechanism hands over to build a handle
pub(crate) struct HandleParts {
    pub id: PluginId,
    pub key: PathBuf,
    pub compiled_path: PathBuf,
    pub source_path: Option<PathBuf>,
    pub identity: Identity,
    pub hooks: Arc<HookRegistry>,
    pub services: ServiceRegistry,
    pub backend: Backend,
    pub state: Arc<StateCell>,
    pub warnings: Vec<String>,
}

/// Diagnostic rendering of a handle
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub id: PluginId,
    pub key: PathBuf,
    pub mechanism: Mechanism,
    pub state: LifecycleState,
    pub logger: String,
    /// Backed by a shared library that stays mapped
    pub resident: bool,
    pub identity: Identity,
    pub services: Vec<String>,
    pub hooks: Vec<HookInfo>,
    /// Host-side value bag
    pub values: BTreeMap<String, Value>,
    /// Value bag and declared types reported by an RPC child
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<DynamicData>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A loaded plugin
pub struct PluginHandle {
    id: PluginId,
    key: PathBuf,
    identity: Identity,
    services: ServiceRegistry,
    hooks: Arc<HookRegistry>,
    values: Arc<ValueBag>,
    context: PluginContext,
    source_path: Option<PathBuf>,
    compiled_path: PathBuf,
    logger: String,
    configured: AtomicBool,
    state: Arc<StateCell>,
    /// Serializes initialise, other lifecycle callbacks and unload
    lifecycle: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    run_tasks: Mutex<Vec<JoinHandle<()>>>,
    warnings: Vec<String>,
    backend: Backend,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("name", &self.identity.name)
            .field("mechanism", &self.mechanism())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    pub(crate) fn new(parts: HandleParts) -> Self {
        let cancel = CancellationToken::new();
        let values = Arc::new(ValueBag::new());
        let dir = parts
            .compiled_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let context = PluginContext::new(
            parts.id,
            parts.identity.name.clone(),
            dir,
            Arc::clone(&parts.hooks),
            Arc::clone(&values),
        )
        .with_cancellation(cancel.child_token());

        Self {
            id: parts.id,
            key: parts.key,
            identity: parts.identity,
            services: parts.services,
            hooks: parts.hooks,
            values,
            context,
            source_path: parts.source_path,
            compiled_path: parts.compiled_path,
            logger: String::new(),
            configured: AtomicBool::new(false),
            state: parts.state,
            lifecycle: tokio::sync::Mutex::new(()),
            cancel,
            run_tasks: Mutex::new(Vec::new()),
            warnings: parts.warnings,
            backend: parts.backend,
        }
    }

    /// Fill in defaults and propagate the identity name.
    ///
    /// Creates the logger name if missing, falls back to the running
    /// executable for the compiled path, and hands the name to the service and
    /// hook registries. Only the first successful call has any effect.
    pub fn validate(&mut self) -> Result<()> {
        if self.configured.load(Ordering::Acquire) {
            return Ok(());
        }
        let name = self.identity.name.trim();
        if name.is_empty() {
            return Err(PluginHostError::Structural(format!(
                "plugin at {} has no name",
                self.key.display()
            )));
        }
        if self.logger.is_empty() {
            self.logger = format!("{}[{}]", name, self.mechanism());
        }
        if self.compiled_path.as_os_str().is_empty()
            && let Some(argv0) = std::env::args_os().next()
        {
            self.compiled_path = PathBuf::from(argv0);
        }
        self.services.set_identity(name);
        self.hooks.set_identity(name);
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    /// Server loop. Only an RPC child serves; on the host this returns at once.
    pub fn serve(&self) {
        tracing::trace!(plugin = %self.logger, "serve is a no-op on the host");
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    /// Store key: canonical artifact path, or `<static>/<name>`
    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn mechanism(&self) -> Mechanism {
        self.backend.mechanism()
    }

    /// Identity as validated at load time
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn logger(&self) -> &str {
        &self.logger
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn compiled_path(&self) -> &Path {
        &self.compiled_path
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Local hook table. Empty for RPC plugins, whose hooks live in the child.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Number of hooks the plugin exposes, wherever they live
    pub fn hook_count(&self) -> usize {
        match &self.backend {
            Backend::Native { .. } => self.hooks.count(),
            Backend::Rpc { hooks, .. } => hooks.len(),
        }
    }

    pub fn values(&self) -> &Arc<ValueBag> {
        &self.values
    }

    /// Warnings the validator attached at load time
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Channel supervisor of an RPC handle
    pub fn rpc_client(&self) -> Option<&RpcClient> {
        match &self.backend {
            Backend::Rpc { client, .. } => Some(client),
            Backend::Native { .. } => None,
        }
    }

    /// OS process id of an RPC child
    pub fn pid(&self) -> Option<u32> {
        match &self.backend {
            Backend::Rpc { client, .. } => client.pid(),
            Backend::Native { .. } => None,
        }
    }

    /// Copy of the identity. RPC handles ask the child.
    pub async fn identify(&self) -> Result<Identity> {
        match &self.backend {
            Backend::Native { .. } => Ok(self.identity.clone()),
            Backend::Rpc { client, .. } => {
                self.ensure_callable()?;
                client.identify(self.service_name()).await
            }
        }
    }

    /// Identity as pretty JSON. RPC handles ask the child.
    pub async fn identify_string(&self) -> Result<String> {
        match &self.backend {
            Backend::Native { .. } => Ok(self.identity.to_json_pretty().map_err(|e| {
                PluginHostError::Serialization(e.to_string())
            })?),
            Backend::Rpc { client, .. } => {
                self.ensure_callable()?;
                client.identify_string(self.service_name()).await
            }
        }
    }

    /// Values, hooks and declared types as the plugin sees them
    pub async fn get_data(&self) -> Result<DynamicData> {
        match &self.backend {
            Backend::Native { plugin, .. } => {
                let mut types = TypeRegistry::new();
                plugin.declare_types(&mut types);
                let mut names: Vec<String> = types.names().map(String::from).collect();
                names.sort();
                Ok(DynamicData {
                    values: self.values.snapshot(),
                    hooks: self.hooks.list(),
                    types: names,
                })
            }
            Backend::Rpc { client, .. } => {
                self.ensure_callable()?;
                client.get_data(self.service_name()).await
            }
        }
    }

    fn service_name(&self) -> &str {
        match &self.backend {
            Backend::Rpc { service, .. } => service,
            Backend::Native { .. } => self.services.identity().unwrap_or_default(),
        }
    }

    /// Refuse calls into a handle that can no longer answer
    fn ensure_callable(&self) -> Result<()> {
        match self.state.get() {
            LifecycleState::Unloaded => Err(PluginHostError::not_found(self.key.display().to_string())),
            LifecycleState::Failed if self.mechanism() == Mechanism::Rpc => {
                Err(PluginHostError::ChannelClosed {
                    name: self.logger.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Call a hook by name.
    ///
    /// Arity and argument types are checked against the registered signature
    /// before the hook runs; for RPC plugins user types must also be declared
    /// on the host.
    pub async fn call_hook(&self, name: &str, args: Vec<Value>) -> Result<HookResponse> {
        self.ensure_callable()?;
        match &self.backend {
            Backend::Native { .. } => {
                let ctx = self.context.clone();
                let hook = name.to_string();
                let result =
                    tokio::task::spawn_blocking(move || ctx.hooks().call(&ctx, &hook, &args)).await;
                match result {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(PluginHostError::from_hook(self.name(), name, e)),
                    Err(join) => {
                        tracing::error!(plugin = %self.logger, hook = %name, "Hook panicked");
                        Err(self.join_failure(&join, &format!("hook {name}")))
                    }
                }
            }
            Backend::Rpc { client, types, .. } => {
                types
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .check_all(&args)?;
                let response = client.call_hook(self.service_name(), name, args).await?;
                types
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .check(&response.value)?;
                Ok(response)
            }
        }
    }

    /// Hooks as the plugin reports them
    pub async fn hook_list(&self) -> Result<Vec<HookInfo>> {
        match &self.backend {
            Backend::Native { .. } => Ok(self.hooks.list()),
            Backend::Rpc { .. } => Ok(self.get_data().await?.hooks),
        }
    }

    fn join_failure(&self, join: &tokio::task::JoinError, during: &str) -> PluginHostError {
        if join.is_panic() {
            PluginHostError::Panicked {
                name: self.name().to_string(),
                during: during.to_string(),
            }
        } else {
            PluginHostError::RunTaskFailed {
                name: self.name().to_string(),
                message: join.to_string(),
            }
        }
    }

    /// Invoke a lifecycle callback.
    ///
    /// A missing callback yields `CALLBACK_NOT_DEFINED`, a warning; for
    /// `initialise` the handle still moves to INITIALIZED. Otherwise the
    /// invocation time and outcome are written to the value bag. `run` returns
    /// as soon as its task is spawned.
    pub async fn invoke_lifecycle(&self, kind: CallbackKind, args: Vec<Value>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_callable()?;

        let Some(callback) = self.callback(kind) else {
            let warning = PluginHostError::CallbackNotDefined {
                name: self.name().to_string(),
                kind,
            };
            tracing::warn!(plugin = %self.logger, %kind, "{}", warning);
            if kind == CallbackKind::Initialise {
                self.mark_initialized();
            }
            return Err(warning);
        };

        let mechanism = self.mechanism();
        self.values
            .set(timestamp_key(mechanism, kind), Utc::now().to_rfc3339());
        tracing::debug!(plugin = %self.logger, %kind, callback = %callback.name(), "Invoking callback");

        if kind == CallbackKind::Run {
            self.spawn_run(callback, args);
            return Ok(());
        }

        let result = self.run_callback(kind, &callback, args).await;
        let status = match &result {
            Ok(()) => STATUS_OK.to_string(),
            Err(e) => e.to_string(),
        };
        self.values.set(status_key(mechanism, kind), status);

        match (&result, kind) {
            (Ok(()), CallbackKind::Initialise) => self.mark_initialized(),
            (Err(e), CallbackKind::Initialise) => {
                tracing::error!(plugin = %self.logger, error = %e, "Initialise failed");
                self.mark_failed();
            }
            (Err(e), _) => {
                tracing::warn!(plugin = %self.logger, %kind, error = %e, "Callback failed");
            }
            _ => {}
        }
        result
    }

    /// The callback for `kind`, if this mechanism can run it
    fn callback(&self, kind: CallbackKind) -> Option<Callback> {
        let callback = self.identity.callbacks.get(kind)?;
        match self.backend {
            Backend::Native { .. } if !callback.is_bound() => None,
            _ => Some(callback.clone()),
        }
    }

    async fn run_callback(&self, kind: CallbackKind, callback: &Callback, args: Vec<Value>) -> Result<()> {
        match &self.backend {
            Backend::Native { .. } => {
                let Some(func) = callback.func() else {
                    return Err(PluginHostError::CallbackNotDefined {
                        name: self.name().to_string(),
                        kind,
                    });
                };
                let ctx = self.context.clone();
                match tokio::task::spawn_blocking(move || func(&ctx, &args)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(PluginHostError::from_plugin(self.name(), kind, e)),
                    Err(join) => Err(self.join_failure(&join, kind.as_str())),
                }
            }
            Backend::Rpc { client, .. } => client.lifecycle(self.service_name(), kind, args).await,
        }
    }

    fn spawn_run(&self, callback: Callback, args: Vec<Value>) {
        let mechanism = self.mechanism();
        let key = status_key(mechanism, CallbackKind::Run);
        let values = Arc::clone(&self.values);
        let logger = self.logger.clone();
        let name = self.name().to_string();
        let cancel = self.cancel.clone();

        let work: futures_util::future::BoxFuture<'static, Result<()>> = match &self.backend {
            Backend::Native { .. } => {
                let ctx = self.context.clone();
                let func = callback.func();
                let name = name.clone();
                Box::pin(async move {
                    let Some(func) = func else {
                        return Err(PluginHostError::CallbackNotDefined {
                            name,
                            kind: CallbackKind::Run,
                        });
                    };
                    match tokio::task::spawn_blocking(move || func(&ctx, &args)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(PluginHostError::from_plugin(&name, CallbackKind::Run, e)),
                        Err(join) if join.is_panic() => Err(PluginHostError::Panicked {
                            name,
                            during: CallbackKind::Run.as_str().to_string(),
                        }),
                        Err(join) => Err(PluginHostError::RunTaskFailed {
                            name,
                            message: join.to_string(),
                        }),
                    }
                })
            }
            Backend::Rpc { client, .. } => {
                let client = client.clone();
                let service = self.service_name().to_string();
                Box::pin(async move {
                    tokio::select! {
                        result = client.lifecycle(&service, CallbackKind::Run, args) => result,
                        _ = cancel.cancelled() => Ok(()),
                    }
                })
            }
        };

        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let result = work.await;
            let status = match result {
                Ok(()) if cancel.is_cancelled() => STATUS_CANCELLED.to_string(),
                Ok(()) => STATUS_OK.to_string(),
                Err(e) => {
                    let failure = PluginHostError::RunTaskFailed {
                        name,
                        message: e.to_string(),
                    };
                    tracing::error!(plugin = %logger, error = %failure, "Run task failed");
                    failure.to_string()
                }
            };
            values.set(key, status);
        });

        let mut tasks = self.run_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn mark_initialized(&self) {
        if let Err(current) = self.state.transition(LifecycleState::Initialized) {
            tracing::debug!(plugin = %self.logger, state = %current, "Not marking initialized");
        }
    }

    pub(crate) fn mark_failed(&self) {
        if let Err(current) = self.state.transition(LifecycleState::Failed) {
            tracing::debug!(plugin = %self.logger, state = %current, "Not marking failed");
        }
    }

    /// Number of `run` tasks still in flight
    pub fn running_tasks(&self) -> usize {
        self.run_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }

    /// Retire the handle.
    ///
    /// Cancels the handle's signal, stops an RPC child (graceful `Shutdown`,
    /// then kill after `grace`), and waits for every `run` task. A native
    /// library stays mapped; reloading the same path reuses its symbols.
    pub async fn unload(&self, grace: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state.transition(LifecycleState::Unloaded) {
            Ok(LifecycleState::Unloaded) => return Ok(()),
            Ok(previous) => {
                tracing::debug!(plugin = %self.logger, from = %previous, "Unloading");
            }
            Err(current) => {
                return Err(PluginHostError::Structural(format!(
                    "cannot unload '{}' while {current}",
                    self.name()
                )));
            }
        }

        self.cancel.cancel();
        if let Backend::Rpc { client, .. } = &self.backend {
            client.shutdown(grace).await;
        }

        let tasks = std::mem::take(&mut *self.run_tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(plugin = %self.logger, error = %e, "Run task ended abnormally");
            }
        }
        tracing::info!(plugin = %self.logger, "Plugin unloaded");
        Ok(())
    }

    /// Identity, state, hooks and value bag, for diagnostics
    pub async fn snapshot(&self) -> PluginSnapshot {
        let (hooks, remote) = match &self.backend {
            Backend::Native { .. } => (self.hooks.list(), None),
            Backend::Rpc { .. } => match self.get_data().await {
                Ok(data) => (data.hooks.clone(), Some(data)),
                Err(e) => {
                    tracing::debug!(plugin = %self.logger, error = %e, "No remote data for snapshot");
                    (Vec::new(), None)
                }
            },
        };
        PluginSnapshot {
            id: self.id,
            key: self.key.clone(),
            mechanism: self.mechanism(),
            state: self.state.get(),
            logger: self.logger.clone(),
            resident: matches!(&self.backend, Backend::Native { library: Some(_), .. }),
            identity: self.identity.clone(),
            services: self.services.names(),
            hooks,
            values: self.values.snapshot(),
            remote,
            warnings: self.warnings.clone(),
        }
    }
}
