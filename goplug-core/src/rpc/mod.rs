//! RPC mechanism: plugins as supervised child processes
//!
//! Loading spawns the executable, verifies the handshake line it prints,
//! connects to the announced address, and asks the child who it is. From then
//! on a supervisor task owns the process; see [`client`].

mod client;
mod process;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use goplug_plugin_api::rpc::HandshakeConfig;
use goplug_plugin_api::{HookRegistry, PluginId, TypeRegistry};

pub use client::{ChildStatus, RpcClient};

use crate::config::HostConfig;
use crate::error::{PluginHostError, Result};
use crate::handle::{Backend, HandleParts, PluginHandle};
use crate::lifecycle::{LifecycleState, Mechanism, StateCell};
use crate::native::is_library;
use crate::services::{RpcService, ServiceRegistry};
use crate::validate::{ValidationContext, Validator};

/// Whether `path` is an executable regular file
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        path.extension()
            .is_some_and(|ext| ext == std::env::consts::EXE_EXTENSION)
    }
}

pub struct RpcMechanism {
    validator: Arc<Validator>,
    handshake: HandshakeConfig,
    startup_timeout: Duration,
    call_timeout: Option<Duration>,
    unload_grace: Duration,
    source_extension: String,
    /// User types the host accepts on the wire, shared by every RPC handle
    types: Arc<RwLock<TypeRegistry>>,
}

impl RpcMechanism {
    pub fn new(
        validator: Arc<Validator>,
        config: &HostConfig,
        types: Arc<RwLock<TypeRegistry>>,
    ) -> Self {
        Self {
            validator,
            handshake: config.handshake.clone(),
            startup_timeout: config.startup_timeout,
            call_timeout: config.call_timeout,
            unload_grace: config.unload_grace,
            source_extension: config.build.source_extension.clone(),
            types,
        }
    }

    /// Executables that are not libraries, identity caches or sources
    pub fn accepts(&self, path: &Path) -> bool {
        let skipped = path.extension().is_some_and(|ext| {
            ext == "json" || ext == self.source_extension.as_str()
        });
        !skipped && !is_library(path) && is_executable(path)
    }

    /// Spawn the child at `path` and bind it to a LOADED handle.
    ///
    /// A child that fails after the handshake is shut down before the error
    /// is returned.
    pub async fn load(&self, id: PluginId, path: &Path) -> Result<PluginHandle> {
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            PluginHostError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            ))
        })?;
        if !is_executable(&canonical) {
            return Err(PluginHostError::Unsupported { path: canonical });
        }

        let stem = canonical
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let logger = format!("{stem}[rpc]");

        let launched =
            process::launch(&canonical, &logger, &self.handshake, self.startup_timeout).await?;
        tracing::debug!(
            plugin = %logger,
            protocol = %launched.line.protocol,
            pid = ?launched.child.id(),
            "Child started"
        );

        let state = Arc::new(StateCell::new(LifecycleState::Discovered));
        let client = RpcClient::start(
            logger.clone(),
            launched.child,
            launched.channel,
            self.call_timeout,
            self.unload_grace,
            Arc::clone(&state),
        );

        let bound = tokio::time::timeout(
            self.startup_timeout,
            self.bind(id, canonical.clone(), client.clone(), state),
        )
        .await
        .unwrap_or_else(|_| {
            Err(PluginHostError::Handshake {
                path: canonical.clone(),
                reason: format!("no identity within {:?}", self.startup_timeout),
            })
        });

        match bound {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::warn!(plugin = %logger, error = %e, "Rejecting RPC plugin");
                client.shutdown(self.unload_grace).await;
                Err(e)
            }
        }
    }

    async fn bind(
        &self,
        id: PluginId,
        path: PathBuf,
        client: RpcClient,
        state: Arc<StateCell>,
    ) -> Result<PluginHandle> {
        let identity = client.identify("").await?;
        let service_names = client.list_services().await?;

        let ctx = ValidationContext::new(path.parent(), Some(Mechanism::Rpc));
        let report = self.validator.validate(&identity, &ctx);
        if !report.is_ok() {
            return Err(PluginHostError::BadIdentity {
                path,
                errors: report.errors,
            });
        }
        for warning in &report.warnings {
            tracing::warn!(plugin = %identity.name, path = %path.display(), "{}", warning);
        }

        let mut services = ServiceRegistry::new();
        services.set_identity(identity.name.clone());
        for name in &service_names {
            services.set_rpc(
                name.clone(),
                RpcService {
                    name: name.clone(),
                    client: client.clone(),
                },
            );
        }
        services.as_rpc_plugin_set(identity.types.rpc)?;

        let default_service = service_names.first().cloned().unwrap_or_default();
        let remote_hooks = client.get_data(&default_service).await?.hooks;
        let source = path.with_extension(&self.source_extension);
        let source_path = source.exists().then_some(source);

        let mut handle = PluginHandle::new(HandleParts {
            id,
            key: path.clone(),
            compiled_path: path,
            source_path,
            identity,
            hooks: Arc::new(HookRegistry::new(id)),
            services,
            backend: Backend::Rpc {
                client,
                service: default_service,
                types: Arc::clone(&self.types),
                hooks: remote_hooks,
            },
            state: Arc::clone(&state),
            warnings: report.warnings,
        });
        handle.validate()?;
        if let Err(current) = state.transition(LifecycleState::Loaded) {
            // The child died between the handshake and here
            return Err(PluginHostError::ChildCrash {
                name: handle.logger().to_string(),
                status: format!("plugin is {current}"),
            });
        }

        tracing::info!(
            plugin = %handle.logger(),
            version = %handle.identity().version,
            services = handle.services().count(),
            hooks = handle.hook_count(),
            pid = ?handle.pid(),
            "Plugin loaded"
        );
        Ok(handle)
    }
}
