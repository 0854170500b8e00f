//! Per-plugin service registry
//!
//! A native plugin carries one in-process service named after its identity.
//! An RPC plugin carries one entry per service the child announced, all
//! sharing the same client.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use goplug_plugin_api::Plugin;

use crate::error::{PluginHostError, Result};
use crate::rpc::RpcClient;

/// A resolved in-process entry point
#[derive(Clone)]
pub struct NativeService {
    /// Symbol the instance came from, or `<static>` for linked plugins
    pub symbol: String,
    pub plugin: Arc<dyn Plugin>,
}

impl fmt::Debug for NativeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeService")
            .field("symbol", &self.symbol)
            .finish_non_exhaustive()
    }
}

/// A service reachable over a plugin's RPC channel
#[derive(Debug, Clone)]
pub struct RpcService {
    pub name: String,
    pub client: RpcClient,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    identity: OnceLock<String>,
    inproc: BTreeMap<String, NativeService>,
    rpc: BTreeMap<String, RpcService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the owning plugin; set once during validation
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    pub fn set_identity(&self, name: impl Into<String>) {
        let _ = self.identity.set(name.into());
    }

    pub fn set_inproc(&mut self, name: impl Into<String>, service: NativeService) {
        self.inproc.insert(name.into(), service);
    }

    pub fn get_inproc(&self, name: &str) -> Option<&NativeService> {
        self.inproc.get(name)
    }

    pub fn set_rpc(&mut self, name: impl Into<String>, service: RpcService) {
        self.rpc.insert(name.into(), service);
    }

    pub fn get_rpc(&self, name: &str) -> Option<&RpcService> {
        self.rpc.get(name)
    }

    /// First in-process service, if any
    pub fn default_inproc(&self) -> Option<&NativeService> {
        self.identity()
            .and_then(|name| self.inproc.get(name))
            .or_else(|| self.inproc.values().next())
    }

    pub fn count(&self) -> usize {
        self.inproc.len() + self.rpc.len()
    }

    /// All service names, in-process first
    pub fn names(&self) -> Vec<String> {
        self.inproc.keys().chain(self.rpc.keys()).cloned().collect()
    }

    /// The RPC services in the shape the channel client needs.
    ///
    /// Fails with `NO_SERVICES` when `supports_rpc` is declared and nothing
    /// was registered.
    pub fn as_rpc_plugin_set(&self, supports_rpc: bool) -> Result<&BTreeMap<String, RpcService>> {
        if supports_rpc && self.rpc.is_empty() {
            return Err(PluginHostError::NoServices {
                name: self.identity().unwrap_or_default().to_string(),
            });
        }
        Ok(&self.rpc)
    }
}
