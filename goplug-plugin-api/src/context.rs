//! PluginContext - a plugin's view of its own host-side state

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PluginError;
use crate::hooks::{HookRegistry, HookResponse};
use crate::value::Value;

/// Arena index of a loaded plugin.
///
/// Hooks and contexts refer to their plugin by id rather than by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PluginId(pub u64);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-plugin key-value scratch state.
///
/// Used for lifecycle telemetry and plugin-local configuration. Reads and
/// writes are serialized by a single mutex; nothing expires or persists.
#[derive(Debug, Default)]
pub struct ValueBag {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl ValueBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    /// Store a value, returning the previous one
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.lock().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every entry, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock().clone()
    }
}

/// Passed to every hook and lifecycle callback.
///
/// Cheap to clone; all state is shared with the owning plugin handle.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: PluginId,
    plugin_name: String,
    plugin_dir: PathBuf,
    hooks: Arc<HookRegistry>,
    values: Arc<ValueBag>,
    cancel: CancellationToken,
}

impl PluginContext {
    pub fn new(
        plugin_id: PluginId,
        plugin_name: impl Into<String>,
        plugin_dir: PathBuf,
        hooks: Arc<HookRegistry>,
        values: Arc<ValueBag>,
    ) -> Self {
        Self {
            plugin_id,
            plugin_name: plugin_name.into(),
            plugin_dir,
            hooks,
            values,
            cancel: CancellationToken::new(),
        }
    }

    /// Builder: wire in the owning handle's cancellation signal
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Directory the plugin was loaded from
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn values(&self) -> &Arc<ValueBag> {
        &self.values
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.get(key)
    }

    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.set(key, value);
    }

    /// Invoke a peer hook of the same plugin
    pub fn call_hook(&self, name: &str, args: &[Value]) -> Result<HookResponse, PluginError> {
        self.hooks.call(self, name, args)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Err(Cancelled)` once the host asked the plugin to stop
    pub fn check_cancelled(&self) -> Result<(), PluginError> {
        if self.is_cancelled() {
            Err(PluginError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ─── Logging ─────────────────────────────────────────────────────

    /// Log an info message
    pub fn log_info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin_name, "{}", message);
    }

    /// Log a warning message
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin_name, "{}", message);
    }

    /// Log an error message
    pub fn log_error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin_name, "{}", message);
    }

    /// Log a debug message
    pub fn log_debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin_name, "{}", message);
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_name", &self.plugin_name)
            .field("plugin_dir", &self.plugin_dir)
            .field("hooks", &self.hooks.count())
            .field("values", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PluginContext {
        let hooks = Arc::new(HookRegistry::new(PluginId(1)));
        PluginContext::new(
            PluginId(1),
            "test",
            PathBuf::from("/tmp/test"),
            hooks,
            Arc::new(ValueBag::new()),
        )
    }

    #[test]
    fn test_value_bag_set_returns_previous() {
        let bag = ValueBag::new();
        assert!(bag.set("k", 1).is_none());
        assert_eq!(bag.set("k", 2), Some(Value::Int(1)));
        assert_eq!(bag.get("k"), Some(Value::Int(2)));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn test_value_bag_snapshot_is_ordered() {
        let bag = ValueBag::new();
        bag.set("b", "2");
        bag.set("a", "1");
        let keys: Vec<_> = bag.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_context_shares_value_bag() {
        let ctx = context();
        let clone = ctx.clone();
        ctx.set_value("greeting", "hi");
        assert_eq!(clone.value("greeting"), Some(Value::from("hi")));
        assert_eq!(ctx.plugin_dir(), Path::new("/tmp/test"));
    }

    #[test]
    fn test_cancellation_is_observed() {
        let token = CancellationToken::new();
        let ctx = context().with_cancellation(token.clone());
        assert!(ctx.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(PluginError::Cancelled)));
    }

    #[test]
    fn test_peer_hook_call() {
        let ctx = context();
        ctx.hooks()
            .register("Answer", |_, _| Ok(Value::from(42)), Vec::<&str>::new());
        ctx.hooks().register(
            "Relay",
            |ctx: &PluginContext, _: &[Value]| Ok(ctx.call_hook("Answer", &[])?.into_value()),
            Vec::<&str>::new(),
        );
        let resp = ctx.call_hook("Relay", &[]).unwrap();
        assert_eq!(resp.into_value(), Value::Int(42));
    }
}
