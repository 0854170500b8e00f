//! Named, typed callable endpoints registered by a plugin
//!
//! Registration happens while the plugin is being loaded and takes the write
//! lock; calls only take the read lock long enough to clone the entry, so hooks
//! may run concurrently and may call peer hooks of the same registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::context::{PluginContext, PluginId};
use crate::error::{DispatchError, PluginError};
use crate::value::{TypeTag, Value};

/// Function behind a hook
pub type HookFn = Arc<dyn Fn(&PluginContext, &[Value]) -> Result<Value, PluginError> + Send + Sync>;

/// Type tag of a nil hook response
pub const NIL_RESPONSE: &str = "<nil>";

/// Tagged result of a hook call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    pub value: Value,
    pub type_tag: String,
}

impl HookResponse {
    pub fn new(value: Value) -> Self {
        let type_tag = if value.is_nil() {
            NIL_RESPONSE.to_string()
        } else {
            value.type_tag().to_string()
        };
        Self { value, type_tag }
    }

    pub fn nil() -> Self {
        Self::new(Value::Nil)
    }

    pub fn is_nil(&self) -> bool {
        self.type_tag == NIL_RESPONSE
    }

    /// Probe the type tag before taking the value
    pub fn is(&self, tag: impl Into<TypeTag>) -> bool {
        TypeTag::from(self.type_tag.as_str()) == tag.into()
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// A registered hook
#[derive(Clone)]
pub struct HookEntry {
    pub name: String,
    pub signature: Vec<TypeTag>,
    func: HookFn,
}

impl HookEntry {
    /// Check `args` against the signature
    pub fn check_args(&self, args: &[Value]) -> Result<(), DispatchError> {
        if args.len() != self.signature.len() {
            return Err(DispatchError::ArgArity {
                name: self.name.clone(),
                expected: self.signature.len(),
                found: args.len(),
            });
        }
        for (position, (arg, expected)) in args.iter().zip(&self.signature).enumerate() {
            let found = arg.type_tag();
            if &found != expected {
                return Err(DispatchError::ArgType {
                    name: self.name.clone(),
                    position,
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

/// Serializable description of a hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInfo {
    pub name: String,
    pub signature: Vec<TypeTag>,
}

/// Per-plugin hook table
pub struct HookRegistry {
    owner: PluginId,
    identity: OnceLock<String>,
    entries: RwLock<BTreeMap<String, HookEntry>>,
}

impl HookRegistry {
    pub fn new(owner: PluginId) -> Self {
        Self {
            owner,
            identity: OnceLock::new(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn owner(&self) -> PluginId {
        self.owner
    }

    /// Name of the owning plugin, once validated
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    /// Record the owning plugin's name. Only the first call has an effect.
    pub fn set_identity(&self, name: impl Into<String>) {
        let _ = self.identity.set(name.into());
    }

    /// Register a hook, replacing any hook of the same name.
    ///
    /// An empty `name` is derived from the function's type name, so a plain
    /// `fn greet(..)` registers as `"greet"`. Returns the name used.
    pub fn register<F, I, T>(&self, name: &str, func: F, signature: I) -> String
    where
        F: Fn(&PluginContext, &[Value]) -> Result<Value, PluginError> + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        T: Into<TypeTag>,
    {
        let name = if name.is_empty() {
            derive_name::<F>()
        } else {
            name.to_string()
        };
        let entry = HookEntry {
            name: name.clone(),
            signature: signature.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
        };
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), entry);
        if previous.is_some() {
            tracing::debug!(hook = %name, owner = %self.owner, "Replaced hook");
        }
        name
    }

    /// Look up a hook and check the arguments without calling it
    pub fn resolve(&self, name: &str, args: &[Value]) -> Result<HookEntry, DispatchError> {
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::HookNotFound {
                name: name.to_string(),
            })?;
        entry.check_args(args)?;
        Ok(entry)
    }

    /// Call a hook. The registry lock is released before the hook runs.
    pub fn call(
        &self,
        ctx: &PluginContext,
        name: &str,
        args: &[Value],
    ) -> Result<HookResponse, PluginError> {
        let entry = self.resolve(name, args)?;
        let value = (entry.func)(ctx, args)?;
        Ok(HookResponse::new(value))
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn signature(&self, name: &str) -> Option<Vec<TypeTag>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|e| e.signature.clone())
    }

    /// Every hook, ordered by name
    pub fn list(&self) -> Vec<HookInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| HookInfo {
                name: e.name.clone(),
                signature: e.signature.clone(),
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("owner", &self.owner)
            .field("identity", &self.identity())
            .field("hooks", &self.count())
            .finish()
    }
}

/// Last meaningful path segment of `F`'s type name.
///
/// `my_plugin::greet` yields `greet`; a closure defined in `setup` yields `setup`.
fn derive_name<F>() -> String {
    std::any::type_name::<F>()
        .rsplit("::")
        .find(|segment| !segment.starts_with('{'))
        .unwrap_or("hook")
        .to_string()
}
