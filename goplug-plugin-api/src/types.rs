//! Plugin identity and metadata structures

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::PluginContext;
use crate::error::PluginError;
use crate::http::RouteSpec;
use crate::value::Value;

/// Signature shared by every lifecycle callback
pub type CallbackFn = fn(&PluginContext, &[Value]) -> Result<(), PluginError>;

/// Lifecycle callback slots, invoked by the host at defined points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    Initialise,
    Run,
    Notify,
    Execute,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 4] = [
        CallbackKind::Initialise,
        CallbackKind::Run,
        CallbackKind::Notify,
        CallbackKind::Execute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialise => "initialise",
            Self::Run => "run",
            Self::Notify => "notify",
            Self::Execute => "execute",
        }
    }

    /// Short form used in value-bag keys (`init`, `run`, ...)
    pub fn short(&self) -> &'static str {
        match self {
            Self::Initialise => "init",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallbackKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialise" | "init" => Ok(Self::Initialise),
            "run" => Ok(Self::Run),
            "notify" => Ok(Self::Notify),
            "execute" => Ok(Self::Execute),
            other => Err(PluginError::config(format!("unknown callback kind '{other}'"))),
        }
    }
}

/// A lifecycle callback slot.
///
/// Serialized as its qualified name (`"PluginName.FunctionName"`). A callback read
/// back from JSON has a name but no function: RPC plugins run their own callbacks
/// on the far side of the channel.
#[derive(Clone)]
pub struct Callback {
    name: String,
    func: Option<CallbackFn>,
}

impl Callback {
    pub fn new(name: impl Into<String>, func: CallbackFn) -> Self {
        Self {
            name: name.into(),
            func: Some(func),
        }
    }

    /// A callback known only by name
    pub fn declared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            func: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn func(&self) -> Option<CallbackFn> {
        self.func
    }

    pub fn is_bound(&self) -> bool {
        self.func.is_some()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Serialize for Callback {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for Callback {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Callback::declared)
    }
}

/// The callback table of an identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Callbacks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialise: Option<Callback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<Callback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<Callback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<Callback>,
}

impl Callbacks {
    pub fn get(&self, kind: CallbackKind) -> Option<&Callback> {
        match kind {
            CallbackKind::Initialise => self.initialise.as_ref(),
            CallbackKind::Run => self.run.as_ref(),
            CallbackKind::Notify => self.notify.as_ref(),
            CallbackKind::Execute => self.execute.as_ref(),
        }
    }

    pub fn set(&mut self, kind: CallbackKind, callback: Callback) {
        let slot = match kind {
            CallbackKind::Initialise => &mut self.initialise,
            CallbackKind::Run => &mut self.run,
            CallbackKind::Notify => &mut self.notify,
            CallbackKind::Execute => &mut self.execute,
        };
        *slot = Some(callback);
    }

    /// Iterate over the filled slots
    pub fn iter(&self) -> impl Iterator<Item = (CallbackKind, &Callback)> {
        CallbackKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|cb| (kind, cb)))
    }
}

/// Which loading mechanisms a plugin (or an operation) targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub rpc: bool,
    #[serde(default)]
    pub native: bool,
}

impl Capabilities {
    pub const NATIVE: Capabilities = Capabilities {
        rpc: false,
        native: true,
    };
    pub const RPC: Capabilities = Capabilities {
        rpc: true,
        native: false,
    };
    pub const BOTH: Capabilities = Capabilities {
        rpc: true,
        native: true,
    };

    /// At least one mechanism is set
    pub fn any(&self) -> bool {
        self.rpc || self.native
    }

    pub fn intersects(&self, other: Capabilities) -> bool {
        (self.rpc && other.rpc) || (self.native && other.native)
    }
}

/// Where a plugin's source lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: PathBuf,
    pub version: String,
    /// The artifact is expected on local disk
    #[serde(default)]
    pub local: bool,
}

/// Self-description a plugin exposes to the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Icon URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Embedded icon bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_data: Option<Vec<u8>>,
    #[serde(default)]
    pub types: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub callbacks: Callbacks,
}

impl Identity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn maintainer(mut self, maintainer: impl Into<String>) -> Self {
        self.maintainers.push(maintainer.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn icon(mut self, url: impl Into<String>) -> Self {
        self.icon = Some(url.into());
        self
    }

    pub fn native(mut self) -> Self {
        self.types.native = true;
        self
    }

    pub fn rpc(mut self) -> Self {
        self.types.rpc = true;
        self
    }

    pub fn source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn route(mut self, route: RouteSpec) -> Self {
        self.routes.push(route);
        self
    }

    /// Fill a callback slot. The callback is named `"{identity}.{function}"`.
    pub fn on(mut self, kind: CallbackKind, function: &str, func: CallbackFn) -> Self {
        let name = format!("{}.{}", self.name, function);
        self.callbacks.set(kind, Callback::new(name, func));
        self
    }

    /// Pretty-printed JSON form
    pub fn to_json_pretty(&self) -> Result<String, PluginError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the pretty-printed JSON form to `path`
    pub fn save_identity(&self, path: &Path) -> Result<(), PluginError> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    /// Read an identity previously written by [`Identity::save_identity`]
    pub fn load_identity(path: &Path) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
