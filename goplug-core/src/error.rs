//! Plugin host error types

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use goplug_plugin_api::{CallbackKind, DispatchError, PluginError};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PluginHostError>;

/// Stable code of every error the host reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Structural,
    InvalidDirectory,
    Config,
    Io,
    Serialization,
    Validation,
    BadIdentity,
    NativeOpen,
    MissingSymbol,
    ApiVersion,
    Handshake,
    ChildCrash,
    ChannelClosed,
    NoServices,
    Unsupported,
    Protocol,
    HookNotFound,
    ArgArity,
    ArgType,
    UndeclaredType,
    HookFailed,
    Panicked,
    CallbackNotDefined,
    CallbackFailed,
    RunTaskFailed,
    RpcTimeout,
    Duplicate,
    NotFound,
    BuildFailed,
}

/// Broad family of an [`ErrorKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Structural,
    Io,
    Validation,
    Mechanism,
    Dispatch,
    Lifecycle,
    Store,
    Build,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "STRUCTURAL",
            Self::InvalidDirectory => "INVALID_DIRECTORY",
            Self::Config => "CONFIG",
            Self::Io => "IO",
            Self::Serialization => "SERIALIZATION",
            Self::Validation => "VALIDATION",
            Self::BadIdentity => "BAD_IDENTITY",
            Self::NativeOpen => "NATIVE_OPEN",
            Self::MissingSymbol => "MISSING_SYMBOL",
            Self::ApiVersion => "API_VERSION",
            Self::Handshake => "HANDSHAKE",
            Self::ChildCrash => "CHILD_CRASH",
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::NoServices => "NO_SERVICES",
            Self::Unsupported => "UNSUPPORTED",
            Self::Protocol => "PROTOCOL",
            Self::HookNotFound => "HOOK_NOT_FOUND",
            Self::ArgArity => "ARG_ARITY",
            Self::ArgType => "ARG_TYPE",
            Self::UndeclaredType => "UNDECLARED_TYPE",
            Self::HookFailed => "HOOK_FAILED",
            Self::Panicked => "PANICKED",
            Self::CallbackNotDefined => "CALLBACK_NOT_DEFINED",
            Self::CallbackFailed => "CALLBACK_FAILED",
            Self::RunTaskFailed => "RUN_TASK_FAILED",
            Self::RpcTimeout => "RPC_TIMEOUT",
            Self::Duplicate => "DUPLICATE",
            Self::NotFound => "NOT_FOUND",
            Self::BuildFailed => "BUILD_FAILED",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Structural | Self::InvalidDirectory | Self::Config => ErrorClass::Structural,
            Self::Io | Self::Serialization => ErrorClass::Io,
            Self::Validation | Self::BadIdentity => ErrorClass::Validation,
            Self::NativeOpen
            | Self::MissingSymbol
            | Self::ApiVersion
            | Self::Handshake
            | Self::ChildCrash
            | Self::ChannelClosed
            | Self::NoServices
            | Self::Unsupported
            | Self::Protocol
            | Self::Panicked => ErrorClass::Mechanism,
            Self::HookNotFound
            | Self::ArgArity
            | Self::ArgType
            | Self::UndeclaredType
            | Self::HookFailed => ErrorClass::Dispatch,
            Self::CallbackNotDefined
            | Self::CallbackFailed
            | Self::RunTaskFailed
            | Self::RpcTimeout => ErrorClass::Lifecycle,
            Self::Duplicate | Self::NotFound => ErrorClass::Store,
            Self::BuildFailed => ErrorClass::Build,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A warning is additive and never interrupts control flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Fatal,
}

/// Errors that can occur in the plugin host
#[derive(Error, Debug)]
pub enum PluginHostError {
    #[error("{0}")]
    Structural(String),

    #[error("Invalid plugin directory {path}: {reason}")]
    InvalidDirectory { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Identity rejected by the validation pipeline
    #[error("Identity '{name}' is invalid: {}", .errors.join("; "))]
    Validation { name: String, errors: Vec<String> },

    /// A library or child produced an identity that does not validate
    #[error("Bad identity in {path}: {}", .errors.join("; "))]
    BadIdentity { path: PathBuf, errors: Vec<String> },

    #[error("Failed to open plugin library {path}: {source}")]
    NativeOpen {
        path: PathBuf,
        source: libloading::Error,
    },

    #[error("Plugin library {path} does not export {symbol}")]
    MissingSymbol { path: PathBuf, symbol: String },

    /// API version mismatch between host and plugin
    #[error("API version mismatch: goplug expects {expected}, plugin has {found}")]
    ApiVersionMismatch { expected: u32, found: u32 },

    #[error("Handshake with {path} failed: {reason}")]
    Handshake { path: PathBuf, reason: String },

    #[error("Plugin '{name}' exited: {status}")]
    ChildCrash { name: String, status: String },

    #[error("Channel to plugin '{name}' is closed")]
    ChannelClosed { name: String },

    #[error("Plugin '{name}' has no RPC services")]
    NoServices { name: String },

    #[error("No active mechanism accepts {path}")]
    Unsupported { path: PathBuf },

    #[error("Protocol error from plugin '{name}': {message}")]
    Protocol { name: String, message: String },

    /// Per-call rejection of a hook invocation
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Hook '{hook}' of plugin '{name}' failed: {message}")]
    HookFailed {
        name: String,
        hook: String,
        message: String,
    },

    #[error("Plugin '{name}' panicked during {during}")]
    Panicked { name: String, during: String },

    #[error("Plugin '{name}' defines no {kind} callback")]
    CallbackNotDefined { name: String, kind: CallbackKind },

    #[error("Plugin '{name}' {kind} callback failed: {message}")]
    CallbackFailed {
        name: String,
        kind: CallbackKind,
        message: String,
    },

    #[error("Plugin '{name}' run task failed: {message}")]
    RunTaskFailed { name: String, message: String },

    #[error("Plugin '{name}' timed out after {timeout:?} in {method}")]
    RpcTimeout {
        name: String,
        method: String,
        timeout: Duration,
    },

    #[error("Plugin already registered at {key}")]
    Duplicate { key: String },

    #[error("Plugin '{name}' is already loaded from {existing}")]
    DuplicateName { name: String, existing: String },

    #[error("Plugin '{key}' not found")]
    NotFound { key: String },

    #[error("Build of {path} failed: {status}")]
    BuildFailed { path: PathBuf, status: String },
}

impl PluginHostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Structural(_) => ErrorKind::Structural,
            Self::InvalidDirectory { .. } => ErrorKind::InvalidDirectory,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::BadIdentity { .. } => ErrorKind::BadIdentity,
            Self::NativeOpen { .. } => ErrorKind::NativeOpen,
            Self::MissingSymbol { .. } => ErrorKind::MissingSymbol,
            Self::ApiVersionMismatch { .. } => ErrorKind::ApiVersion,
            Self::Handshake { .. } => ErrorKind::Handshake,
            Self::ChildCrash { .. } => ErrorKind::ChildCrash,
            Self::ChannelClosed { .. } => ErrorKind::ChannelClosed,
            Self::NoServices { .. } => ErrorKind::NoServices,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Dispatch(e) => match e {
                DispatchError::HookNotFound { .. } => ErrorKind::HookNotFound,
                DispatchError::ArgArity { .. } => ErrorKind::ArgArity,
                DispatchError::ArgType { .. } => ErrorKind::ArgType,
                DispatchError::UndeclaredType { .. } => ErrorKind::UndeclaredType,
            },
            Self::HookFailed { .. } => ErrorKind::HookFailed,
            Self::Panicked { .. } => ErrorKind::Panicked,
            Self::CallbackNotDefined { .. } => ErrorKind::CallbackNotDefined,
            Self::CallbackFailed { .. } => ErrorKind::CallbackFailed,
            Self::RunTaskFailed { .. } => ErrorKind::RunTaskFailed,
            Self::RpcTimeout { .. } => ErrorKind::RpcTimeout,
            Self::Duplicate { .. } | Self::DuplicateName { .. } => ErrorKind::Duplicate,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::BuildFailed { .. } => ErrorKind::BuildFailed,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::CallbackNotDefined { .. } => Severity::Warning,
            _ => Severity::Fatal,
        }
    }

    pub fn is_warning(&self) -> bool {
        self.severity() == Severity::Warning
    }

    /// Map an error returned by plugin code
    pub fn from_plugin(name: &str, kind: CallbackKind, error: PluginError) -> Self {
        match error {
            PluginError::Dispatch(e) => Self::Dispatch(e),
            other => Self::CallbackFailed {
                name: name.to_string(),
                kind,
                message: other.to_string(),
            },
        }
    }

    /// Map an error returned by a hook
    pub fn from_hook(name: &str, hook: &str, error: PluginError) -> Self {
        match error {
            PluginError::Dispatch(e) => Self::Dispatch(e),
            other => Self::HookFailed {
                name: name.to_string(),
                hook: hook.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Freeze into a diagnostic record
    pub fn diagnostic(&self, prefix: impl Into<String>) -> Diagnostic {
        Diagnostic {
            kind: self.kind(),
            severity: self.severity(),
            time: Utc::now(),
            prefix: prefix.into(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for PluginHostError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Error record kept by the manager after the operation that raised it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub time: DateTime<Utc>,
    /// Operation or plugin the diagnostic belongs to
    pub prefix: String,
    pub message: String,
}

impl Diagnostic {
    /// A warning that has no error value behind it
    pub fn warning(kind: ErrorKind, prefix: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            time: Utc::now(),
            prefix: prefix.into(),
            message: message.into(),
        }
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.prefix, self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_errors_keep_their_code() {
        let err: PluginHostError = DispatchError::ArgType {
            name: "Sum".into(),
            position: 0,
            expected: "int".into(),
            found: "string".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ArgType);
        assert_eq!(err.kind().class(), ErrorClass::Dispatch);
        assert!(err.to_string().contains("position 0"));
    }

    #[test]
    fn test_only_missing_callback_is_a_warning() {
        let warn = PluginHostError::CallbackNotDefined {
            name: "hello".into(),
            kind: CallbackKind::Run,
        };
        assert!(warn.is_warning());
        assert!(!PluginHostError::not_found("x").is_warning());
    }

    #[test]
    fn test_api_version_mismatch_display() {
        let err = PluginHostError::ApiVersionMismatch {
            expected: 1,
            found: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("1"));
        assert!(msg.contains("2"));
        assert_eq!(err.kind().class(), ErrorClass::Mechanism);
    }

    #[test]
    fn test_timeout_display() {
        let err = PluginHostError::RpcTimeout {
            name: "slow-plugin".to_string(),
            method: "CallHook".to_string(),
            timeout: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("slow-plugin"));
        assert!(msg.contains("5"));
        assert_eq!(err.kind().as_str(), "RPC_TIMEOUT");
    }

    #[test]
    fn test_plugin_errors_become_callback_failures() {
        let err = PluginHostError::from_plugin(
            "hello",
            CallbackKind::Initialise,
            PluginError::custom("boom"),
        );
        assert_eq!(err.kind(), ErrorKind::CallbackFailed);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_diagnostic_display() {
        let diag = PluginHostError::Duplicate {
            key: "/p/goplug-x.so".into(),
        }
        .diagnostic("load");
        assert_eq!(diag.severity, Severity::Fatal);
        assert!(diag.to_string().starts_with("[load] DUPLICATE:"));
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["kind"], "DUPLICATE");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PluginHostError = io_err.into();
        assert!(matches!(err, PluginHostError::Io(_)));
    }
}
