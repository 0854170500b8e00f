//! Error types for plugin authors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that plugins can return
#[derive(Error, Debug)]
pub enum PluginError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Hook dispatch was rejected before the hook ran
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The RPC handshake could not be completed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A plugin serving over RPC registered no services
    #[error("Plugin '{0}' has no RPC services")]
    NoServices(String),

    /// An encoded message does not fit in one frame
    #[error("Message of {len} bytes exceeds the {max}-byte frame limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The operation was cancelled through the plugin's cancellation signal
    #[error("Cancelled")]
    Cancelled,

    /// Custom error with message
    #[error("{0}")]
    Custom(String),
}

impl PluginError {
    /// Create a custom error with a message
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Per-call rejection of a hook invocation.
///
/// Serializable so an RPC plugin can return it to the host unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchError {
    #[error("Hook '{name}' not found")]
    HookNotFound { name: String },

    #[error("Hook '{name}' expects {expected} argument(s), got {found}")]
    ArgArity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Hook '{name}' argument at position {position}: expected {expected}, got {found}")]
    ArgType {
        name: String,
        position: usize,
        expected: String,
        found: String,
    },

    #[error("Type '{type_name}' is not declared for serialization")]
    UndeclaredType { type_name: String },
}

impl DispatchError {
    /// Stable error code, shared by host and plugin
    pub fn code(&self) -> &'static str {
        match self {
            Self::HookNotFound { .. } => "HOOK_NOT_FOUND",
            Self::ArgArity { .. } => "ARG_ARITY",
            Self::ArgType { .. } => "ARG_TYPE",
            Self::UndeclaredType { .. } => "UNDECLARED_TYPE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let config_err = PluginError::Config("missing key".to_string());
        assert_eq!(config_err.to_string(), "Configuration error: missing key");

        let custom_err = PluginError::Custom("something happened".to_string());
        assert_eq!(custom_err.to_string(), "something happened");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let plugin_err: PluginError = io_err.into();

        assert!(matches!(plugin_err, PluginError::Io(_)));
        assert!(plugin_err.to_string().contains("file not found"));
    }

    #[test]
    fn test_dispatch_error_is_transparent() {
        let err: PluginError = DispatchError::HookNotFound {
            name: "Greet".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Hook 'Greet' not found");
    }

    #[test]
    fn test_arg_type_mentions_position() {
        let err = DispatchError::ArgType {
            name: "Sum".into(),
            position: 0,
            expected: "int".into(),
            found: "string".into(),
        };
        assert!(err.to_string().contains("position 0"));
        assert_eq!(err.code(), "ARG_TYPE");
    }

    #[test]
    fn test_dispatch_error_wire_form_carries_code() {
        let err = DispatchError::ArgArity {
            name: "Sum".into(),
            expected: 2,
            found: 1,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "ARG_ARITY");

        let back: DispatchError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
