//! Handshake line written by an RPC plugin on startup
//!
//! The child prints exactly one line to stdout before anything else:
//!
//! ```text
//! <protocol-version>|<network>|<address>|<protocol>|<cookie-key>=<cookie-value>
//! ```
//!
//! The host launches the child with the cookie in its environment. The child
//! refuses to start if the environment cookie is wrong; the host refuses the
//! child if the echoed cookie or version is wrong.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application protocol spoken over the channel
pub const APP_PROTOCOL: &str = "goplug-json";

/// Default cookie shared by host and plugins
pub const DEFAULT_COOKIE_KEY: &str = "GOPLUG_PLUGIN";
pub const DEFAULT_COOKIE_VALUE: &str = "7f3c9a1e-goplug-rpc-plugin";

/// Pre-shared handshake parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            cookie_key: DEFAULT_COOKIE_KEY.to_string(),
            cookie_value: DEFAULT_COOKIE_VALUE.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Malformed handshake line: {0}")]
    Malformed(String),

    #[error("Protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Cookie mismatch for '{key}'")]
    CookieMismatch { key: String },

    #[error("Unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("Unsupported protocol '{0}'")]
    UnsupportedProtocol(String),
}

/// Transport the plugin listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Unix => f.write_str("unix"),
        }
    }
}

impl FromStr for Network {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(HandshakeError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Parsed handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub protocol_version: u32,
    pub network: Network,
    pub address: String,
    pub protocol: String,
    pub cookie_key: String,
    pub cookie_value: String,
}

impl HandshakeLine {
    pub fn new(config: &HandshakeConfig, network: Network, address: impl Into<String>) -> Self {
        Self {
            protocol_version: config.protocol_version,
            network,
            address: address.into(),
            protocol: APP_PROTOCOL.to_string(),
            cookie_key: config.cookie_key.clone(),
            cookie_value: config.cookie_value.clone(),
        }
    }

    /// Check the line against the host's expectations
    pub fn verify(&self, expected: &HandshakeConfig) -> Result<(), HandshakeError> {
        if self.protocol_version != expected.protocol_version {
            return Err(HandshakeError::VersionMismatch {
                expected: expected.protocol_version,
                found: self.protocol_version,
            });
        }
        if self.cookie_key != expected.cookie_key || self.cookie_value != expected.cookie_value {
            return Err(HandshakeError::CookieMismatch {
                key: expected.cookie_key.clone(),
            });
        }
        if self.protocol != APP_PROTOCOL {
            return Err(HandshakeError::UnsupportedProtocol(self.protocol.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}={}",
            self.protocol_version,
            self.network,
            self.address,
            self.protocol,
            self.cookie_key,
            self.cookie_value
        )
    }
}

impl FromStr for HandshakeLine {
    type Err = HandshakeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        let [version, network, address, protocol, cookie] = parts.as_slice() else {
            return Err(HandshakeError::Malformed(line.to_string()));
        };
        let protocol_version = version
            .parse()
            .map_err(|_| HandshakeError::Malformed(line.to_string()))?;
        let (cookie_key, cookie_value) = cookie
            .split_once('=')
            .ok_or_else(|| HandshakeError::Malformed(line.to_string()))?;
        Ok(Self {
            protocol_version,
            network: network.parse()?,
            address: address.to_string(),
            protocol: protocol.to_string(),
            cookie_key: cookie_key.to_string(),
            cookie_value: cookie_value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        let line = HandshakeLine::new(&HandshakeConfig::default(), Network::Tcp, "127.0.0.1:4000");
        assert_eq!(
            line.to_string(),
            format!("1|tcp|127.0.0.1:4000|goplug-json|{DEFAULT_COOKIE_KEY}={DEFAULT_COOKIE_VALUE}")
        );
        let parsed: HandshakeLine = line.to_string().parse().unwrap();
        assert_eq!(parsed, line);
        assert!(parsed.verify(&HandshakeConfig::default()).is_ok());
    }

    #[test]
    fn test_wrong_cookie_is_rejected() {
        let line: HandshakeLine = "1|tcp|127.0.0.1:1|goplug-json|GOPLUG_PLUGIN=wrong\n"
            .parse()
            .unwrap();
        assert_eq!(
            line.verify(&HandshakeConfig::default()),
            Err(HandshakeError::CookieMismatch {
                key: DEFAULT_COOKIE_KEY.into()
            })
        );
    }

    #[test]
    fn test_version_mismatch() {
        let config = HandshakeConfig::default();
        let mut line = HandshakeLine::new(&config, Network::Unix, "/tmp/p.sock");
        line.protocol_version = 2;
        assert!(matches!(
            line.verify(&config),
            Err(HandshakeError::VersionMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            "hello world".parse::<HandshakeLine>(),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            "1|pipe|x|goplug-json|a=b".parse::<HandshakeLine>(),
            Err(HandshakeError::UnsupportedNetwork(_))
        ));
        assert!(matches!(
            "1|tcp|x|goplug-json|nocookie".parse::<HandshakeLine>(),
            Err(HandshakeError::Malformed(_))
        ));
    }
}
