//! Wire messages exchanged between host and RPC plugin
//!
//! Every frame is a 4-byte big-endian length followed by a JSON payload of at
//! most [`MAX_FRAME_LEN`] bytes. The host sends [`Request`]s; the plugin answers
//! each with a [`Response`] carrying the same id, in any order.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{DispatchError, PluginError};
use crate::hooks::{HookInfo, HookResponse};
use crate::types::{CallbackKind, Identity};
use crate::value::Value;

/// Maximum frame payload (10 MiB)
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Codec for the length-prefixed channel
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Serialize a message into a frame payload
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, PluginError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Serialize a message, refusing payloads the codec would reject.
///
/// The codec treats an oversized frame as a broken stream; checking first
/// keeps the failure on the one message.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, PluginError> {
    let bytes = encode(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(PluginError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(bytes)
}

/// Deserialize a frame payload
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, PluginError> {
    Ok(serde_json::from_slice(frame)?)
}

/// A host-to-plugin call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// Target service; empty means the plugin's default service
    #[serde(default)]
    pub service: String,
    pub method: Method,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params", rename_all = "snake_case")]
pub enum Method {
    Identify,
    IdentifyString,
    GetData,
    CallHook { name: String, args: Vec<Value> },
    Lifecycle { kind: CallbackKind, args: Vec<Value> },
    ListServices,
    /// Ask the plugin to cancel running callbacks and exit
    Shutdown,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify => "Identify",
            Self::IdentifyString => "IdentifyString",
            Self::GetData => "GetData",
            Self::CallHook { .. } => "CallHook",
            Self::Lifecycle { .. } => "Lifecycle",
            Self::ListServices => "ListServices",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Everything the host may want to inspect about a running RPC plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicData {
    pub values: BTreeMap<String, Value>,
    pub hooks: Vec<HookInfo>,
    /// User types declared for serialization
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Identity(Identity),
    IdentityString(String),
    Data(DynamicData),
    Hook(HookResponse),
    Lifecycle,
    Services(Vec<String>),
    Shutdown,
}

/// Error returned across the channel
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    #[error(transparent)]
    Dispatch { error: DispatchError },

    #[error("Callback '{callback}' is not defined")]
    CallbackNotDefined { callback: CallbackKind },

    #[error("{message}")]
    Plugin { message: String },

    #[error("Unknown service '{service}'")]
    UnknownService { service: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl From<PluginError> for WireError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::Dispatch(error) => Self::Dispatch { error },
            other => Self::Plugin {
                message: other.to_string(),
            },
        }
    }
}

impl From<DispatchError> for WireError {
    fn from(error: DispatchError) -> Self {
        Self::Dispatch { error }
    }
}

/// A plugin-to-host answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<Reply, WireError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_request_wire_form() {
        let req = Request {
            id: 3,
            service: "hello".into(),
            method: Method::CallHook {
                name: "Sum".into(),
                args: vec![Value::from(1)],
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"]["name"], "call_hook");
        assert_eq!(json["method"]["params"]["name"], "Sum");

        let unit = serde_json::to_value(Method::Identify).unwrap();
        assert_eq!(unit["name"], "identify");
    }

    #[test]
    fn test_dispatch_error_survives_the_wire() {
        let resp = Response {
            id: 1,
            result: Err(WireError::from(PluginError::Dispatch(DispatchError::ArgArity {
                name: "Sum".into(),
                expected: 2,
                found: 1,
            }))),
        };
        let bytes = encode(&resp).unwrap();
        let back: Response = decode(&bytes).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn test_frame_is_big_endian_length_prefixed() {
        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 2, b'{', b'}']);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"{}");
    }

    #[test]
    fn test_encode_frame_refuses_oversized_payload() {
        let small = encode_frame(&Value::from("hi")).unwrap();
        assert_eq!(small, encode(&Value::from("hi")).unwrap());

        let huge = Value::from("x".repeat(MAX_FRAME_LEN));
        let err = encode_frame(&huge).unwrap_err();
        assert!(matches!(err, PluginError::FrameTooLarge { max: MAX_FRAME_LEN, .. }), "{err}");
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }
}
