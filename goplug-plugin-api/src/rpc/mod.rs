//! RPC plugin wire contract
//!
//! Shared by both ends: the host's RPC mechanism drives [`protocol`] over the
//! channel it opens after parsing the [`handshake`] line, and plugin binaries
//! answer through [`serve`].

pub mod handshake;
pub mod protocol;
mod server;

pub use handshake::{HandshakeConfig, HandshakeError, HandshakeLine, Network};
pub use protocol::{DynamicData, Method, Reply, Request, Response, WireError};
pub use server::{ServeConfig, serve};
