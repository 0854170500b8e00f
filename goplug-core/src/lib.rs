//! goplug-core: Host side of the goplug plugin runtime
//!
//! This crate discovers, builds, loads, supervises and calls plugins:
//!
//! - **Manager** - [`Manager`] owns the plugin root and orchestrates scan, build, load and unload
//! - **Native mechanism** - [`native::NativeMechanism`] opens shared libraries and binds their exports
//! - **RPC mechanism** - [`rpc::RpcMechanism`] launches plugin executables and supervises the channel
//! - **Plugin handle** - [`PluginHandle`] is the one representation both mechanisms produce
//! - **Validation** - [`Validator`] runs an identity through an ordered pipeline of checks
//! - **Builder** - [`Builder`] recompiles plugin sources newer than their artifacts
//!
//! # Quick Start
//!
//! ```no_run
//! use goplug_core::{HostConfig, Manager};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::new(HostConfig::default())?;
//!     manager.register_plugins().await?;
//!
//!     let response = manager.call_hook("hello", "Greet", Vec::new()).await?;
//!     println!("Greet returned {}", response.type_tag);
//!
//!     manager.dispose().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Manager                         │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │                    Loader                       │  │
//! │  │  ┌──────────────────┐  ┌─────────────────────┐ │  │
//! │  │  │ NativeMechanism  │  │    RpcMechanism     │ │  │
//! │  │  │  + PluginStore   │  │  + PluginStore      │ │  │
//! │  │  └──────────────────┘  └─────────────────────┘ │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                   Builder                             │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod builder;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod native;
mod output;
pub mod paths;
pub mod rpc;
pub mod services;
pub mod store;
pub mod validate;

// Re-export key types for convenience
pub use builder::{BuildReport, Builder};
pub use config::{BuildConfig, DEFAULT_FILE_GLOB, HostConfig};
pub use discovery::{Candidate, ScanReport};
pub use error::{Diagnostic, ErrorClass, ErrorKind, PluginHostError, Result, Severity};
pub use handle::{PluginHandle, PluginSnapshot, STATUS_CANCELLED, STATUS_OK, status_key, timestamp_key};
pub use lifecycle::{LifecycleState, Mechanism};
pub use loader::{LoadOutcome, Loader};
pub use manager::{BulkReport, Manager, PluginInfo};
pub use rpc::{ChildStatus, RpcClient};
pub use services::ServiceRegistry;
pub use store::{PluginStore, StoreItem};
pub use validate::{ValidationContext, ValidationReport, ValidationStage, Validator};
