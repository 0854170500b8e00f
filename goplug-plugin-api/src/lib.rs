//! goplug-plugin-api - Plugin API for the goplug plugin host
//!
//! This crate provides the traits and types needed to write goplug plugins.
//! A plugin is either a native Rust dynamic library loaded into the host
//! process, or a standalone executable the host launches and talks to over a
//! length-prefixed RPC channel. The same [`Plugin`] implementation serves both.
//!
//! # Example
//!
//! ```ignore
//! use goplug_plugin_api::{
//!     CallbackKind, HookRegistry, Identity, Plugin, PluginContext, PluginError, Value,
//!     export_plugin,
//! };
//!
//! #[derive(Default)]
//! pub struct Hello;
//!
//! fn init(ctx: &PluginContext, _args: &[Value]) -> Result<(), PluginError> {
//!     ctx.log_info("hello loaded");
//!     Ok(())
//! }
//!
//! fn greet(_ctx: &PluginContext, _args: &[Value]) -> Result<Value, PluginError> {
//!     Ok(Value::Nil)
//! }
//!
//! impl Plugin for Hello {
//!     fn identity(&self) -> Identity {
//!         Identity::new("hello", "1.0.0")
//!             .maintainer("x@y")
//!             .native()
//!             .on(CallbackKind::Initialise, "Init", init)
//!     }
//!
//!     fn register_hooks(&self, hooks: &HookRegistry) {
//!         hooks.register("Greet", greet, Vec::<&str>::new());
//!     }
//! }
//!
//! export_plugin!(Hello);
//! ```

pub mod context;
pub mod error;
pub mod hooks;
pub mod http;
pub mod native;
pub mod rpc;
pub mod types;
pub mod value;

pub use context::{PluginContext, PluginId, ValueBag};
pub use error::{DispatchError, PluginError};
pub use hooks::{HookEntry, HookFn, HookInfo, HookRegistry, HookResponse, NIL_RESPONSE};
pub use http::{HttpMethod, RouteSpec};
pub use types::*;
pub use value::{PluginType, TypeRegistry, TypeTag, Value};

/// Current plugin API version. Native plugins must match this exactly.
pub const API_VERSION: u32 = 1;

/// The core plugin trait - implement this to create a goplug plugin.
///
/// Only [`Plugin::identity`] is required. Lifecycle callbacks are declared in
/// the identity's callback table rather than as trait methods so that the
/// table can be inspected, persisted, and validated before anything runs.
pub trait Plugin: Send + Sync {
    /// Return the plugin's self-description
    fn identity(&self) -> Identity;

    /// Register hooks. Called once per load, before `initialise`.
    fn register_hooks(&self, _hooks: &HookRegistry) {}

    /// Declare user types that may cross the RPC boundary
    fn declare_types(&self, _types: &mut TypeRegistry) {}
}

/// Export a plugin type for dynamic loading.
///
/// The type must implement [`Plugin`] and [`Default`]. One instance is
/// created lazily and shared by every entry point.
///
/// # Generated Functions
///
/// - `GoPluginIdentity()`: the plugin's [`Identity`]
/// - `GoPluginNativeInterface()`: the shared plugin instance
/// - `GoPluginCatalog()`: the list of exported symbols and their type tags
/// - `_goplug_api_version()`: returns the API version
#[macro_export]
macro_rules! export_plugin {
    ($plugin_type:ty) => {
        fn __goplug_instance() -> ::std::sync::Arc<dyn $crate::Plugin> {
            static INSTANCE: ::std::sync::OnceLock<::std::sync::Arc<dyn $crate::Plugin>> =
                ::std::sync::OnceLock::new();
            INSTANCE
                .get_or_init(|| {
                    ::std::sync::Arc::new(<$plugin_type as ::std::default::Default>::default())
                })
                .clone()
        }

        #[unsafe(no_mangle)]
        #[allow(non_snake_case, improper_ctypes_definitions)]
        pub extern "C" fn GoPluginIdentity() -> *mut $crate::Identity {
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(__goplug_instance().identity()))
        }

        #[unsafe(no_mangle)]
        #[allow(non_snake_case, improper_ctypes_definitions)]
        pub extern "C" fn GoPluginNativeInterface() -> *mut ::std::sync::Arc<dyn $crate::Plugin> {
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(__goplug_instance()))
        }

        #[unsafe(no_mangle)]
        #[allow(non_snake_case, improper_ctypes_definitions)]
        pub extern "C" fn GoPluginCatalog() -> *mut ::std::vec::Vec<$crate::native::ExportedSymbol> {
            ::std::boxed::Box::into_raw(::std::boxed::Box::new($crate::native::standard_catalog()))
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _goplug_api_version() -> u32 {
            $crate::API_VERSION
        }
    };
}

/// Build a `Vec<Value>` argument list
///
/// ```ignore
/// let args = goplug_plugin_api::args![1, "two", 3.0];
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($arg)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Exported;

    impl Plugin for Exported {
        fn identity(&self) -> Identity {
            Identity::new("exported", "0.1.0").native()
        }
    }

    export_plugin!(Exported);

    #[test]
    fn test_api_version_is_set() {
        assert_eq!(API_VERSION, 1);
    }

    #[test]
    fn test_plugin_trait_is_object_safe() {
        // This compiles only if Plugin is object-safe
        fn _takes_boxed_plugin(_: Box<dyn Plugin>) {}
    }

    #[test]
    fn test_exported_entry_points() {
        let identity = unsafe { Box::from_raw(GoPluginIdentity()) };
        assert_eq!(identity.name, "exported");

        let instance = unsafe { Box::from_raw(GoPluginNativeInterface()) };
        assert_eq!(instance.identity().version, "0.1.0");

        let catalog = unsafe { Box::from_raw(GoPluginCatalog()) };
        assert!(catalog.iter().any(|s| s.name == native::IDENTITY_SYMBOL));

        assert_eq!(_goplug_api_version(), API_VERSION);
    }

    #[test]
    fn test_args_macro() {
        let args = args![1, "two"];
        assert_eq!(args, vec![Value::Int(1), Value::from("two")]);
        assert!(args![].is_empty());
    }
}
