//! Well-known symbols exported by native plugin libraries
//!
//! [`export_plugin!`](crate::export_plugin) generates all of these. Hosts open
//! the library and resolve them by name; every entry point hands back a heap
//! pointer whose ownership moves to the caller.

use serde::{Deserialize, Serialize};

use crate::Plugin;
use crate::types::Identity;

/// Symbol returning a boxed [`Identity`]
pub const IDENTITY_SYMBOL: &str = "GoPluginIdentity";
/// Symbol returning a boxed `Arc<dyn Plugin>`
pub const INTERFACE_SYMBOL: &str = "GoPluginNativeInterface";
/// Symbol returning a boxed `Vec<ExportedSymbol>`
pub const CATALOG_SYMBOL: &str = "GoPluginCatalog";
/// Symbol returning the API version the library was built against
pub const API_VERSION_SYMBOL: &str = "_goplug_api_version";

pub const IDENTITY_TYPE_TAG: &str = "goplug::Identity";
pub const INTERFACE_TYPE_TAG: &str = "goplug::Plugin";
pub const API_VERSION_TYPE_TAG: &str = "u32";

pub type IdentityFn = extern "C" fn() -> *mut Identity;
pub type InterfaceFn = extern "C" fn() -> *mut std::sync::Arc<dyn Plugin>;
pub type CatalogFn = extern "C" fn() -> *mut Vec<ExportedSymbol>;
pub type ApiVersionFn = extern "C" fn() -> u32;

/// One entry of a library's symbol catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedSymbol {
    pub name: String,
    pub type_tag: String,
}

impl ExportedSymbol {
    pub fn new(name: &str, type_tag: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: type_tag.to_string(),
        }
    }
}

/// Catalog published by [`export_plugin!`](crate::export_plugin)
pub fn standard_catalog() -> Vec<ExportedSymbol> {
    vec![
        ExportedSymbol::new(IDENTITY_SYMBOL, IDENTITY_TYPE_TAG),
        ExportedSymbol::new(INTERFACE_SYMBOL, INTERFACE_TYPE_TAG),
        ExportedSymbol::new(API_VERSION_SYMBOL, API_VERSION_TYPE_TAG),
    ]
}

/// Encode a symbol name for `libloading`, which wants a trailing NUL
pub fn symbol_bytes(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes
}
