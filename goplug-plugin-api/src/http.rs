//! HTTP route declarations carried in a plugin's identity
//!
//! The host does not serve these routes; it only keeps them verbatim so that
//! an outer HTTP layer can mount them.

use serde::{Deserialize, Serialize};

/// HTTP method for a declared route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

/// A route the plugin wants mounted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// HTTP method
    pub method: HttpMethod,
    /// Path pattern, e.g., "/status" or "/items/:id"
    pub path: String,
}

impl RouteSpec {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_spec_json_form() {
        let route = RouteSpec::new(HttpMethod::Get, "/items/:id");
        let json = serde_json::to_string(&route).unwrap();
        assert_eq!(json, r#"{"method":"GET","path":"/items/:id"}"#);
    }
}
