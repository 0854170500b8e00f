//! In-process mechanism: shared libraries and statically linked plugins
//!
//! Libraries are opened once per canonical path and never closed. Unloading a
//! native plugin retires its handle; the code stays mapped, and a reload of the
//! same path reuses the symbols of the first open.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use goplug_plugin_api::native::{
    API_VERSION_SYMBOL, API_VERSION_TYPE_TAG, ApiVersionFn, CATALOG_SYMBOL, CatalogFn,
    ExportedSymbol, IDENTITY_SYMBOL, IDENTITY_TYPE_TAG, INTERFACE_SYMBOL, INTERFACE_TYPE_TAG,
    IdentityFn, InterfaceFn, symbol_bytes,
};
use goplug_plugin_api::{API_VERSION, HookRegistry, Identity, Plugin, PluginId};
use libloading::Library;

use crate::error::{PluginHostError, Result};
use crate::handle::{Backend, HandleParts, PluginHandle};
use crate::lifecycle::{LifecycleState, Mechanism, StateCell};
use crate::services::{NativeService, ServiceRegistry};
use crate::validate::{ValidationContext, Validator};

/// Key prefix for plugins linked into the host binary
pub const STATIC_PREFIX: &str = "<static>";

/// Symbol recorded for plugins linked into the host binary
const STATIC_SYMBOL: &str = "<static>";

/// Every library this process has opened, by canonical path
fn libraries() -> &'static Mutex<HashMap<PathBuf, Arc<Library>>> {
    static LIBRARIES: OnceLock<Mutex<HashMap<PathBuf, Arc<Library>>>> = OnceLock::new();
    LIBRARIES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Whether `path` names a shared library for this platform
pub fn is_library(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == std::env::consts::DLL_EXTENSION)
}

/// Stand-in for libraries that publish an identity but no plugin instance
struct IdentityOnly(Identity);

impl Plugin for IdentityOnly {
    fn identity(&self) -> Identity {
        self.0.clone()
    }
}

/// What symbol discovery found in a library
struct Discovered {
    symbols: Vec<ExportedSymbol>,
    identity: Option<Identity>,
    plugin: Option<Arc<dyn Plugin>>,
}

impl Discovered {
    fn has(&self, name: &str, type_tag: &str) -> bool {
        self.symbols
            .iter()
            .any(|s| s.name == name && s.type_tag == type_tag)
    }
}

pub struct NativeMechanism {
    validator: Arc<Validator>,
    source_extension: String,
}

impl NativeMechanism {
    pub fn new(validator: Arc<Validator>, source_extension: impl Into<String>) -> Self {
        Self {
            validator,
            source_extension: source_extension.into(),
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        is_library(path)
    }

    /// Open, check the API version, discover, validate and wrap the library
    /// at `path`.
    ///
    /// No other symbol is touched until the version matches. The handle comes
    /// back LOADED; `initialise` is the loader's job.
    pub fn load(&self, id: PluginId, path: &Path) -> Result<PluginHandle> {
        let canonical = readable(path)?;
        let library = open(&canonical)?;
        check_api_version(&canonical, &library)?;
        let discovered = discover(&canonical, &library)?;

        let (plugin, symbol) = match (discovered.plugin, discovered.identity) {
            (Some(plugin), _) => (plugin, INTERFACE_SYMBOL),
            (None, Some(identity)) => (
                Arc::new(IdentityOnly(identity)) as Arc<dyn Plugin>,
                IDENTITY_SYMBOL,
            ),
            (None, None) => {
                return Err(PluginHostError::MissingSymbol {
                    path: canonical,
                    symbol: IDENTITY_SYMBOL.to_string(),
                });
            }
        };

        let source = canonical.with_extension(&self.source_extension);
        let source_path = source.exists().then_some(source);

        self.bind(
            id,
            canonical.clone(),
            canonical,
            source_path,
            plugin,
            symbol,
            Some(library),
        )
    }

    /// Wrap a plugin compiled into the host. Keyed as `<static>/<name>`.
    pub fn load_static(&self, id: PluginId, plugin: Arc<dyn Plugin>) -> Result<PluginHandle> {
        let name = identity_of(&plugin, Path::new(STATIC_PREFIX))?.name;
        let key = Path::new(STATIC_PREFIX).join(&name);
        self.bind(id, key, PathBuf::new(), None, plugin, STATIC_SYMBOL, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn bind(
        &self,
        id: PluginId,
        key: PathBuf,
        compiled_path: PathBuf,
        source_path: Option<PathBuf>,
        plugin: Arc<dyn Plugin>,
        symbol: &str,
        library: Option<Arc<Library>>,
    ) -> Result<PluginHandle> {
        let identity = identity_of(&plugin, &key)?;

        let ctx = ValidationContext::new(key.parent(), Some(Mechanism::Native));
        let report = self.validator.validate(&identity, &ctx);
        if !report.is_ok() {
            return Err(PluginHostError::BadIdentity {
                path: key,
                errors: report.errors,
            });
        }
        for warning in &report.warnings {
            tracing::warn!(plugin = %identity.name, path = %key.display(), "{}", warning);
        }

        let hooks = Arc::new(HookRegistry::new(id));
        std::panic::catch_unwind(AssertUnwindSafe(|| plugin.register_hooks(&hooks))).map_err(
            |_| PluginHostError::Panicked {
                name: identity.name.clone(),
                during: "register_hooks".to_string(),
            },
        )?;

        let mut services = ServiceRegistry::new();
        services.set_inproc(
            identity.name.clone(),
            NativeService {
                symbol: symbol.to_string(),
                plugin: Arc::clone(&plugin),
            },
        );

        let state = Arc::new(StateCell::new(LifecycleState::Discovered));
        let mut handle = PluginHandle::new(HandleParts {
            id,
            key,
            compiled_path,
            source_path,
            identity,
            hooks,
            services,
            backend: Backend::Native { plugin, library },
            state: Arc::clone(&state),
            warnings: report.warnings,
        });
        if let Err(e) = handle.validate() {
            let _ = state.transition(LifecycleState::Failed);
            return Err(e);
        }
        let _ = state.transition(LifecycleState::Loaded);

        tracing::info!(
            plugin = %handle.logger(),
            version = %handle.identity().version,
            symbol,
            hooks = handle.hooks().count(),
            "Plugin loaded"
        );
        Ok(handle)
    }
}

/// Load the identity from a freshly built library without keeping it.
///
/// Used as the builder's smoke test; the library is closed again before
/// returning, so the artifact can be replaced by the next build.
pub fn probe(path: &Path) -> Result<Identity> {
    let canonical = readable(path)?;
    // SAFETY: the artifact was just produced by the configured toolchain from
    // a plugin source in the operator's plugin directory.
    let library = unsafe { Library::new(&canonical) }.map_err(|source| {
        PluginHostError::NativeOpen {
            path: canonical.clone(),
            source,
        }
    })?;
    check_api_version(&canonical, &library)?;
    let discovered = discover(&canonical, &library)?;
    let identity = match (discovered.identity, discovered.plugin) {
        (Some(identity), _) => identity,
        (None, Some(plugin)) => identity_of(&plugin, &canonical)?,
        (None, None) => {
            return Err(PluginHostError::MissingSymbol {
                path: canonical,
                symbol: IDENTITY_SYMBOL.to_string(),
            });
        }
    };
    // Strip callback pointers into the library before it is closed
    let identity: Identity = serde_json::from_str(&serde_json::to_string(&identity)?)?;
    drop(library);
    Ok(identity)
}

fn readable(path: &Path) -> Result<PathBuf> {
    let canonical = std::fs::canonicalize(path).map_err(|e| {
        PluginHostError::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })?;
    std::fs::File::open(&canonical).map_err(|e| {
        PluginHostError::Io(std::io::Error::new(
            e.kind(),
            format!("{} is not readable: {}", canonical.display(), e),
        ))
    })?;
    Ok(canonical)
}

fn open(canonical: &Path) -> Result<Arc<Library>> {
    let mut cache = libraries().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(library) = cache.get(canonical) {
        tracing::debug!(path = %canonical.display(), "Reusing resident library");
        return Ok(Arc::clone(library));
    }
    // SAFETY: loading a plugin the operator placed in the plugin directory.
    // Its initialisers run now; the plugin is expected to follow the
    // export_plugin! contract.
    let library = unsafe { Library::new(canonical) }.map_err(|source| {
        PluginHostError::NativeOpen {
            path: canonical.to_path_buf(),
            source,
        }
    })?;
    let library = Arc::new(library);
    cache.insert(canonical.to_path_buf(), Arc::clone(&library));
    Ok(library)
}

/// Read the catalog, or probe the well-known names when there is none
fn discover(path: &Path, library: &Library) -> Result<Discovered> {
    // SAFETY: the catalog symbol, when present, has the CatalogFn signature and
    // returns a heap pointer whose ownership passes to us.
    let catalog = unsafe { library.get::<CatalogFn>(&symbol_bytes(CATALOG_SYMBOL)) }
        .ok()
        .map(|f| unsafe { *Box::from_raw(f()) });

    let symbols = match catalog {
        Some(symbols) => symbols,
        None => {
            tracing::debug!(path = %path.display(), "No symbol catalog, probing well-known names");
            [
                (IDENTITY_SYMBOL, IDENTITY_TYPE_TAG),
                (INTERFACE_SYMBOL, INTERFACE_TYPE_TAG),
                (API_VERSION_SYMBOL, API_VERSION_TYPE_TAG),
            ]
            .into_iter()
            // SAFETY: only checks for presence; nothing is called.
            .filter(|(name, _)| unsafe { library.get::<*const ()>(&symbol_bytes(name)) }.is_ok())
            .map(|(name, tag)| ExportedSymbol::new(name, tag))
            .collect()
        }
    };
    for symbol in &symbols {
        tracing::trace!(path = %path.display(), symbol = %symbol.name, type_tag = %symbol.type_tag, "Exported symbol");
    }

    let mut discovered = Discovered {
        symbols,
        identity: None,
        plugin: None,
    };

    if discovered.has(IDENTITY_SYMBOL, IDENTITY_TYPE_TAG) {
        // SAFETY: catalogued with the Identity tag, so it has the IdentityFn
        // signature and returns an owned Box<Identity>.
        let identity = unsafe {
            let f = library.get::<IdentityFn>(&symbol_bytes(IDENTITY_SYMBOL)).map_err(|_| {
                PluginHostError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol: IDENTITY_SYMBOL.to_string(),
                }
            })?;
            *Box::from_raw(f())
        };
        discovered.identity = Some(identity);
    }

    if discovered.has(INTERFACE_SYMBOL, INTERFACE_TYPE_TAG) {
        // SAFETY: catalogued with the Plugin tag, so it returns an owned
        // Box<Arc<dyn Plugin>>.
        let plugin = unsafe {
            let f = library.get::<InterfaceFn>(&symbol_bytes(INTERFACE_SYMBOL)).map_err(|_| {
                PluginHostError::MissingSymbol {
                    path: path.to_path_buf(),
                    symbol: INTERFACE_SYMBOL.to_string(),
                }
            })?;
            *Box::from_raw(f())
        };
        discovered.plugin = Some(plugin);
    }

    Ok(discovered)
}

/// Resolve the version symbol by name and compare it with ours
fn check_api_version(path: &Path, library: &Library) -> Result<()> {
    // SAFETY: `_goplug_api_version` takes no arguments and returns a plain u32;
    // no Rust type crosses the boundary.
    let version_fn = unsafe { library.get::<ApiVersionFn>(&symbol_bytes(API_VERSION_SYMBOL)) }
        .map_err(|_| PluginHostError::MissingSymbol {
            path: path.to_path_buf(),
            symbol: API_VERSION_SYMBOL.to_string(),
        })?;
    let found = version_fn();
    if found != API_VERSION {
        return Err(PluginHostError::ApiVersionMismatch {
            expected: API_VERSION,
            found,
        });
    }
    Ok(())
}

fn identity_of(plugin: &Arc<dyn Plugin>, path: &Path) -> Result<Identity> {
    std::panic::catch_unwind(AssertUnwindSafe(|| plugin.identity())).map_err(|_| {
        PluginHostError::Panicked {
            name: path.display().to_string(),
            during: "identity".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use goplug_plugin_api::{CallbackKind, PluginContext, PluginError, Value};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Linked;

    fn init(_ctx: &PluginContext, _args: &[Value]) -> std::result::Result<(), PluginError> {
        Ok(())
    }

    impl Plugin for Linked {
        fn identity(&self) -> Identity {
            Identity::new("linked", "0.3.0")
                .maintainer("x@y")
                .description("linked into the host")
                .repository("r")
                .native()
                .on(CallbackKind::Initialise, "Init", init)
        }

        fn register_hooks(&self, hooks: &HookRegistry) {
            hooks.register("Ping", |_: &PluginContext, _: &[Value]| Ok(Value::Nil), Vec::<&str>::new());
        }
    }

    fn mechanism() -> NativeMechanism {
        NativeMechanism::new(Arc::new(Validator::new()), "rs")
    }

    #[test]
    fn test_accepts_platform_libraries_only() {
        let native = mechanism();
        let lib = format!("goplug-hello.{}", std::env::consts::DLL_EXTENSION);
        assert!(native.accepts(Path::new(&lib)));
        assert!(!native.accepts(Path::new("goplug-hello")));
        assert!(!native.accepts(Path::new("goplug-hello.json")));
    }

    #[test]
    fn test_static_plugin_binds() {
        let handle = mechanism()
            .load_static(PluginId(1), Arc::new(Linked))
            .unwrap();
        assert_eq!(handle.key(), Path::new("<static>/linked"));
        assert_eq!(handle.state(), LifecycleState::Loaded);
        assert_eq!(handle.mechanism(), Mechanism::Native);
        assert!(handle.hooks().has("Ping"));
        assert_eq!(handle.logger(), "linked[native]");
    }

    #[test]
    fn test_invalid_static_identity_is_bad_identity() {
        struct Nameless;
        impl Plugin for Nameless {
            fn identity(&self) -> Identity {
                Identity::new("", "1.0.0").native()
            }
        }
        let err = mechanism()
            .load_static(PluginId(2), Arc::new(Nameless))
            .unwrap_err();
        assert!(matches!(err, PluginHostError::BadIdentity { .. }), "{err}");
    }

    #[test]
    fn test_missing_file_is_io() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("goplug-none.so");
        let err = mechanism().load(PluginId(3), &path).unwrap_err();
        assert!(matches!(err, PluginHostError::Io(_)), "{err}");
    }

    #[test]
    fn test_garbage_library_is_native_open() {
        let dir = TempDir::new().unwrap();
        let path = dir
            .path()
            .join(format!("goplug-junk.{}", std::env::consts::DLL_EXTENSION));
        std::fs::write(&path, b"definitely not an object file").unwrap();
        let err = mechanism().load(PluginId(4), &path).unwrap_err();
        assert!(matches!(err, PluginHostError::NativeOpen { .. }), "{err}");
    }
}
