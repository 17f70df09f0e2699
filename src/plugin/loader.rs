//! Dynamic plugin loading using libloading.

use super::abi::{
    CAMCHAIN_ABI_VERSION, CREATE_DRIVER_SYMBOL, CreateDriverFn, PluginScope,
    REGISTER_TYPES_SYMBOL, RegisterTypesFn, driver_from_raw,
};
use crate::driver::UnitDriver;
use libloading::{Library, Symbol};
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Environment variable holding extra plugin directories, `:`-separated.
pub const PLUGIN_PATH_ENV: &str = "CAMCHAIN_PLUGIN_PATH";

/// Plugin directory compiled into the library.
pub const DEFAULT_PLUGIN_DIR: &str = match option_env!("CAMCHAIN_DEFAULT_PLUGIN_DIR") {
    Some(dir) => dir,
    None => "/usr/local/lib/camchain/plugins",
};

/// Errors that can occur when loading plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Failed to load the shared library.
    #[error("failed to load library: {0}")]
    LoadFailed(String),

    /// The plugin doesn't export a required entry point.
    #[error("missing plugin entry point: {0}")]
    MissingEntryPoint(&'static str),

    /// The plugin returned no driver.
    #[error("plugin returned a null driver")]
    NullDriver,

    /// ABI version mismatch.
    #[error("ABI version mismatch: expected {expected}, got {actual}")]
    AbiMismatch {
        /// Expected ABI version.
        expected: u32,
        /// Actual ABI version found (0 if none was declared).
        actual: u32,
    },
}

/// A loaded plugin module.
///
/// Drivers and units created from the module hold an `Arc` to it, so the
/// library stays mapped until the last of them is gone.
pub struct PluginModule {
    name: String,
    path: PathBuf,
    kinds: Vec<String>,
    _library: Library,
}

impl PluginModule {
    /// Plugin name (the file stem when the plugin did not set one).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unit kinds the module registered.
    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("kinds", &self.kinds)
            .finish()
    }
}

/// Plugin loader for dynamically loading drivers from shared libraries.
#[derive(Debug, Clone, Default)]
pub struct PluginLoader {
    search_paths: Vec<PathBuf>,
}

impl PluginLoader {
    /// Create a loader with no search paths.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiled-in directory followed by the entries of `CAMCHAIN_PLUGIN_PATH`.
    pub fn default_dirs(read_env: bool) -> Vec<PathBuf> {
        let mut dirs = vec![PathBuf::from(DEFAULT_PLUGIN_DIR)];
        if read_env {
            if let Some(value) = std::env::var_os(PLUGIN_PATH_ENV) {
                dirs.extend(std::env::split_paths(&value).filter(|p| !p.as_os_str().is_empty()));
            }
        }
        dirs
    }

    /// Add a search path for plugins.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.search_paths.contains(&path) {
            self.search_paths.push(path);
        }
    }

    /// Configured search paths.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Plugin candidates in `dir`, sorted by file name.
    ///
    /// Hidden files and libtool `.la` archives are skipped, as is anything
    /// that is not a regular file. A missing directory yields nothing.
    pub fn candidates(dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            trace!(dir = %dir.display(), "plugin directory not readable");
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                !name.starts_with('.') && !name.ends_with(".la")
            })
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        paths.sort();
        paths
    }

    /// Load one plugin module and construct its driver.
    ///
    /// # Safety
    ///
    /// Loading plugins executes arbitrary code from shared libraries. The
    /// library must be built against this crate's ABI version and export
    /// entry points generated by [`define_plugin!`](crate::define_plugin).
    pub unsafe fn load(path: &Path) -> Result<(Arc<PluginModule>, UnitDriver), PluginError> {
        debug!(path = %path.display(), "loading plugin");

        // SAFETY: Loading a dynamic library. Caller ensures the library is trusted.
        let library =
            unsafe { Library::new(path).map_err(|e| PluginError::LoadFailed(e.to_string()))? };

        // SAFETY: Symbols are copied out as plain fn pointers; the library
        // outlives every call below because it is moved into the module only
        // after the driver has been created.
        let (register, create) = unsafe {
            let register: Symbol<RegisterTypesFn> = library
                .get(REGISTER_TYPES_SYMBOL)
                .map_err(|_| PluginError::MissingEntryPoint("camchain_plugin_register_types"))?;
            let create: Symbol<CreateDriverFn> = library
                .get(CREATE_DRIVER_SYMBOL)
                .map_err(|_| PluginError::MissingEntryPoint("camchain_plugin_create_driver"))?;
            (*register, *create)
        };

        let mut scope = PluginScope::new(path);
        let scope_ptr = &mut scope as *mut PluginScope as *mut c_void;

        // SAFETY: The scope outlives the call and is not aliased.
        unsafe { register(scope_ptr) };

        match scope.abi_version() {
            Some(CAMCHAIN_ABI_VERSION) => {}
            other => {
                return Err(PluginError::AbiMismatch {
                    expected: CAMCHAIN_ABI_VERSION,
                    actual: other.unwrap_or(0),
                });
            }
        }

        // SAFETY: ABI version matched; the entry point returns a pointer from driver_to_raw.
        let raw = unsafe { create(scope_ptr) };
        if raw.is_null() {
            return Err(PluginError::NullDriver);
        }
        // SAFETY: Non-null pointer produced by driver_to_raw in the plugin.
        let mut driver = unsafe { driver_from_raw(raw) };

        let (name, kinds) = scope.into_parts();
        let name = name.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        let module = Arc::new(PluginModule {
            name,
            path: path.to_path_buf(),
            kinds,
            _library: library,
        });
        driver.adopt(module.clone());
        debug!(plugin = %module.name, driver = %driver.name(), "plugin loaded");
        Ok((module, driver))
    }
}
