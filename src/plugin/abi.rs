//! Entry points a plugin module exports.
//!
//! A plugin is a shared library built against this crate that exports two
//! symbols:
//!
//! ```c
//! void  camchain_plugin_register_types(void *scope);
//! void *camchain_plugin_create_driver(void *scope);
//! ```
//!
//! `scope` points to a [`PluginScope`] owned by the loader. The first entry
//! point records the ABI version and the unit kinds the module provides; the
//! second returns a boxed [`UnitDriver`] produced with [`driver_to_raw`].
//! Both are generated by [`define_plugin!`](crate::define_plugin).

use crate::driver::UnitDriver;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

/// Current ABI version. Plugins must report this version to be loaded.
pub const CAMCHAIN_ABI_VERSION: u32 = 1;

/// Symbol name of the type-registration entry point.
pub const REGISTER_TYPES_SYMBOL: &[u8] = b"camchain_plugin_register_types\0";

/// Symbol name of the driver-construction entry point.
pub const CREATE_DRIVER_SYMBOL: &[u8] = b"camchain_plugin_create_driver\0";

/// Type of the type-registration entry point.
pub type RegisterTypesFn = unsafe extern "C" fn(scope: *mut c_void);

/// Type of the driver-construction entry point.
pub type CreateDriverFn = unsafe extern "C" fn(scope: *mut c_void) -> *mut c_void;

/// Module-level registration context handed to a plugin while it loads.
#[derive(Debug)]
pub struct PluginScope {
    path: PathBuf,
    name: Option<String>,
    abi_version: Option<u32>,
    kinds: Vec<String>,
}

impl PluginScope {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            name: None,
            abi_version: None,
            kinds: Vec::new(),
        }
    }

    /// Path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the ABI version the plugin was built against.
    pub fn declare_abi(&mut self, version: u32) {
        self.abi_version = Some(version);
    }

    /// Record the plugin's name.
    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    /// Record a unit kind provided by the module (usually its canonical id).
    pub fn register_kind(&mut self, kind: &str) {
        if !self.kinds.iter().any(|k| k == kind) {
            self.kinds.push(kind.to_string());
        }
    }

    pub(crate) fn abi_version(&self) -> Option<u32> {
        self.abi_version
    }

    pub(crate) fn into_parts(self) -> (Option<String>, Vec<String>) {
        (self.name, self.kinds)
    }
}

/// Box a driver for return across the plugin boundary.
pub fn driver_to_raw(driver: UnitDriver) -> *mut c_void {
    Box::into_raw(Box::new(driver)) as *mut c_void
}

/// Reclaim a driver returned by [`driver_to_raw`].
///
/// # Safety
///
/// `ptr` must come from `driver_to_raw` and must not be reclaimed twice.
pub unsafe fn driver_from_raw(ptr: *mut c_void) -> UnitDriver {
    // SAFETY: Caller guarantees ptr was created by driver_to_raw.
    let boxed: Box<UnitDriver> = unsafe { Box::from_raw(ptr as *mut UnitDriver) };
    *boxed
}

/// Export the plugin entry points from a `cdylib`.
///
/// ```rust,ignore
/// use camchain::driver::UnitDriver;
/// use camchain::unit::UnitFlags;
///
/// camchain::define_plugin! {
///     name: "invert",
///     kinds: ["filter.invert"],
///     driver: || UnitDriver::stock("filter", "invert", "Invert", UnitFlags::NONE, invert_kind),
/// }
/// ```
#[macro_export]
macro_rules! define_plugin {
    (
        name: $name:literal,
        kinds: [$($kind:literal),* $(,)?],
        driver: $driver:expr $(,)?
    ) => {
        /// Plugin type-registration entry point.
        ///
        /// # Safety
        ///
        /// `scope` must be null or point to a live `PluginScope`.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn camchain_plugin_register_types(scope: *mut ::std::ffi::c_void) {
            // SAFETY: the loader passes a valid, exclusive PluginScope pointer.
            let scope = unsafe { (scope as *mut $crate::plugin::PluginScope).as_mut() };
            if let Some(scope) = scope {
                scope.declare_abi($crate::plugin::CAMCHAIN_ABI_VERSION);
                scope.set_name($name);
                $( scope.register_kind($kind); )*
            }
        }

        /// Plugin driver-construction entry point.
        ///
        /// # Safety
        ///
        /// `scope` must be null or point to a live `PluginScope`.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn camchain_plugin_create_driver(
            _scope: *mut ::std::ffi::c_void,
        ) -> *mut ::std::ffi::c_void {
            let ctor: fn() -> $crate::driver::UnitDriver = $driver;
            $crate::plugin::driver_to_raw(ctor())
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{UnitFlags, UnitKind};

    struct Nothing;
    impl UnitKind for Nothing {}

    #[test]
    fn test_abi_version() {
        assert_eq!(CAMCHAIN_ABI_VERSION, 1);
        assert!(REGISTER_TYPES_SYMBOL.ends_with(b"\0"));
        assert!(CREATE_DRIVER_SYMBOL.ends_with(b"\0"));
    }

    #[test]
    fn test_driver_raw_round_trip() {
        let driver = UnitDriver::stock("test", "raw", "Raw", UnitFlags::NONE, || Box::new(Nothing));
        let id = driver.id();
        let ptr = driver_to_raw(driver);
        assert!(!ptr.is_null());
        let driver = unsafe { driver_from_raw(ptr) };
        assert_eq!(driver.id(), id);
        assert_eq!(driver.name(), "raw");
    }

    #[test]
    fn test_scope_dedups_kinds() {
        let mut scope = PluginScope::new(Path::new("/tmp/libx.so"));
        scope.declare_abi(CAMCHAIN_ABI_VERSION);
        scope.register_kind("filter.x");
        scope.register_kind("filter.x");
        assert_eq!(scope.abi_version(), Some(1));
        let (name, kinds) = scope.into_parts();
        assert!(name.is_none());
        assert_eq!(kinds, vec!["filter.x".to_string()]);
    }

    mod exported {
        crate::define_plugin! {
            name: "selftest",
            kinds: ["test.selftest"],
            driver: || crate::driver::UnitDriver::stock(
                "test",
                "selftest",
                "Self test",
                crate::unit::UnitFlags::NONE,
                || Box::new(super::Nothing),
            ),
        }
    }

    #[test]
    fn test_macro_entry_points() {
        let mut scope = PluginScope::new(Path::new("selftest"));
        unsafe {
            exported::camchain_plugin_register_types(&mut scope as *mut PluginScope as *mut c_void);
        }
        assert_eq!(scope.abi_version(), Some(CAMCHAIN_ABI_VERSION));

        let raw = unsafe {
            exported::camchain_plugin_create_driver(&mut scope as *mut PluginScope as *mut c_void)
        };
        let driver = unsafe { driver_from_raw(raw) };
        assert_eq!(driver.package(), "test");

        let (name, kinds) = scope.into_parts();
        assert_eq!(name.as_deref(), Some("selftest"));
        assert_eq!(kinds, vec!["test.selftest".to_string()]);
    }
}
