//! Registry of unit drivers.
//!
//! The [`UnitManager`] aggregates built-in and plugin drivers, re-emits their
//! description events at manager scope and keeps duplicated copies of their
//! notification descriptors so a chain can poll them alongside its units.
//!
//! There is no global instance: construct one manager and share its
//! [`ManagerHandle`] with every chain that instantiates units by id.
//!
//! ```rust,ignore
//! use camchain::prelude::*;
//!
//! let manager = UnitManager::new(ManagerConfig::default()).into_handle();
//! let mut chain = Chain::with_manager(manager.clone());
//! chain.add_unit_by_id("input.test_pattern")?;
//! chain.add_unit_by_id("filter.passthrough")?;
//! ```

use crate::driver::{Description, DescriptionEvent, DescriptionListener, DriverId, UnitDriver};
use crate::error::{Error, Result};
use crate::fd::dup_cloexec;
use crate::listeners::{ListenerId, Listeners};
use crate::observability;
use crate::plugin::{PluginError, PluginLoader};
use crate::unit::Unit;
use crate::units;
use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Shared handle to a manager.
pub type ManagerHandle = Arc<Mutex<UnitManager>>;

/// Lock a manager handle, recovering from a poisoned lock.
pub fn lock(handle: &ManagerHandle) -> MutexGuard<'_, UnitManager> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Configuration
// ============================================================================

/// Manager construction options.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Plugin directories, scanned in order.
    pub plugin_dirs: Vec<PathBuf>,
    /// Append the directories listed in `CAMCHAIN_PLUGIN_PATH`.
    pub read_env: bool,
    /// Start drivers as they are added.
    pub start_drivers: bool,
    /// Register the built-in drivers.
    pub register_core: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: PluginLoader::default_dirs(false),
            read_env: true,
            start_drivers: true,
            register_core: true,
        }
    }
}

impl ManagerConfig {
    /// Built-in drivers only: no plugin directories, environment ignored.
    pub fn builtin() -> Self {
        Self {
            plugin_dirs: Vec::new(),
            read_env: false,
            start_drivers: true,
            register_core: true,
        }
    }

    /// Nothing registered and nothing scanned.
    pub fn empty() -> Self {
        Self {
            plugin_dirs: Vec::new(),
            read_env: false,
            start_drivers: true,
            register_core: false,
        }
    }

    /// Append a plugin directory.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dirs.push(dir.into());
        self
    }

    /// Replace the plugin directories.
    pub fn with_plugin_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.plugin_dirs = dirs;
        self
    }

    /// Whether to read `CAMCHAIN_PLUGIN_PATH`.
    pub fn with_read_env(mut self, read_env: bool) -> Self {
        self.read_env = read_env;
        self
    }

    /// Whether to start drivers as they are added.
    pub fn with_start_drivers(mut self, start: bool) -> Self {
        self.start_drivers = start;
        self
    }

    /// Whether to register the built-in drivers.
    pub fn with_core_drivers(mut self, register: bool) -> Self {
        self.register_core = register;
        self
    }

    fn resolved_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.plugin_dirs.clone();
        if self.read_env {
            for dir in PluginLoader::default_dirs(true).into_iter().skip(1) {
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        dirs
    }
}

/// Outcome of scanning one or more plugin directories.
#[derive(Debug, Default)]
pub struct PluginScan {
    /// Names of drivers that were loaded and added.
    pub loaded: Vec<String>,
    /// Candidates that were skipped, with the reason.
    pub failed: Vec<(PathBuf, PluginError)>,
}

impl PluginScan {
    fn merge(&mut self, other: PluginScan) {
        self.loaded.extend(other.loaded);
        self.failed.extend(other.failed);
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Registry of every unit driver available to the process.
pub struct UnitManager {
    config: ManagerConfig,
    drivers: Vec<UnitDriver>,
    started: HashSet<DriverId>,
    running: bool,
    watches: Vec<(DriverId, Arc<OwnedFd>)>,
    listeners: Arc<Mutex<Listeners<DescriptionListener>>>,
    loader: PluginLoader,
}

impl UnitManager {
    /// Build a manager: register built-in drivers, scan plugin directories
    /// and, if configured, start everything.
    ///
    /// Plugins that fail to load are logged and skipped.
    pub fn new(config: ManagerConfig) -> Self {
        let mut manager = Self {
            running: config.start_drivers,
            config,
            drivers: Vec::new(),
            started: HashSet::new(),
            watches: Vec::new(),
            listeners: Arc::new(Mutex::new(Listeners::new())),
            loader: PluginLoader::new(),
        };
        if manager.config.register_core {
            manager.register_core_drivers();
        }
        let scan = manager.load_plugins();
        if !scan.loaded.is_empty() || !scan.failed.is_empty() {
            info!(
                loaded = scan.loaded.len(),
                failed = scan.failed.len(),
                "plugin scan finished"
            );
        }
        manager
    }

    /// Wrap the manager in a shareable handle.
    pub fn into_handle(self) -> ManagerHandle {
        Arc::new(Mutex::new(self))
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ========================================================================
    // Drivers
    // ========================================================================

    /// Register a driver.
    ///
    /// Its description events are relayed to manager listeners and its
    /// notification descriptor is watched. A running manager starts the
    /// driver immediately.
    pub fn add_driver(&mut self, mut driver: UnitDriver) -> DriverId {
        let id = driver.id();
        let relay = self.listeners.clone();
        driver.subscribe(Box::new(move |event: &DescriptionEvent| {
            let mut listeners = relay.lock().unwrap_or_else(PoisonError::into_inner);
            for cb in listeners.iter_mut() {
                cb(event);
            }
        }));

        if let Some(fd) = driver.notification_fd() {
            match dup_cloexec(fd) {
                Ok(owned) => self.watches.push((id, Arc::new(owned))),
                Err(e) => {
                    warn!(driver = %driver.name(), error = %e, "cannot watch driver notifications")
                }
            }
        }

        debug!(driver = %id, package = %driver.package(), name = %driver.name(), "driver added");
        self.drivers.push(driver);
        if self.running {
            self.start_driver(id);
        }
        id
    }

    /// Unregister a driver, stopping it first if it was started.
    pub fn remove_driver(&mut self, id: DriverId) -> Result<UnitDriver> {
        let index = self
            .drivers
            .iter()
            .position(|d| d.id() == id)
            .ok_or_else(|| Error::DriverNotFound(id.to_string()))?;
        if self.started.remove(&id) {
            if let Err(e) = self.drivers[index].stop() {
                warn!(driver = %id, error = %e, "driver stop failed");
            }
        } else {
            // descriptions published by hand on a driver that never started
            self.drivers[index].withdraw_descriptions();
        }
        self.watches.retain(|(watched, _)| *watched != id);
        let driver = self.drivers.remove(index);
        debug!(driver = %id, name = %driver.name(), "driver removed");
        Ok(driver)
    }

    /// Start every registered driver that is not already started.
    pub fn start_drivers(&mut self) {
        self.running = true;
        let ids: Vec<DriverId> = self.drivers.iter().map(|d| d.id()).collect();
        for id in ids {
            self.start_driver(id);
        }
    }

    /// Stop every started driver. Their descriptions are withdrawn.
    pub fn stop_drivers(&mut self) {
        self.running = false;
        for driver in &mut self.drivers {
            if !self.started.remove(&driver.id()) {
                continue;
            }
            if let Err(e) = driver.stop() {
                warn!(driver = %driver.name(), error = %e, "driver stop failed");
            }
        }
    }

    fn start_driver(&mut self, id: DriverId) {
        if self.started.contains(&id) {
            return;
        }
        let Some(driver) = self.drivers.iter_mut().find(|d| d.id() == id) else {
            return;
        };
        match driver.start() {
            Ok(()) => {
                self.started.insert(id);
            }
            Err(e) => error!(driver = %driver.name(), error = %e, "driver failed to start"),
        }
    }

    /// Whether the driver has been started.
    pub fn is_started(&self, id: DriverId) -> bool {
        self.started.contains(&id)
    }

    /// Registered drivers, in registration order.
    pub fn drivers(&self) -> &[UnitDriver] {
        &self.drivers
    }

    /// Look up a driver.
    pub fn driver(&self, id: DriverId) -> Option<&UnitDriver> {
        self.drivers.iter().find(|d| d.id() == id)
    }

    /// Mutable access to a driver.
    pub fn driver_mut(&mut self, id: DriverId) -> Option<&mut UnitDriver> {
        self.drivers.iter_mut().find(|d| d.id() == id)
    }

    /// Register the built-in drivers.
    pub fn register_core_drivers(&mut self) {
        for driver in units::core_drivers() {
            self.add_driver(driver);
        }
    }

    // ========================================================================
    // Descriptions
    // ========================================================================

    /// Look up a description by canonical id across every driver.
    pub fn find_description(&self, id: &str) -> Option<Arc<Description>> {
        self.drivers
            .iter()
            .find_map(|d| d.find_description(id))
            .cloned()
    }

    /// Every description currently published, in driver order.
    pub fn descriptions(&self) -> Vec<Arc<Description>> {
        self.drivers
            .iter()
            .flat_map(|d| d.descriptions().iter().cloned())
            .collect()
    }

    /// Instantiate a unit by canonical id.
    pub fn create_unit_by_id(&mut self, id: &str) -> Result<Unit> {
        for driver in &mut self.drivers {
            if let Some(description) = driver.find_description(id).cloned() {
                return driver.create_unit(&description);
            }
        }
        warn!(id = %id, "no unit description with this id");
        Err(Error::DescriptionNotFound(id.to_string()))
    }

    /// Descriptions of drivers in `package`.
    ///
    /// With `recurse`, sub-packages match too (`"input"` matches
    /// `"input.usb"`). Drivers without a package are never listed.
    pub fn list_package(&self, package: &str, recurse: bool) -> Vec<Arc<Description>> {
        self.drivers
            .iter()
            .filter(|d| !d.package().is_empty())
            .filter(|d| package_matches(d.package(), package, recurse))
            .flat_map(|d| d.descriptions().iter().cloned())
            .collect()
    }

    /// Observe description events from every driver.
    pub fn subscribe(&mut self, cb: Box<DescriptionListener>) -> ListenerId {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(cb)
    }

    /// Remove a listener.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unsubscribe(id)
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Driver notification descriptors to poll.
    pub fn notification_fds(&self) -> Vec<(DriverId, Arc<OwnedFd>)> {
        self.watches.clone()
    }

    /// Let a driver refresh its descriptions after its descriptor fired.
    pub fn update_driver(&mut self, id: DriverId) -> Result<()> {
        let driver = self
            .driver_mut(id)
            .ok_or_else(|| Error::DriverNotFound(id.to_string()))?;
        debug!(driver = %driver.name(), "driver update");
        driver.update()
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    /// Scan every configured plugin directory.
    pub fn load_plugins(&mut self) -> PluginScan {
        let mut scan = PluginScan::default();
        for dir in self.config.resolved_dirs() {
            scan.merge(self.add_plugin_dir(&dir));
        }
        scan
    }

    /// Load every plugin candidate in `dir` and register its driver.
    ///
    /// A candidate that fails to load is skipped; the rest of the
    /// directory is still processed.
    pub fn add_plugin_dir(&mut self, dir: &Path) -> PluginScan {
        self.loader.add_search_path(dir);
        let mut scan = PluginScan::default();
        for path in PluginLoader::candidates(dir) {
            // SAFETY: Plugin directories are configured by the application
            // and are trusted to contain modules built for this ABI.
            match unsafe { PluginLoader::load(&path) } {
                Ok((module, driver)) => {
                    info!(plugin = %module.name(), path = %path.display(), "plugin loaded");
                    observability::record_plugin_load(true);
                    scan.loaded.push(driver.name().to_string());
                    self.add_driver(driver);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping plugin");
                    observability::record_plugin_load(false);
                    scan.failed.push((path, e));
                }
            }
        }
        scan
    }

    /// Directories scanned so far.
    pub fn plugin_dirs(&self) -> &[PathBuf] {
        self.loader.search_paths()
    }
}

impl Drop for UnitManager {
    fn drop(&mut self) {
        self.stop_drivers();
    }
}

impl std::fmt::Debug for UnitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitManager")
            .field("drivers", &self.drivers.len())
            .field("started", &self.started.len())
            .field("running", &self.running)
            .field("watches", &self.watches.len())
            .finish()
    }
}

fn package_matches(candidate: &str, query: &str, recurse: bool) -> bool {
    if candidate == query {
        return true;
    }
    if !recurse {
        return false;
    }
    if query.is_empty() {
        return true;
    }
    candidate
        .strip_prefix(query)
        .is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverBackend, DriverCore};
    use crate::fd::EventFd;
    use crate::unit::{UnitFlags, UnitKind};
    use std::os::fd::{AsFd, BorrowedFd};

    struct Nothing;
    impl UnitKind for Nothing {}

    fn nothing() -> Box<dyn UnitKind> {
        Box::new(Nothing)
    }

    #[test]
    fn test_package_matches() {
        assert!(package_matches("input", "input", false));
        assert!(!package_matches("input.usb", "input", false));
        assert!(package_matches("input.usb", "input", true));
        assert!(!package_matches("inputs", "input", true));
        assert!(package_matches("filter", "", true));
    }

    #[test]
    fn test_add_driver_starts_when_running() {
        let mut manager = UnitManager::new(ManagerConfig::empty());
        let id = manager.add_driver(UnitDriver::stock("test", "a", "A", UnitFlags::NONE, nothing));
        assert!(manager.is_started(id));
        assert!(manager.find_description("test.a").is_some());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let mut manager = UnitManager::new(ManagerConfig::empty().with_start_drivers(false));
        let id = manager.add_driver(UnitDriver::stock("test", "a", "A", UnitFlags::NONE, nothing));
        assert!(!manager.is_started(id));
        assert!(manager.descriptions().is_empty());

        manager.start_drivers();
        manager.start_drivers();
        assert_eq!(manager.descriptions().len(), 1);

        manager.stop_drivers();
        manager.stop_drivers();
        assert!(manager.descriptions().is_empty());
        assert!(!manager.is_started(id));
    }

    #[test]
    fn test_events_relayed() {
        let mut manager = UnitManager::new(ManagerConfig::empty());
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        manager.subscribe(Box::new(move |event: &DescriptionEvent| {
            l.lock().unwrap().push(event.description().id().to_string());
        }));
        let id = manager.add_driver(UnitDriver::stock("test", "b", "B", UnitFlags::NONE, nothing));
        manager.remove_driver(id).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["test.b", "test.b"]);
    }

    #[test]
    fn test_remove_unstarted_driver_withdraws_descriptions() {
        let mut manager = UnitManager::new(ManagerConfig::empty().with_start_drivers(false));
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        manager.subscribe(Box::new(move |event: &DescriptionEvent| {
            let removed = matches!(event, DescriptionEvent::Removed(_));
            l.lock().unwrap().push((removed, event.description().id().to_string()));
        }));

        let id = manager.add_driver(UnitDriver::stock("test", "d", "D", UnitFlags::NONE, nothing));
        let driver = manager.driver_mut(id).unwrap();
        driver.add_description("Manual", Some("0"), UnitFlags::NONE).unwrap();
        assert!(!manager.is_started(id));

        let driver = manager.remove_driver(id).unwrap();
        assert!(driver.descriptions().is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec![(false, "test.d:0".to_string()), (true, "test.d:0".to_string())]
        );
    }

    #[test]
    fn test_create_unit_by_id() {
        let mut manager = UnitManager::new(ManagerConfig::empty());
        manager.add_driver(UnitDriver::stock("test", "c", "C", UnitFlags::NONE, nothing));
        let unit = manager.create_unit_by_id("test.c").unwrap();
        assert_eq!(unit.id(), "test.c");
        assert!(matches!(
            manager.create_unit_by_id("test.missing"),
            Err(Error::DescriptionNotFound(_))
        ));
    }

    #[test]
    fn test_list_package() {
        let mut manager = UnitManager::new(ManagerConfig::empty());
        manager.add_driver(UnitDriver::stock("input", "a", "A", UnitFlags::NONE, nothing));
        manager.add_driver(UnitDriver::stock("input.usb", "b", "B", UnitFlags::NONE, nothing));
        manager.add_driver(UnitDriver::stock("filter", "c", "C", UnitFlags::NONE, nothing));
        manager.add_driver(UnitDriver::stock("", "d", "D", UnitFlags::NONE, nothing));

        let flat: Vec<_> = manager
            .list_package("input", false)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(flat, vec!["input.a"]);

        let deep: Vec<_> = manager
            .list_package("input", true)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(deep, vec!["input.a", "input.usb.b"]);

        assert_eq!(manager.list_package("", true).len(), 3);
    }

    #[test]
    fn test_core_drivers_registered() {
        let manager = UnitManager::new(ManagerConfig::builtin());
        for id in [
            "input.test_pattern",
            "input.app",
            "filter.passthrough",
            "output.writer",
        ] {
            assert!(manager.find_description(id).is_some(), "missing {id}");
        }
    }

    struct Probing {
        signal: EventFd,
        found: usize,
    }

    impl DriverBackend for Probing {
        fn start(&mut self, _core: &mut DriverCore) -> Result<()> {
            Ok(())
        }

        fn create_unit(&mut self, _description: &Description) -> Result<Box<dyn UnitKind>> {
            Ok(nothing())
        }

        fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
            Some(self.signal.as_fd())
        }

        fn update(&mut self, core: &mut DriverCore) -> Result<()> {
            while self.signal.try_wait()? > 0 {
                let instance = self.found.to_string();
                core.add_description("Camera", Some(&instance), UnitFlags::DESCRIPTOR_EVENT)?;
                self.found += 1;
            }
            Ok(())
        }
    }

    #[test]
    fn test_notification_watch_and_update() {
        let mut manager = UnitManager::new(ManagerConfig::empty());
        let signal = EventFd::new().unwrap();
        signal.notify().unwrap();
        let id = manager.add_driver(UnitDriver::new(
            "net",
            "cam",
            Box::new(Probing { signal, found: 0 }),
        ));

        let fds = manager.notification_fds();
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].0, id);

        manager.update_driver(id).unwrap();
        assert!(manager.find_description("net.cam:0").is_some());

        manager.remove_driver(id).unwrap();
        assert!(manager.notification_fds().is_empty());
    }
}
