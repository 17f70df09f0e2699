//! Unit drivers and descriptions.
//!
//! A driver enumerates [`Description`]s, lightweight records naming a unit
//! that can be instantiated, and builds [`Unit`]s from them. The stage
//! specific part lives behind [`DriverBackend`]: a stock backend exposes a
//! single fixed description, while probing backends (hardware enumeration,
//! network announcements) add and remove descriptions as devices come and go.
//!
//! Canonical unit ids have the form `<package>.<driver>[:<instance>]`, for
//! example `input.v4l2:/dev/video0` or `filter.passthrough`.

use crate::error::{Error, Result};
use crate::listeners::{ListenerId, Listeners};
use crate::plugin::PluginModule;
use crate::unit::{Unit, UnitFlags, UnitKind};
use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

// ============================================================================
// Identifiers
// ============================================================================

/// Process-unique identity of a driver instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(u64);

impl DriverId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver#{}", self.0)
    }
}

/// Build a canonical unit id.
pub fn canonical_id(package: &str, driver: &str, instance: Option<&str>) -> String {
    let mut id = String::with_capacity(package.len() + driver.len() + 16);
    if !package.is_empty() {
        id.push_str(package);
        id.push('.');
    }
    id.push_str(driver);
    if let Some(instance) = instance {
        id.push(':');
        id.push_str(instance);
    }
    id
}

// ============================================================================
// Description
// ============================================================================

/// Immutable record naming an instantiable unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Description {
    id: String,
    name: String,
    flags: UnitFlags,
    instance: Option<String>,
    driver: DriverId,
}

impl Description {
    /// Canonical unit id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability flags stamped onto units created from this description.
    pub fn flags(&self) -> UnitFlags {
        self.flags
    }

    /// Instance suffix of the id, if any.
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Driver that owns this description.
    pub fn driver(&self) -> DriverId {
        self.driver
    }
}

/// Change to a driver's description set.
#[derive(Clone, Debug)]
pub enum DescriptionEvent {
    /// A description was registered.
    Added(Arc<Description>),
    /// A description is being removed; it is dropped after listeners return.
    Removed(Arc<Description>),
}

impl DescriptionEvent {
    /// The description the event is about.
    pub fn description(&self) -> &Arc<Description> {
        match self {
            DescriptionEvent::Added(d) | DescriptionEvent::Removed(d) => d,
        }
    }
}

/// Description added/removed callback.
pub type DescriptionListener = dyn FnMut(&DescriptionEvent) + Send;

// ============================================================================
// Driver core
// ============================================================================

/// Identity and description set shared by every driver.
///
/// Backends receive a `&mut DriverCore` in their hooks to publish or
/// withdraw descriptions.
pub struct DriverCore {
    id: DriverId,
    package: String,
    name: String,
    descriptions: Vec<Arc<Description>>,
    listeners: Listeners<DescriptionListener>,
}

impl DriverCore {
    fn new(package: &str, name: &str) -> Self {
        Self {
            id: DriverId::next(),
            package: package.to_string(),
            name: name.to_string(),
            descriptions: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    /// Driver identity.
    pub fn id(&self) -> DriverId {
        self.id
    }

    /// Package prefix, e.g. `"input"`.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Driver name, e.g. `"v4l2"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a description for `<package>.<driver>[:<instance>]`.
    ///
    /// An existing description with the same canonical id is kept and the
    /// new one rejected.
    pub fn add_description(
        &mut self,
        name: &str,
        instance: Option<&str>,
        flags: UnitFlags,
    ) -> Result<Arc<Description>> {
        let id = canonical_id(&self.package, &self.name, instance);
        if self.find(&id).is_some() {
            error!(id = %id, "duplicate unit description, keeping the original");
            return Err(Error::DuplicateDescription(id));
        }
        let description = Arc::new(Description {
            id,
            name: name.to_string(),
            flags,
            instance: instance.map(str::to_string),
            driver: self.id,
        });
        debug!(id = %description.id, "unit description added");
        self.descriptions.push(description.clone());
        self.emit(&DescriptionEvent::Added(description.clone()));
        Ok(description)
    }

    /// Withdraw a description. Listeners see it before it is dropped.
    pub fn remove_description(&mut self, id: &str) -> Result<()> {
        let index = self
            .descriptions
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::DescriptionNotFound(id.to_string()))?;
        let description = self.descriptions.remove(index);
        debug!(id = %description.id, "unit description removed");
        self.emit(&DescriptionEvent::Removed(description));
        Ok(())
    }

    /// Withdraw every description, in registration order.
    pub fn clear(&mut self) {
        for description in std::mem::take(&mut self.descriptions) {
            self.emit(&DescriptionEvent::Removed(description));
        }
    }

    /// Look up a description by canonical id.
    pub fn find(&self, id: &str) -> Option<&Arc<Description>> {
        self.descriptions.iter().find(|d| d.id == id)
    }

    /// Current descriptions, in registration order.
    pub fn descriptions(&self) -> &[Arc<Description>] {
        &self.descriptions
    }

    fn emit(&mut self, event: &DescriptionEvent) {
        for cb in self.listeners.iter_mut() {
            cb(event);
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Family-specific part of a driver.
pub trait DriverBackend: Send {
    /// Populate descriptions (scan hardware, open announcement sockets...).
    fn start(&mut self, core: &mut DriverCore) -> Result<()>;

    /// Release anything acquired in `start`. Descriptions are withdrawn by
    /// the driver afterwards.
    fn stop(&mut self, core: &mut DriverCore) -> Result<()> {
        let _ = core;
        Ok(())
    }

    /// Build the kind for one of this driver's descriptions.
    fn create_unit(&mut self, description: &Description) -> Result<Box<dyn UnitKind>>;

    /// Descriptor that becomes readable when the description set may have
    /// changed and [`update`](DriverBackend::update) should run.
    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Refresh the description set after a notification.
    fn update(&mut self, core: &mut DriverCore) -> Result<()> {
        let _ = core;
        Ok(())
    }
}

/// Constructor used by stock drivers.
pub type UnitConstructor = fn() -> Box<dyn UnitKind>;

/// Backend with one fixed description.
struct StockBackend {
    label: String,
    flags: UnitFlags,
    ctor: UnitConstructor,
}

impl DriverBackend for StockBackend {
    fn start(&mut self, core: &mut DriverCore) -> Result<()> {
        core.add_description(&self.label, None, self.flags)?;
        Ok(())
    }

    fn create_unit(&mut self, _description: &Description) -> Result<Box<dyn UnitKind>> {
        Ok((self.ctor)())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// A factory for one family of units.
pub struct UnitDriver {
    core: DriverCore,
    backend: Box<dyn DriverBackend>,
    // Dropped last: the backend's code may live in this module.
    module: Option<Arc<PluginModule>>,
}

impl UnitDriver {
    /// Driver with a custom backend.
    pub fn new(package: &str, name: &str, backend: Box<dyn DriverBackend>) -> Self {
        Self {
            core: DriverCore::new(package, name),
            backend,
            module: None,
        }
    }

    /// Driver exposing the single description `<package>.<name>`.
    pub fn stock(
        package: &str,
        name: &str,
        label: &str,
        flags: UnitFlags,
        ctor: UnitConstructor,
    ) -> Self {
        Self::new(
            package,
            name,
            Box::new(StockBackend {
                label: label.to_string(),
                flags,
                ctor,
            }),
        )
    }

    /// Driver identity.
    pub fn id(&self) -> DriverId {
        self.core.id
    }

    /// Package prefix.
    pub fn package(&self) -> &str {
        &self.core.package
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current descriptions.
    pub fn descriptions(&self) -> &[Arc<Description>] {
        self.core.descriptions()
    }

    /// Look up a description by canonical id.
    pub fn find_description(&self, id: &str) -> Option<&Arc<Description>> {
        self.core.find(id)
    }

    /// Publish a description (see [`DriverCore::add_description`]).
    pub fn add_description(
        &mut self,
        name: &str,
        instance: Option<&str>,
        flags: UnitFlags,
    ) -> Result<Arc<Description>> {
        self.core.add_description(name, instance, flags)
    }

    /// Withdraw a description.
    pub fn remove_description(&mut self, id: &str) -> Result<()> {
        self.core.remove_description(id)
    }

    /// Populate descriptions.
    pub fn start(&mut self) -> Result<()> {
        info!(package = %self.core.package, driver = %self.core.name, "starting driver");
        self.backend.start(&mut self.core)
    }

    /// Withdraw and drop every description.
    pub fn stop(&mut self) -> Result<()> {
        info!(package = %self.core.package, driver = %self.core.name, "stopping driver");
        let result = self.backend.stop(&mut self.core);
        self.core.clear();
        result
    }

    /// Withdraw every description without stopping the backend.
    pub(crate) fn withdraw_descriptions(&mut self) {
        self.core.clear();
    }

    /// Instantiate a unit, stamping it with the description's id, name and flags.
    pub fn create_unit(&mut self, description: &Description) -> Result<Unit> {
        if description.driver != self.core.id || self.core.find(&description.id).is_none() {
            error!(id = %description.id, driver = %self.core.name, "description does not belong to this driver");
            return Err(Error::ForeignDescription(description.id.clone()));
        }
        let kind = self.backend.create_unit(description)?;
        let mut unit = Unit::new(
            description.id.clone(),
            description.name.clone(),
            description.flags,
            kind,
        );
        unit.set_module(self.module.clone());
        debug!(id = %description.id, handle = %unit.handle(), "unit created");
        Ok(unit)
    }

    /// Descriptor signalling that [`update`](Self::update) should run.
    pub fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        self.backend.notification_fd()
    }

    /// Refresh the description set.
    pub fn update(&mut self) -> Result<()> {
        self.backend.update(&mut self.core)
    }

    /// Observe description changes.
    pub fn subscribe(&mut self, cb: Box<DescriptionListener>) -> ListenerId {
        self.core.listeners.subscribe(cb)
    }

    /// Remove a listener.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.core.listeners.unsubscribe(id)
    }

    /// Plugin module the driver was loaded from.
    pub fn module(&self) -> Option<&Arc<PluginModule>> {
        self.module.as_ref()
    }

    /// Take ownership of a driver built inside a plugin.
    ///
    /// The plugin links its own copy of the id counter, so the driver and
    /// any descriptions it already carries are re-stamped with an id from
    /// this process.
    pub(crate) fn adopt(&mut self, module: Arc<PluginModule>) {
        let id = DriverId::next();
        self.core.id = id;
        for description in &mut self.core.descriptions {
            let mut restamped = Description::clone(description);
            restamped.driver = id;
            *description = Arc::new(restamped);
        }
        self.module = Some(module);
    }
}

impl fmt::Debug for UnitDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitDriver")
            .field("id", &self.core.id)
            .field("package", &self.core.package)
            .field("name", &self.core.name)
            .field("descriptions", &self.core.descriptions.len())
            .finish()
    }
}
