//! Ordered unit pipelines.
//!
//! A [`Chain`] owns a sequence of units wired `unit[i].input = unit[i-1]`.
//! It keeps every unit at the chain's desired status, restarts downstream
//! units whenever an upstream unit re-binds its format, and drives all
//! source units from one scheduler loop (see [`Chain::iterate`]).
//!
//! Only the last unit's frames are relayed as the chain's output.
//!
//! # Example
//!
//! ```rust,ignore
//! use camchain::prelude::*;
//!
//! let manager = UnitManager::new(ManagerConfig::builtin()).into_handle();
//! let mut chain = Chain::with_manager(manager);
//! chain.add_unit_by_id("input.test_pattern")?;
//! chain.add_unit_by_id("filter.passthrough")?;
//! chain.subscribe_frames(Box::new(|frame, format| {
//!     println!("{} bytes of {}", frame.bytes_used(), format);
//! }));
//! chain.set_desired_status(UnitStatus::Streaming)?;
//! loop {
//!     chain.iterate(None)?;
//! }
//! ```

mod events;
mod scheduler;
mod snapshot;

pub use events::{ChainEvent, ChainEventReceiver, ChainEventSender, ChainListener};

use crate::buffer::FrameBuffer;
use crate::error::{Error, Result};
use crate::format::Format;
use crate::listeners::{ListenerId, Listeners};
use crate::manager::{self, ManagerHandle};
use crate::observability::{self, TracingConfig};
use crate::unit::{FrameListener, FrameOutput, StatusChange, Unit, UnitHandle, UnitStatus};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Chain behaviour options.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    /// Span configuration.
    pub tracing: TracingConfig,
    /// Dispatch every ready unit per wakeup instead of only the first.
    pub drain_all_ready: bool,
}

impl ChainConfig {
    /// Set the span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Dispatch every ready unit per wakeup.
    pub fn with_drain_all_ready(mut self, drain: bool) -> Self {
        self.drain_all_ready = drain;
        self
    }
}

type SharedFrameListeners = Arc<Mutex<Listeners<FrameListener>>>;

// ============================================================================
// Chain
// ============================================================================

/// An ordered composition of units.
pub struct Chain {
    name: String,
    config: ChainConfig,
    units: Vec<Unit>,
    desired: UnitStatus,
    manager: Option<ManagerHandle>,

    status_subs: HashMap<UnitHandle, ListenerId>,
    pending: Arc<Mutex<VecDeque<StatusChange>>>,
    suppress: u32,
    recover: Vec<UnitHandle>,

    final_relay: Option<(UnitHandle, ListenerId)>,
    frame_listeners: SharedFrameListeners,
    listeners: Listeners<ChainListener>,
    events: ChainEventSender,
}

impl Chain {
    /// Empty chain without a manager; units are inserted directly.
    pub fn new() -> Self {
        Self::with_config(ChainConfig::default())
    }

    /// Empty chain with explicit configuration.
    pub fn with_config(config: ChainConfig) -> Self {
        Self {
            name: "chain".to_string(),
            config,
            units: Vec::new(),
            desired: UnitStatus::Idle,
            manager: None,
            status_subs: HashMap::new(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            suppress: 0,
            recover: Vec::new(),
            final_relay: None,
            frame_listeners: Arc::new(Mutex::new(Listeners::new())),
            listeners: Listeners::new(),
            events: ChainEventSender::default(),
        }
    }

    /// Empty chain that instantiates units through `manager`.
    pub fn with_manager(manager: ManagerHandle) -> Self {
        Self::new().manager(manager)
    }

    /// Attach a manager.
    pub fn manager(mut self, manager: ManagerHandle) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Name used in logs, spans and metrics labels.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Chain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// The manager, if any.
    pub fn manager_handle(&self) -> Option<&ManagerHandle> {
        self.manager.as_ref()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if the chain has no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units in chain order.
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Status every unit is kept at.
    pub fn desired_status(&self) -> UnitStatus {
        self.desired
    }

    /// Position of a unit.
    pub fn unit_index(&self, unit: UnitHandle) -> Option<usize> {
        self.units.iter().position(|u| u.handle() == unit)
    }

    /// Borrow a unit.
    pub fn unit(&self, unit: UnitHandle) -> Option<&Unit> {
        self.units.iter().find(|u| u.handle() == unit)
    }

    /// Mutably borrow a unit.
    ///
    /// Status changes made through this reference are handled (events,
    /// downstream restarts) at the next chain operation or scheduler
    /// iteration. Use [`set_unit_status`](Self::set_unit_status) to have
    /// them handled immediately.
    pub fn unit_mut(&mut self, unit: UnitHandle) -> Option<&mut Unit> {
        self.units.iter_mut().find(|u| u.handle() == unit)
    }

    /// First unit with this canonical id.
    pub fn find_unit_by_id(&self, id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.id() == id)
    }

    /// Last unit, whose frames are the chain's output.
    pub fn last_unit(&self) -> Option<&Unit> {
        self.units.last()
    }

    fn index_of(&self, unit: UnitHandle) -> Result<usize> {
        self.unit_index(unit).ok_or_else(|| {
            warn!(chain = %self.name, unit = %unit, "unit not in chain");
            Error::UnitNotFound
        })
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Insert a unit at `position` (`0..=len`).
    ///
    /// The unit is wired to its predecessor and raised to the desired
    /// status; its successor, if any, is restarted on top of it.
    pub fn insert(&mut self, mut unit: Unit, position: usize) -> Result<UnitHandle> {
        if position > self.units.len() {
            warn!(chain = %self.name, position, len = self.units.len(), "invalid insert position");
            return Err(Error::InvalidPosition {
                position,
                len: self.units.len(),
            });
        }
        let handle = unit.handle();
        let id = unit.id().to_string();
        self.attach(&mut unit);
        self.link(unit, position);
        info!(chain = %self.name, unit = %id, position, "unit added");
        self.emit(ChainEvent::UnitAdded {
            unit: handle,
            id,
            index: position,
        });
        Ok(handle)
    }

    /// Append a unit.
    pub fn insert_tail(&mut self, unit: Unit) -> Result<UnitHandle> {
        let len = self.units.len();
        self.insert(unit, len)
    }

    /// Instantiate a unit through the manager and append it.
    pub fn add_unit_by_id(&mut self, id: &str) -> Result<UnitHandle> {
        let unit = self.create_unit(id)?;
        self.insert_tail(unit)
    }

    pub(crate) fn create_unit(&self, id: &str) -> Result<Unit> {
        let manager = self.manager.as_ref().ok_or_else(|| {
            warn!(chain = %self.name, id = %id, "cannot create units without a manager");
            Error::NoManager
        })?;
        manager::lock(manager).create_unit_by_id(id)
    }

    /// Remove a unit and hand it back, Idle and disconnected.
    ///
    /// The successor, if any, is rewired to the removed unit's predecessor.
    pub fn remove(&mut self, unit: UnitHandle) -> Result<Unit> {
        let index = self.index_of(unit)?;
        let mut removed = self.unlink(index);
        self.detach(&mut removed);
        info!(chain = %self.name, unit = %removed.id(), "unit removed");
        self.emit(ChainEvent::UnitRemoved {
            unit,
            id: removed.id().to_string(),
        });
        Ok(removed)
    }

    /// Move a unit to `new_index` (`0..len`).
    pub fn reorder(&mut self, unit: UnitHandle, new_index: usize) -> Result<()> {
        let from = self.index_of(unit)?;
        if new_index >= self.units.len() {
            warn!(chain = %self.name, position = new_index, len = self.units.len(), "invalid reorder position");
            return Err(Error::InvalidPosition {
                position: new_index,
                len: self.units.len(),
            });
        }
        if from == new_index {
            return Ok(());
        }
        let moved = self.unlink(from);
        self.link(moved, new_index);
        debug!(chain = %self.name, unit = %unit, from, to = new_index, "unit reordered");
        self.emit(ChainEvent::UnitReordered {
            unit,
            from,
            to: new_index,
        });
        Ok(())
    }

    /// Remove every unit, tail first. The units are shut down and dropped.
    pub fn remove_all(&mut self) {
        while let Some(last) = self.units.last().map(Unit::handle) {
            let _ = self.remove(last);
        }
    }

    fn attach(&mut self, unit: &mut Unit) {
        let pending = self.pending.clone();
        let id = unit.subscribe_status(Box::new(move |change: &StatusChange| {
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(*change);
        }));
        self.status_subs.insert(unit.handle(), id);
    }

    fn detach(&mut self, unit: &mut Unit) {
        // Changes the unit made while linked still belong to this chain.
        self.process_status_changes();
        if let Some(id) = self.status_subs.remove(&unit.handle()) {
            unit.unsubscribe(id);
        }
    }

    /// Place `unit` at `position`, wire it and restart its successor.
    fn link(&mut self, unit: Unit, position: usize) {
        self.units.insert(position, unit);

        self.suppress += 1;
        let _ = self.drive(position, UnitStatus::Idle);
        self.rewire(position);
        let desired = self.desired;
        if let Err(e) = self.drive(position, desired) {
            warn!(chain = %self.name, unit = %self.units[position].id(), error = %e, "unit did not reach the desired status");
        }
        self.suppress -= 1;

        if position + 1 < self.units.len() {
            self.restart(position + 1, None);
        } else {
            if position > 0 {
                self.drop_final_relay(position - 1);
            }
            self.add_final_relay(position);
        }
    }

    /// Take the unit at `index` out, Idle and disconnected, and restart its
    /// successor on top of the predecessor.
    fn unlink(&mut self, index: usize) -> Unit {
        self.suppress += 1;
        let _ = self.drive(index, UnitStatus::Idle);
        let _ = self.units[index].connect_input(None, None);
        self.suppress -= 1;

        let was_last = index + 1 == self.units.len();
        if was_last {
            self.drop_final_relay(index);
        }
        let unit = self.units.remove(index);

        if index < self.units.len() {
            self.restart(index, None);
        } else if index > 0 {
            self.add_final_relay(index - 1);
        }
        unit
    }

    /// Connect the unit at `index` to whatever precedes it now.
    fn rewire(&mut self, index: usize) {
        let (head, tail) = self.units.split_at_mut(index);
        let Some(unit) = tail.first_mut() else {
            return;
        };
        let result = match head.last() {
            Some(input) => unit.connect_input(Some(input.handle()), input.output_format()),
            None => unit.connect_input(None, None),
        };
        if let Err(e) = result {
            warn!(chain = %self.name, unit = %unit.id(), error = %e, "failed to rewire unit");
        }
    }

    /// Force the unit at `index` Idle, rewire it and raise it again.
    ///
    /// With `None`, the unit returns to the status it had before.
    fn restart(&mut self, index: usize, target: Option<UnitStatus>) {
        let target = target.unwrap_or_else(|| self.units[index].status());
        let span = self
            .config
            .tracing
            .unit_span(self.units[index].id(), "restart");
        let _guard = span.enter();

        if let Err(e) = self.drive(index, UnitStatus::Idle) {
            warn!(chain = %self.name, unit = %self.units[index].id(), error = %e, "unit did not go idle");
        }
        self.rewire(index);
        if let Err(e) = self.drive(index, target) {
            warn!(chain = %self.name, unit = %self.units[index].id(), error = %e, "unit did not come back up");
        }
    }

    // ========================================================================
    // Final frame relay
    // ========================================================================

    fn add_final_relay(&mut self, index: usize) {
        let relay = self.frame_listeners.clone();
        let unit = &mut self.units[index];
        let id = unit.subscribe_frames(Box::new(move |frame: &FrameBuffer, format: &Format| {
            let mut listeners = relay.lock().unwrap_or_else(PoisonError::into_inner);
            for cb in listeners.iter_mut() {
                cb(frame, format);
            }
        }));
        self.final_relay = Some((unit.handle(), id));
    }

    fn drop_final_relay(&mut self, index: usize) {
        let unit = &mut self.units[index];
        if let Some((handle, id)) = self.final_relay {
            if handle == unit.handle() {
                unit.unsubscribe(id);
                self.final_relay = None;
            }
        }
    }

    /// Receive every frame produced by the last unit.
    pub fn subscribe_frames(&mut self, cb: Box<FrameListener>) -> ListenerId {
        self.frame_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(cb)
    }

    /// Remove a frame listener.
    pub fn unsubscribe_frames(&mut self, id: ListenerId) -> bool {
        self.frame_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unsubscribe(id)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Bring every unit to `status`, one hook at a time.
    ///
    /// Units that fail are left where they stopped; the rest of the chain
    /// is still processed. The first failure is returned.
    pub fn set_desired_status(&mut self, status: UnitStatus) -> Result<()> {
        info!(chain = %self.name, status = %status, "desired status");
        self.desired = status;
        let mut first_error = None;
        for index in 0..self.units.len() {
            if let Err(e) = self.drive(index, status) {
                warn!(chain = %self.name, unit = %self.units[index].id(), error = %e, "unit failed to reach the desired status");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shorthand for `set_desired_status(Ready)`.
    pub fn all_units_stream_init(&mut self) -> Result<()> {
        self.set_desired_status(UnitStatus::Ready)
    }

    /// Shorthand for `set_desired_status(Idle)`.
    pub fn all_units_stream_shutdown(&mut self) -> Result<()> {
        self.set_desired_status(UnitStatus::Idle)
    }

    /// Step one unit to `status`, handling every transition as it happens.
    pub fn set_unit_status(&mut self, unit: UnitHandle, status: UnitStatus) -> Result<()> {
        let index = self.index_of(unit)?;
        self.process_status_changes();
        self.drive(index, status)
    }

    /// Step the unit at `index` toward `target`, processing status changes
    /// after every hook.
    fn drive(&mut self, index: usize, target: UnitStatus) -> Result<()> {
        loop {
            let stepped = self.units[index].step_toward(target);
            self.process_status_changes();
            if !stepped? {
                return Ok(());
            }
        }
    }

    /// Emit queued status changes and restart units downstream of any unit
    /// that re-bound its format.
    pub fn process_status_changes(&mut self) {
        loop {
            let next = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(change) = next else {
                break;
            };
            if let Some(unit) = self.unit(change.unit) {
                observability::trace_status_change(
                    unit.id(),
                    change.from.as_str(),
                    change.to.as_str(),
                );
            }
            self.emit(ChainEvent::UnitStatusChanged(change));
            if change.is_reinit() && self.suppress == 0 {
                if let Some(index) = self.unit_index(change.unit) {
                    self.cascade_from(index);
                }
            }
        }
    }

    fn cascade_from(&mut self, index: usize) {
        if index + 1 >= self.units.len() {
            return;
        }
        debug!(chain = %self.name, unit = %self.units[index].id(), "restarting downstream units");
        self.suppress += 1;
        let desired = self.desired;
        for downstream in index + 1..self.units.len() {
            observability::record_unit_restart(self.units[downstream].id());
            self.restart(downstream, Some(desired));
        }
        self.suppress -= 1;
    }

    /// Shut down and re-raise units whose hooks failed during dispatch.
    fn run_recovery(&mut self) {
        for handle in std::mem::take(&mut self.recover) {
            let Some(index) = self.unit_index(handle) else {
                continue;
            };
            warn!(chain = %self.name, unit = %self.units[index].id(), "reinitialising unit after a runtime error");
            observability::record_unit_restart(self.units[index].id());
            let desired = self.desired;
            self.restart(index, Some(desired));
        }
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Pull frames from the unit at `index` and push them depth-first
    /// through the rest of the chain. Returns whether it produced.
    fn dispatch(&mut self, index: usize) -> bool {
        let mut out = FrameOutput::new();
        let produced = match self.units[index].produce_now(&mut out) {
            Ok(produced) => produced,
            Err(e) => {
                warn!(chain = %self.name, unit = %self.units[index].id(), error = %e, "unit failed to produce");
                self.recover.push(self.units[index].handle());
                return false;
            }
        };
        for frame in out.drain() {
            self.deliver(index, &frame);
        }
        produced
    }

    fn deliver(&mut self, index: usize, frame: &FrameBuffer) {
        let span = self
            .config
            .tracing
            .dispatch_span(self.units[index].id(), frame.sequence);
        let _guard = span.enter();

        self.units[index].emit_frame(frame);
        observability::trace_frame(self.units[index].id(), frame.bytes_used(), frame.sequence);

        let next = index + 1;
        if next >= self.units.len() {
            return;
        }
        let Some(format) = self.units[index].output_format().cloned() else {
            return;
        };

        let mut out = FrameOutput::new();
        if let Err(e) = self.units[next].accept_input_frame(frame, &format, &mut out) {
            warn!(chain = %self.name, unit = %self.units[next].id(), error = %e, "unit failed to process a frame");
            self.recover.push(self.units[next].handle());
            return;
        }
        for produced in out.drain() {
            self.deliver(next, &produced);
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Observe chain events synchronously.
    pub fn subscribe(&mut self, cb: Box<ChainListener>) -> ListenerId {
        self.listeners.subscribe(cb)
    }

    /// Remove a chain listener.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Receiver mirroring structural and status events.
    pub fn events(&self) -> ChainEventReceiver {
        self.events.subscribe()
    }

    fn emit(&mut self, event: ChainEvent) {
        for cb in self.listeners.iter_mut() {
            cb(&event);
        }
        self.events.send(event);
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        for unit in self.units.iter_mut().rev() {
            if unit.is_streaming() {
                warn!(chain = %self.name, unit = %unit.id(), "destroying a chain with a streaming unit");
            }
            if let Err(e) = unit.set_status(UnitStatus::Idle) {
                warn!(chain = %self.name, unit = %unit.id(), error = %e, "unit shutdown failed");
            }
        }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("units", &self.units.iter().map(Unit::id).collect::<Vec<_>>())
            .field("desired", &self.desired)
            .field("manager", &self.manager.is_some())
            .finish()
    }
}
