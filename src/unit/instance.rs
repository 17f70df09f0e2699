//! The unit lifecycle state machine.

use super::control::{Control, ControlValue};
use super::kind::{AsAny, FrameOutput, UnitKind};
use super::status::{StatusChange, UnitFlags, UnitHandle, UnitStatus};
use crate::buffer::FrameBuffer;
use crate::clock;
use crate::error::{Error, Result};
use crate::format::{Format, FormatCatalog, FormatHint, PixelFormat};
use crate::listeners::{ListenerId, Listeners};
use crate::observability;
use crate::plugin::PluginModule;
use rustix::event::{PollFd, PollFlags, poll};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Status-change callback.
pub type StatusListener = dyn FnMut(&StatusChange) + Send;
/// Frame-ready callback. The buffer is only valid for the duration of the call.
pub type FrameListener = dyn FnMut(&FrameBuffer, &Format) + Send;
/// Input-changed callback.
pub type InputListener = dyn FnMut(Option<UnitHandle>) + Send;
/// Output-formats-changed callback.
pub type FormatsListener = dyn FnMut(&FormatCatalog) + Send;
/// Control-value-changed callback.
pub type ControlListener = dyn FnMut(&Control) + Send;

/// Minimum spacing between repeated malformed-frame warnings.
const WARN_INTERVAL_MICROS: i64 = clock::MICROS_PER_SEC;

/// A pipeline stage: a concrete [`UnitKind`] wrapped in the shared
/// lifecycle state machine.
///
/// ```text
/// Idle --stream_init--> Ready --stream_on--> Streaming
///      <-stream_shutdown-     <-stream_off--
/// ```
///
/// The bound format is `None` while Idle and always a member of the output
/// catalog otherwise.
pub struct Unit {
    handle: UnitHandle,
    id: String,
    name: String,
    flags: UnitFlags,
    status: UnitStatus,
    catalog: FormatCatalog,
    bound: Option<Format>,
    hint: FormatHint,
    input: Option<UnitHandle>,
    input_format: Option<Format>,
    controls: Vec<Control>,
    last_malformed_warn: i64,

    status_listeners: Listeners<StatusListener>,
    frame_listeners: Listeners<FrameListener>,
    input_listeners: Listeners<InputListener>,
    formats_listeners: Listeners<FormatsListener>,
    control_listeners: Listeners<ControlListener>,

    kind: Box<dyn UnitKind>,
    // Dropped after `kind`: the kind's code may live in this module.
    module: Option<Arc<PluginModule>>,
}

impl Unit {
    /// Wrap a kind. Its initial catalog is derived with no input.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        flags: UnitFlags,
        mut kind: Box<dyn UnitKind>,
    ) -> Self {
        let mut catalog = FormatCatalog::new();
        kind.derive_outputs(&mut catalog, None);
        let controls = kind.controls();
        Self {
            handle: UnitHandle::next(),
            id: id.into(),
            name: name.into(),
            flags,
            status: UnitStatus::Idle,
            catalog,
            bound: None,
            hint: FormatHint::default(),
            input: None,
            input_format: None,
            controls,
            last_malformed_warn: i64::MIN,
            status_listeners: Listeners::new(),
            frame_listeners: Listeners::new(),
            input_listeners: Listeners::new(),
            formats_listeners: Listeners::new(),
            control_listeners: Listeners::new(),
            kind,
            module: None,
        }
    }

    pub(crate) fn set_module(&mut self, module: Option<Arc<PluginModule>>) {
        self.module = module;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Stable handle of this instance.
    pub fn handle(&self) -> UnitHandle {
        self.handle
    }

    /// Canonical id of the description this unit was created from.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability flags.
    pub fn flags(&self) -> UnitFlags {
        self.flags
    }

    /// Current lifecycle status.
    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Returns true while Streaming.
    pub fn is_streaming(&self) -> bool {
        self.status == UnitStatus::Streaming
    }

    /// Advertised output formats.
    pub fn output_formats(&self) -> &FormatCatalog {
        &self.catalog
    }

    /// Bound output format, present iff Ready or Streaming.
    pub fn output_format(&self) -> Option<&Format> {
        self.bound.as_ref()
    }

    /// Handle of the upstream unit.
    pub fn input(&self) -> Option<UnitHandle> {
        self.input
    }

    /// Format the upstream unit had bound when the input was last set.
    pub fn input_format(&self) -> Option<&Format> {
        self.input_format.as_ref()
    }

    /// Preferred-format hint used by auto-selection.
    pub fn preferred_format(&self) -> &FormatHint {
        &self.hint
    }

    /// The plugin module this unit's code came from, if any.
    pub fn module(&self) -> Option<&Arc<PluginModule>> {
        self.module.as_ref()
    }

    /// Borrow the concrete kind.
    pub fn kind_ref<T: UnitKind + 'static>(&self) -> Option<&T> {
        AsAny::as_any(&*self.kind).downcast_ref::<T>()
    }

    /// Mutably borrow the concrete kind.
    pub fn kind_mut<T: UnitKind + 'static>(&mut self) -> Option<&mut T> {
        AsAny::as_any_mut(&mut *self.kind).downcast_mut::<T>()
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Add an output format. A `None` name becomes `"<w>x<h> <nickname>"`.
    ///
    /// Returns `Ok(false)` if an equal format is already advertised.
    pub fn add_output_format(
        &mut self,
        pixel_format: PixelFormat,
        name: Option<&str>,
        width: u32,
        height: u32,
        row_stride: u32,
    ) -> Result<bool> {
        let format = Format::new(pixel_format, name, width, height, row_stride).inspect_err(|e| {
            warn!(unit = %self.id, error = %e, "rejecting output format");
        })?;
        let added = self.catalog.insert(format);
        if added {
            self.notify_formats_changed();
        }
        Ok(added)
    }

    /// Remove an output format. The bound format cannot be removed.
    pub fn remove_output_format(&mut self, format: &Format) -> Result<bool> {
        if self.bound.as_ref() == Some(format) {
            warn!(unit = %self.id, format = %format, "cannot remove the bound output format");
            return Err(self.invalid_state("remove its bound format"));
        }
        let removed = self.catalog.remove(format).is_some();
        if removed {
            self.notify_formats_changed();
        }
        Ok(removed)
    }

    /// Remove every output format. Only allowed while Idle.
    pub fn remove_all_output_formats(&mut self) -> Result<()> {
        if self.status != UnitStatus::Idle {
            warn!(unit = %self.id, status = %self.status, "cannot clear output formats");
            return Err(self.invalid_state("clear its output formats"));
        }
        self.catalog.clear();
        self.notify_formats_changed();
        Ok(())
    }

    /// Set the hint used when `stream_init` is called without a format.
    pub fn set_preferred_format(&mut self, hint: FormatHint) {
        debug!(unit = %self.id, ?hint, "preferred format set");
        self.hint = hint;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind a format and acquire resources. Idle to Ready.
    ///
    /// With `None`, the catalog entry scoring highest against the preferred
    /// hint is used. A no-op while already Ready.
    pub fn stream_init(&mut self, format: Option<&Format>) -> Result<()> {
        match self.status {
            UnitStatus::Ready => return Ok(()),
            UnitStatus::Streaming => {
                warn!(unit = %self.id, "stream_init while streaming");
                return Err(self.invalid_state("stream_init"));
            }
            UnitStatus::Idle => {}
        }

        let chosen = match format {
            Some(requested) => self.catalog.find(requested),
            None => self.catalog.auto_select(&self.hint),
        };
        let Some(chosen) = chosen.cloned() else {
            return Err(match format {
                Some(requested) => {
                    warn!(unit = %self.id, format = %requested, "refusing to init with an unrecognized format");
                    Error::FormatNotInCatalog {
                        unit: self.id.clone(),
                        format: requested.name.clone(),
                    }
                }
                None => {
                    warn!(unit = %self.id, "no output formats to choose from");
                    Error::NoFormats(self.id.clone())
                }
            });
        };

        debug!(unit = %self.id, format = %chosen, "stream init");
        self.kind.stream_init(&chosen).inspect_err(|e| {
            warn!(unit = %self.id, error = %e, "stream init failed");
        })?;
        self.bound = Some(chosen);
        self.transition(UnitStatus::Ready);
        Ok(())
    }

    /// Start streaming. Ready to Streaming; a no-op while Streaming.
    pub fn stream_on(&mut self) -> Result<()> {
        match self.status {
            UnitStatus::Streaming => Ok(()),
            UnitStatus::Idle => {
                warn!(unit = %self.id, "stream_on while idle");
                Err(self.invalid_state("stream_on"))
            }
            UnitStatus::Ready => {
                self.kind.stream_on().inspect_err(|e| {
                    warn!(unit = %self.id, error = %e, "stream on failed");
                })?;
                self.transition(UnitStatus::Streaming);
                Ok(())
            }
        }
    }

    /// Stop streaming. Streaming to Ready; a no-op otherwise.
    pub fn stream_off(&mut self) -> Result<()> {
        if self.status != UnitStatus::Streaming {
            return Ok(());
        }
        self.kind.stream_off().inspect_err(|e| {
            warn!(unit = %self.id, error = %e, "stream off failed");
        })?;
        self.transition(UnitStatus::Ready);
        Ok(())
    }

    /// Release resources and unbind the format, stopping first if needed.
    ///
    /// A no-op while Idle.
    pub fn stream_shutdown(&mut self) -> Result<()> {
        if self.status == UnitStatus::Idle {
            return Ok(());
        }
        self.stream_off()?;
        self.kind.stream_shutdown().inspect_err(|e| {
            warn!(unit = %self.id, error = %e, "stream shutdown failed");
        })?;
        self.bound = None;
        self.transition(UnitStatus::Idle);
        Ok(())
    }

    /// Run one hook toward `target`. Returns `false` once it is reached.
    pub fn step_toward(&mut self, target: UnitStatus) -> Result<bool> {
        match self.status.cmp(&target) {
            std::cmp::Ordering::Equal => Ok(false),
            std::cmp::Ordering::Less => {
                match self.status {
                    UnitStatus::Idle => self.stream_init(None)?,
                    _ => self.stream_on()?,
                }
                Ok(true)
            }
            std::cmp::Ordering::Greater => {
                match self.status {
                    UnitStatus::Streaming => self.stream_off()?,
                    _ => self.stream_shutdown()?,
                }
                Ok(true)
            }
        }
    }

    /// Step until `target` is reached or a hook fails.
    pub fn set_status(&mut self, target: UnitStatus) -> Result<()> {
        while self.step_toward(target)? {}
        Ok(())
    }

    fn transition(&mut self, to: UnitStatus) {
        if self.status == to {
            return;
        }
        let change = StatusChange {
            unit: self.handle,
            from: self.status,
            to,
        };
        self.status = to;
        debug!(unit = %self.id, from = %change.from, to = %change.to, "status changed");
        for cb in self.status_listeners.iter_mut() {
            cb(&change);
        }
    }

    // ========================================================================
    // Input wiring
    // ========================================================================

    /// Connect to an upstream unit (or disconnect with `None`).
    ///
    /// Only allowed while Idle. The output catalog is re-derived from the
    /// input's bound format; the lifecycle state does not change.
    pub fn set_input(&mut self, input: Option<&Unit>) -> Result<()> {
        self.connect_input(input.map(|u| u.handle), input.and_then(|u| u.output_format()))
    }

    pub(crate) fn connect_input(
        &mut self,
        input: Option<UnitHandle>,
        input_format: Option<&Format>,
    ) -> Result<()> {
        if self.status != UnitStatus::Idle {
            warn!(unit = %self.id, status = %self.status, "refusing to set input");
            return Err(self.invalid_state("change its input"));
        }
        trace!(unit = %self.id, input = ?input, "set input");
        self.input = input;
        self.input_format = input_format.cloned();
        for cb in self.input_listeners.iter_mut() {
            cb(input);
        }

        let before = self.catalog.clone();
        self.kind.derive_outputs(&mut self.catalog, input_format);
        if self.catalog != before {
            self.notify_formats_changed();
        }
        Ok(())
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Pass an upstream frame to the kind. Dropped unless Streaming.
    pub(crate) fn accept_input_frame(
        &mut self,
        frame: &FrameBuffer,
        format: &Format,
        out: &mut FrameOutput,
    ) -> Result<()> {
        if self.status != UnitStatus::Streaming {
            trace!(unit = %self.id, "dropping input frame, not streaming");
            return Ok(());
        }
        self.kind.on_input_frame(frame, format, out)
    }

    /// Ask the kind for frames without waiting.
    pub(crate) fn produce_now(&mut self, out: &mut FrameOutput) -> Result<bool> {
        if self.status != UnitStatus::Streaming {
            return Ok(false);
        }
        self.kind.try_produce(out)
    }

    /// Deliver a frame emitted by this unit to its frame listeners.
    pub(crate) fn emit_frame(&mut self, frame: &FrameBuffer) {
        let Some(format) = self.bound.as_ref() else {
            return;
        };
        if frame.timestamp == 0 || frame.bytes_used() == 0 {
            let now = clock::now_micros();
            if now.saturating_sub(self.last_malformed_warn) > WARN_INTERVAL_MICROS {
                warn!(
                    unit = %self.id,
                    timestamp = frame.timestamp,
                    bytes_used = frame.bytes_used(),
                    "frame has zero timestamp or no data"
                );
                self.last_malformed_warn = now;
            }
        }
        observability::record_frame_produced(&self.id, frame.bytes_used());
        for cb in self.frame_listeners.iter_mut() {
            cb(frame, format);
        }
    }

    /// Descriptor of a descriptor-driven source.
    pub fn descriptor(&self) -> Option<std::os::fd::BorrowedFd<'_>> {
        if self.flags.contains(UnitFlags::DESCRIPTOR_EVENT) {
            self.kind.descriptor()
        } else {
            None
        }
    }

    /// Next event time (µs) of a timer-driven source.
    pub fn next_event_time(&self) -> Option<i64> {
        if self.flags.contains(UnitFlags::TIMER_EVENT) {
            self.kind.next_event_time()
        } else {
            None
        }
    }

    /// Wait up to `timeout` for this source to become ready, then produce.
    ///
    /// For use outside a chain. Descriptor-driven units poll their
    /// descriptor; timer-driven units sleep until their next event or the
    /// timeout, whichever is first. Produced frames go to the frame
    /// listeners. Returns whether a frame was produced.
    pub fn try_produce(&mut self, timeout: Duration) -> Result<bool> {
        if self.status != UnitStatus::Streaming {
            debug!(unit = %self.id, status = %self.status, "try_produce on a unit that is not streaming");
            return Ok(false);
        }

        // a zero timeout checks readiness without waiting
        let ready = if self.flags.contains(UnitFlags::DESCRIPTOR_EVENT) {
            self.wait_descriptor(timeout)?
        } else if self.flags.contains(UnitFlags::TIMER_EVENT) {
            match self.kind.next_event_time() {
                None => false,
                Some(deadline) => {
                    let remaining = clock::micros_until(deadline);
                    if remaining > 0 && !timeout.is_zero() {
                        std::thread::sleep(clock::micros_to_duration(remaining).min(timeout));
                    }
                    clock::now_micros() >= deadline
                }
            }
        } else {
            true
        };
        if !ready {
            return Ok(false);
        }

        let mut out = FrameOutput::new();
        let produced = self.kind.try_produce(&mut out)?;
        for frame in out.drain() {
            self.emit_frame(&frame);
        }
        Ok(produced)
    }

    fn wait_descriptor(&self, timeout: Duration) -> Result<bool> {
        let Some(fd) = self.kind.descriptor() else {
            warn!(unit = %self.id, "descriptor-driven unit has no descriptor");
            return Ok(false);
        };
        let timespec = clock::to_timespec(timeout);
        let mut fds = [PollFd::from_borrowed_fd(fd, PollFlags::IN)];
        loop {
            match poll(&mut fds, Some(&timespec)) {
                Ok(_) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(fds[0]
            .revents()
            .intersects(PollFlags::IN | PollFlags::HUP | PollFlags::ERR))
    }

    // ========================================================================
    // Controls
    // ========================================================================

    /// Controls in declaration order.
    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    /// Find a control by id.
    pub fn control(&self, id: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.id() == id)
    }

    /// Propose a control value; the kind's validator decides what is committed.
    ///
    /// Returns the committed value.
    pub fn set_control(&mut self, id: &str, proposed: ControlValue) -> Result<ControlValue> {
        let Some(index) = self.controls.iter().position(|c| c.id() == id) else {
            warn!(unit = %self.id, control = id, "no such control");
            return Err(Error::UnknownControl {
                unit: self.id.clone(),
                control: id.to_string(),
            });
        };
        let control = &self.controls[index];
        if !control.is_enabled() {
            debug!(unit = %self.id, control = id, "control is disabled");
            return Err(Error::ControlRejected(id.to_string()));
        }
        control.check(&proposed)?;

        let actual = self
            .kind
            .try_set_control(control, &proposed)
            .ok_or_else(|| Error::ControlRejected(id.to_string()))?;
        control.check(&actual)?;

        let control = &mut self.controls[index];
        control.commit(actual.clone());
        debug!(unit = %self.id, control = id, value = %actual, "control changed");
        for cb in self.control_listeners.iter_mut() {
            cb(control);
        }
        Ok(actual)
    }

    /// Enable or disable a control.
    pub fn set_control_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let unit = self.id.clone();
        let control = self
            .controls
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::UnknownControl {
                unit,
                control: id.to_string(),
            })?;
        control.set_enabled(enabled);
        Ok(())
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Observe lifecycle transitions.
    pub fn subscribe_status(&mut self, cb: Box<StatusListener>) -> ListenerId {
        self.status_listeners.subscribe(cb)
    }

    /// Observe frames produced by this unit.
    pub fn subscribe_frames(&mut self, cb: Box<FrameListener>) -> ListenerId {
        self.frame_listeners.subscribe(cb)
    }

    /// Observe input changes.
    pub fn subscribe_input(&mut self, cb: Box<InputListener>) -> ListenerId {
        self.input_listeners.subscribe(cb)
    }

    /// Observe catalog changes.
    pub fn subscribe_formats(&mut self, cb: Box<FormatsListener>) -> ListenerId {
        self.formats_listeners.subscribe(cb)
    }

    /// Observe committed control values.
    pub fn subscribe_controls(&mut self, cb: Box<ControlListener>) -> ListenerId {
        self.control_listeners.subscribe(cb)
    }

    /// Remove a listener registered with any of the `subscribe_*` methods.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.status_listeners.unsubscribe(id)
            || self.frame_listeners.unsubscribe(id)
            || self.input_listeners.unsubscribe(id)
            || self.formats_listeners.unsubscribe(id)
            || self.control_listeners.unsubscribe(id)
    }

    fn notify_formats_changed(&mut self) {
        for cb in self.formats_listeners.iter_mut() {
            cb(&self.catalog);
        }
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            unit: self.id.clone(),
            operation,
            status: self.status,
        }
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("format", &self.bound.as_ref().map(|f| f.name.as_str()))
            .field("input", &self.input)
            .finish()
    }
}
