//! Behaviour of a concrete unit kind.

use super::control::{Control, ControlValue};
use crate::buffer::FrameBuffer;
use crate::error::{Error, Result};
use crate::format::{Format, FormatCatalog};
use smallvec::SmallVec;
use std::any::Any;
use std::os::fd::BorrowedFd;

/// Frames emitted by one hook invocation.
///
/// Frames are dispatched to listeners after the hook returns, in push order,
/// each tagged with the unit's bound format.
#[derive(Debug, Default)]
pub struct FrameOutput {
    frames: SmallVec<[FrameBuffer; 2]>,
}

impl FrameOutput {
    /// Create an empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a frame.
    pub fn push(&mut self, frame: FrameBuffer) {
        self.frames.push(frame);
    }

    /// Number of frames emitted so far.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn drain(&mut self) -> smallvec::Drain<'_, [FrameBuffer; 2]> {
        self.frames.drain(..)
    }
}

/// Upcast helper so callers can downcast a boxed kind to its concrete type.
pub trait AsAny {
    /// Borrow as `Any`.
    fn as_any(&self) -> &dyn Any;
    /// Mutably borrow as `Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Hooks a pipeline stage overrides.
///
/// Every hook has a default: lifecycle hooks succeed without doing
/// anything, the catalog is left untouched, input frames are consumed and
/// control proposals are accepted as-is. Source stages must override
/// [`try_produce`](UnitKind::try_produce) together with either
/// [`descriptor`](UnitKind::descriptor) or
/// [`next_event_time`](UnitKind::next_event_time), matching the flags of the
/// description that creates them.
pub trait UnitKind: AsAny + Send {
    /// Acquire resources for `format`.
    fn stream_init(&mut self, format: &Format) -> Result<()> {
        let _ = format;
        Ok(())
    }

    /// Start producing.
    fn stream_on(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop producing.
    fn stream_off(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release resources acquired in `stream_init`.
    fn stream_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Recompute the output catalog from the input's current format.
    ///
    /// Called once when the unit is constructed (with no input) and again on
    /// every input change while the unit is Idle.
    fn derive_outputs(&mut self, catalog: &mut FormatCatalog, input: Option<&Format>) {
        let _ = (catalog, input);
    }

    /// Handle a frame from the upstream unit. Only called while Streaming.
    fn on_input_frame(
        &mut self,
        frame: &FrameBuffer,
        format: &Format,
        out: &mut FrameOutput,
    ) -> Result<()> {
        let _ = (frame, format, out);
        Ok(())
    }

    /// Produce frames now. Readiness has already been established.
    ///
    /// Returns whether anything was produced.
    fn try_produce(&mut self, out: &mut FrameOutput) -> Result<bool> {
        let _ = out;
        Err(Error::hook("unit kind does not produce frames on its own"))
    }

    /// Pollable descriptor for descriptor-driven sources.
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Absolute time (µs, monotonic) of the next frame for timer-driven
    /// sources. `None` means nothing is scheduled.
    fn next_event_time(&self) -> Option<i64> {
        None
    }

    /// Controls exposed by this kind, read once at construction.
    fn controls(&self) -> Vec<Control> {
        Vec::new()
    }

    /// Validate a proposed control value.
    ///
    /// Returns the value to commit (possibly coerced), or `None` to reject.
    fn try_set_control(&mut self, control: &Control, proposed: &ControlValue) -> Option<ControlValue> {
        let _ = control;
        Some(proposed.clone())
    }
}
