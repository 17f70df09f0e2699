//! Passthrough filter - forwards frames unchanged.

use crate::buffer::FrameBuffer;
use crate::error::Result;
use crate::format::{Format, FormatCatalog};
use crate::unit::{FrameOutput, UnitKind};

/// A filter whose only output format is its input's format.
///
/// Useful for testing chain wiring and as a placeholder while building a
/// chain. Frames are forwarded without copying the payload.
#[derive(Debug, Default)]
pub struct Passthrough {
    forwarded: u64,
}

impl Passthrough {
    /// Create a passthrough filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames forwarded so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl UnitKind for Passthrough {
    fn derive_outputs(&mut self, catalog: &mut FormatCatalog, input: Option<&Format>) {
        catalog.clear();
        if let Some(format) = input {
            catalog.insert(format.clone());
        }
    }

    fn on_input_frame(
        &mut self,
        frame: &FrameBuffer,
        _format: &Format,
        out: &mut FrameOutput,
    ) -> Result<()> {
        self.forwarded += 1;
        out.push(frame.clone());
        Ok(())
    }
}
