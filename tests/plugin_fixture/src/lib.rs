//! `filter.invert`: flips every byte of the frames it receives.
//!
//! Built as a shared library and loaded by the plugin scan tests.

use camchain::prelude::*;

struct Invert;

impl UnitKind for Invert {
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
        let used = frame.bytes_used();
        let mut inverted = FrameBuffer::with_capacity(used);
        for (dst, src) in inverted.as_mut_slice().iter_mut().zip(&frame.as_bytes()[..used]) {
            *dst = !src;
        }
        inverted.set_bytes_used(used);
        inverted.set_timestamp(frame.timestamp);
        inverted.set_sequence(frame.sequence);
        out.push(inverted.freeze());
        Ok(())
    }
}

fn invert() -> Box<dyn UnitKind> {
    Box::new(Invert)
}

camchain::define_plugin! {
    name: "invert",
    kinds: ["filter.invert"],
    driver: || UnitDriver::stock("filter", "invert", "Invert", UnitFlags::NONE, invert),
}
