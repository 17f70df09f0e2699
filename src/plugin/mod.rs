//! Plugin system for loading unit drivers at runtime.
//!
//! A plugin is a shared library (.so on Linux) that contributes one
//! [`UnitDriver`](crate::driver::UnitDriver). The ABI is two C entry points,
//! described in [`abi`], and is normally generated with
//! [`define_plugin!`](crate::define_plugin).
//!
//! # Example Plugin (Rust)
//!
//! ```ignore
//! use camchain::prelude::*;
//!
//! struct Invert;
//!
//! impl UnitKind for Invert {
//!     fn derive_outputs(&mut self, catalog: &mut FormatCatalog, input: Option<&Format>) {
//!         catalog.clear();
//!         if let Some(format) = input {
//!             let _ = catalog.insert(format.clone());
//!         }
//!     }
//!
//!     fn on_input_frame(&mut self, frame: &FrameBuffer, _: &Format, out: &mut FrameOutput) -> Result<()> {
//!         let mut inverted = FrameBuffer::with_capacity(frame.bytes_used());
//!         for (dst, src) in inverted.as_mut_slice().iter_mut().zip(frame.as_bytes()) {
//!             *dst = !src;
//!         }
//!         inverted.set_bytes_used(frame.bytes_used());
//!         out.push(inverted.freeze());
//!         Ok(())
//!     }
//! }
//!
//! camchain::define_plugin! {
//!     name: "invert",
//!     kinds: ["filter.invert"],
//!     driver: || UnitDriver::stock("filter", "invert", "Invert", UnitFlags::NONE, || Box::new(Invert)),
//! }
//! ```

pub mod abi;
mod loader;

pub use abi::{CAMCHAIN_ABI_VERSION, PluginScope, driver_from_raw, driver_to_raw};
pub use loader::{DEFAULT_PLUGIN_DIR, PLUGIN_PATH_ENV, PluginError, PluginLoader, PluginModule};
