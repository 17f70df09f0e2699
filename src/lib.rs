//! # camchain
//!
//! A linear video-processing pipeline built from pluggable units.
//!
//! A [`Chain`](chain::Chain) is an ordered list of [`Unit`](unit::Unit)s:
//! capture sources, filters and sinks. Each unit's input is its predecessor,
//! and each unit moves through the Idle, Ready and Streaming states
//! independently. When a unit is re-initialised with a new format, every
//! unit downstream of it is restarted automatically.
//!
//! Units are created by drivers registered with a
//! [`UnitManager`](manager::UnitManager), which also loads driver plugins
//! from shared libraries.
//!
//! ## Features
//!
//! - **Format negotiation**: every unit advertises a catalog of output
//!   formats derived from its input and picks one from a preference hint
//! - **Cascade restarts**: downstream units follow upstream format changes
//! - **Single-threaded scheduling**: timer- and descriptor-driven sources are
//!   multiplexed with `poll`
//! - **Plugins**: drivers loaded at runtime through a versioned C ABI
//! - **Snapshots**: chains saved and restored as XML
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use camchain::prelude::*;
//!
//! let manager = UnitManager::new(ManagerConfig::builtin()).into_handle();
//! let mut chain = Chain::new().manager(manager);
//! chain.add_unit_by_id("input.test_pattern")?;
//! chain.add_unit_by_id("filter.passthrough")?;
//! chain.set_desired_status(UnitStatus::Streaming)?;
//!
//! loop {
//!     chain.iterate(None)?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod chain;
pub mod clock;
pub mod driver;
pub mod error;
pub mod fd;
pub mod format;
pub mod listeners;
pub mod manager;
pub mod observability;
pub mod plugin;
pub mod unit;
pub mod units;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::FrameBuffer;
    pub use crate::chain::{Chain, ChainConfig, ChainEvent};
    pub use crate::driver::{Description, UnitDriver};
    pub use crate::error::{Error, Result};
    pub use crate::format::{Format, FormatCatalog, FormatHint, PixelFormat};
    pub use crate::manager::{ManagerConfig, ManagerHandle, UnitManager};
    pub use crate::unit::{
        Control, ControlValue, FrameOutput, Unit, UnitFlags, UnitKind, UnitStatus,
    };
}

pub use error::{Error, Result};
