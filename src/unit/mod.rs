//! Pipeline stages and their lifecycle.
//!
//! A [`Unit`] pairs the shared lifecycle state machine with a concrete
//! [`UnitKind`] that supplies the stage-specific hooks. Units are created by
//! drivers from descriptions and are normally owned by a chain, which wires
//! each unit's input to its predecessor.

mod control;
mod instance;
mod kind;
mod status;

pub use control::{Control, ControlType, ControlValue, EnumOption};
pub use instance::{
    ControlListener, FormatsListener, FrameListener, InputListener, StatusListener, Unit,
};
pub use kind::{AsAny, FrameOutput, UnitKind};
pub use status::{StatusChange, UnitFlags, UnitHandle, UnitStatus};
