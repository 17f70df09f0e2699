//! Error types for camchain.

use crate::plugin::PluginError;
use crate::unit::UnitStatus;
use thiserror::Error;

/// Result type alias using camchain's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for camchain operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation is not allowed in the unit's current lifecycle state.
    #[error("unit [{unit}] cannot {operation} while {status}")]
    InvalidState {
        /// Unit id.
        unit: String,
        /// Operation that was refused.
        operation: &'static str,
        /// Status the unit was in.
        status: UnitStatus,
    },

    /// Requested format is not a member of the unit's catalog.
    #[error("unit [{unit}] has no output format matching [{format}]")]
    FormatNotInCatalog {
        /// Unit id.
        unit: String,
        /// Display name of the rejected format.
        format: String,
    },

    /// Auto-selection was requested on an empty catalog.
    #[error("unit [{0}] advertises no output formats")]
    NoFormats(String),

    /// Format geometry is not usable.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Chain position outside `0..=len`.
    #[error("position {position} out of range for chain of length {len}")]
    InvalidPosition {
        /// Requested position.
        position: usize,
        /// Chain length at the time of the request.
        len: usize,
    },

    /// Unit is not part of this chain.
    #[error("unit not found in chain")]
    UnitNotFound,

    /// No driver knows a description with this id.
    #[error("no unit description with id [{0}]")]
    DescriptionNotFound(String),

    /// Operation needs a unit manager but the chain has none.
    #[error("chain has no unit manager")]
    NoManager,

    /// Manager has no driver with this id.
    #[error("no driver {0}")]
    DriverNotFound(String),

    /// Description was produced by a different driver.
    #[error("description [{0}] does not belong to this driver")]
    ForeignDescription(String),

    /// A description with the same canonical id is already registered.
    #[error("duplicate unit description [{0}]")]
    DuplicateDescription(String),

    /// A concrete unit kind reported a failure from one of its hooks.
    #[error("{0}")]
    Hook(String),

    /// Unit has no control with this id.
    #[error("unit [{unit}] has no control [{control}]")]
    UnknownControl {
        /// Unit id.
        unit: String,
        /// Control id.
        control: String,
    },

    /// Unit validator rejected a proposed control value.
    #[error("control [{0}] rejected the proposed value")]
    ControlRejected(String),

    /// Value type does not match the control type.
    #[error("control [{control}] expects a {expected} value")]
    ControlType {
        /// Control id.
        control: String,
        /// Expected value type.
        expected: &'static str,
    },

    /// Chain snapshot could not be parsed or applied.
    #[error("snapshot: {0}")]
    Snapshot(String),

    /// Plugin loading failed.
    #[error("plugin: {0}")]
    Plugin(#[from] PluginError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Shorthand for a hook failure with a formatted message.
    pub fn hook(message: impl Into<String>) -> Self {
        Error::Hook(message.into())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Snapshot(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::Snapshot(err.to_string())
    }
}
