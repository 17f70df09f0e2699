//! Built-in unit kinds.
//!
//! ## Sources
//! - [`TestPattern`] (`input.test_pattern`): timer-driven synthetic frames
//! - [`AppSource`] (`input.app`): frames pushed from application threads
//!
//! ## Filters
//! - [`Passthrough`] (`filter.passthrough`): forwards frames unchanged
//!
//! ## Sinks
//! - [`Writer`] (`output.writer`): writes frames on a background thread
//!
//! [`core_drivers`] returns one driver per kind; a manager registers them
//! unless configured otherwise.

mod app_source;
mod passthrough;
mod test_pattern;
mod writer;

pub use app_source::{AppSource, AppSourceHandle, DEFAULT_QUEUE_CAPACITY};
pub use passthrough::Passthrough;
pub use test_pattern::{Pattern, TestPattern};
pub use writer::{DEFAULT_WRITER_QUEUE, TargetFactory, Writer};

use crate::driver::UnitDriver;
use crate::unit::{UnitFlags, UnitKind};

/// Drivers for the built-in kinds.
pub fn core_drivers() -> Vec<UnitDriver> {
    vec![
        UnitDriver::stock(
            "input",
            "test_pattern",
            "Test pattern",
            UnitFlags::TIMER_EVENT,
            || Box::new(TestPattern::new()) as Box<dyn UnitKind>,
        ),
        UnitDriver::new("input", "app", Box::new(app_source::AppSourceBackend)),
        UnitDriver::stock(
            "filter",
            "passthrough",
            "Passthrough",
            UnitFlags::NONE,
            || Box::new(Passthrough::new()) as Box<dyn UnitKind>,
        ),
        UnitDriver::stock(
            "output",
            "writer",
            "Writer",
            UnitFlags::NONE,
            || Box::new(Writer::new()) as Box<dyn UnitKind>,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitStatus;

    #[test]
    fn test_core_driver_ids() {
        let mut ids = Vec::new();
        for mut driver in core_drivers() {
            driver.start().unwrap();
            ids.extend(driver.descriptions().iter().map(|d| d.id().to_string()));
        }
        assert_eq!(
            ids,
            vec![
                "input.test_pattern",
                "input.app",
                "filter.passthrough",
                "output.writer"
            ]
        );
    }

    #[test]
    fn test_core_units_carry_flags() {
        for mut driver in core_drivers() {
            driver.start().unwrap();
            let description = driver.descriptions()[0].clone();
            let unit = driver.create_unit(&description).unwrap();
            assert_eq!(unit.flags(), description.flags());
            assert_eq!(unit.status(), UnitStatus::Idle);
        }
    }
}
