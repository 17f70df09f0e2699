//! Metrics collection using metrics-rs.

use metrics::{Counter, Unit, counter};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const FRAMES_PRODUCED: &str = "camchain_frames_produced";
const BYTES_PRODUCED: &str = "camchain_bytes_produced";
const FRAMES_DROPPED: &str = "camchain_frames_dropped";
const DISPATCHES: &str = "camchain_dispatches";
const UNIT_RESTARTS: &str = "camchain_unit_restarts";
const PLUGINS_LOADED: &str = "camchain_plugins_loaded";
const PLUGINS_FAILED: &str = "camchain_plugins_failed";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(FRAMES_PRODUCED, Unit::Count, "Frames emitted by units");
    metrics::describe_counter!(BYTES_PRODUCED, Unit::Bytes, "Payload bytes emitted by units");
    metrics::describe_counter!(
        FRAMES_DROPPED,
        Unit::Count,
        "Frames discarded by units that could not keep up"
    );
    metrics::describe_counter!(DISPATCHES, Unit::Count, "Frames dispatched by chain schedulers");
    metrics::describe_counter!(
        UNIT_RESTARTS,
        Unit::Count,
        "Units re-initialised after a failure or an input change"
    );
    metrics::describe_counter!(PLUGINS_LOADED, Unit::Count, "Plugin modules loaded");
    metrics::describe_counter!(PLUGINS_FAILED, Unit::Count, "Plugin modules that failed to load");
}

/// Record a frame emitted by a unit.
#[inline]
pub fn record_frame_produced(unit: &str, bytes: usize) {
    counter!(FRAMES_PRODUCED, "unit" => unit.to_string()).increment(1);
    counter!(BYTES_PRODUCED, "unit" => unit.to_string()).increment(bytes as u64);
}

/// Record a frame a unit had to discard.
#[inline]
pub fn record_frame_dropped(unit: &str) {
    counter!(FRAMES_DROPPED, "unit" => unit.to_string()).increment(1);
}

/// Record one scheduler dispatch.
#[inline]
pub fn record_dispatch(chain: &str) {
    counter!(DISPATCHES, "chain" => chain.to_string()).increment(1);
}

/// Record a unit being brought back up.
#[inline]
pub fn record_unit_restart(unit: &str) {
    counter!(UNIT_RESTARTS, "unit" => unit.to_string()).increment(1);
}

/// Record the outcome of one plugin load attempt.
#[inline]
pub fn record_plugin_load(ok: bool) {
    if ok {
        counter!(PLUGINS_LOADED).increment(1);
    } else {
        counter!(PLUGINS_FAILED).increment(1);
    }
}

/// Pre-labelled counters for one unit.
#[derive(Clone)]
pub struct UnitMetrics {
    unit: String,
    frames: Counter,
    bytes: Counter,
    dropped: Counter,
}

impl UnitMetrics {
    /// Create counters labelled with `unit`.
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            frames: counter!(FRAMES_PRODUCED, "unit" => unit.to_string()),
            bytes: counter!(BYTES_PRODUCED, "unit" => unit.to_string()),
            dropped: counter!(FRAMES_DROPPED, "unit" => unit.to_string()),
        }
    }

    /// Record an emitted frame.
    #[inline]
    pub fn record_out(&self, bytes: usize) {
        self.frames.increment(1);
        self.bytes.increment(bytes as u64);
    }

    /// Record a dropped frame.
    #[inline]
    pub fn record_drop(&self) {
        self.dropped.increment(1);
    }

    /// Unit label.
    pub fn unit(&self) -> &str {
        &self.unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_unit_metrics() {
        let metrics = UnitMetrics::new("output.writer");
        metrics.record_out(64);
        metrics.record_drop();
        assert_eq!(metrics.unit(), "output.writer");
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed: all of these are no-ops.
        record_frame_produced("input.test_pattern", 100);
        record_frame_dropped("output.writer");
        record_dispatch("chain");
        record_unit_restart("filter.passthrough");
        record_plugin_load(true);
        record_plugin_load(false);
    }
}
