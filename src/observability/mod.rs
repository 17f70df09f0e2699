//! Observability: metrics and tracing.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `camchain_frames_produced` | Counter | Frames emitted, by unit |
//! | `camchain_bytes_produced` | Counter | Payload bytes emitted, by unit |
//! | `camchain_frames_dropped` | Counter | Frames discarded, by unit |
//! | `camchain_dispatches` | Counter | Scheduler dispatches, by chain |
//! | `camchain_unit_restarts` | Counter | Units re-initialised, by unit |
//! | `camchain_plugins_loaded` | Counter | Plugin modules loaded |
//! | `camchain_plugins_failed` | Counter | Plugin modules rejected |
//!
//! Nothing is exported unless the application installs a `metrics` recorder.

mod metrics;
mod tracing_support;

pub use metrics::{
    UnitMetrics, init_metrics, record_dispatch, record_frame_dropped, record_frame_produced,
    record_plugin_load, record_unit_restart,
};
pub use tracing_support::{
    TracingConfig, span_chain, span_dispatch, span_unit, trace_frame, trace_status_change,
};
