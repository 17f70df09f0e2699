//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span around each scheduler iteration.
    pub chain_spans: bool,
    /// Whether to create spans for unit lifecycle operations.
    pub unit_spans: bool,
    /// Whether to create a span for every dispatched frame.
    pub frame_spans: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            chain_spans: true,
            unit_spans: true,
            frame_spans: false,
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// All spans enabled.
    pub fn all() -> Self {
        Self {
            chain_spans: true,
            unit_spans: true,
            frame_spans: true,
            level: Level::DEBUG,
        }
    }

    /// Chain spans only.
    pub fn minimal() -> Self {
        Self {
            chain_spans: true,
            unit_spans: false,
            frame_spans: false,
            level: Level::INFO,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            chain_spans: false,
            unit_spans: false,
            frame_spans: false,
            level: Level::INFO,
        }
    }

    pub(crate) fn chain_span(&self, chain: &str) -> Span {
        if self.chain_spans {
            span_chain(chain)
        } else {
            Span::none()
        }
    }

    pub(crate) fn unit_span(&self, unit: &str, operation: &'static str) -> Span {
        if self.unit_spans {
            span_unit(unit, operation)
        } else {
            Span::none()
        }
    }

    pub(crate) fn dispatch_span(&self, unit: &str, sequence: u64) -> Span {
        if self.frame_spans {
            span_dispatch(unit, sequence)
        } else {
            Span::none()
        }
    }
}

/// Create a span for a chain scheduler iteration.
///
/// # Example
///
/// ```rust,ignore
/// use camchain::observability::span_chain;
///
/// let span = span_chain("preview");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_chain(name: &str) -> Span {
    span!(Level::INFO, "chain", name = %name)
}

/// Create a span for a unit lifecycle operation.
#[inline]
pub fn span_unit(unit: &str, operation: &'static str) -> Span {
    span!(Level::DEBUG, "unit", unit = %unit, operation = operation)
}

/// Create a span for one dispatched frame.
#[inline]
pub fn span_dispatch(unit: &str, sequence: u64) -> Span {
    span!(Level::TRACE, "dispatch", unit = %unit, sequence = sequence)
}

/// Log a frame leaving a unit.
#[inline]
pub fn trace_frame(unit: &str, size: usize, sequence: u64) {
    tracing::trace!(unit = %unit, size = size, sequence = sequence, "frame dispatched");
}

/// Log a unit status transition.
#[inline]
pub fn trace_status_change(unit: &str, from: &str, to: &str) {
    tracing::debug!(unit = %unit, from = %from, to = %to, "unit status changed");
}
