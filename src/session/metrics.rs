//! Per-turn metrics
//!
//! # Metrics
//!
//! - `forkchat_turns_total`: Counter of finished turns by outcome
//! - `forkchat_turn_duration_seconds`: Histogram of turn duration
//! - `forkchat_tool_rounds`: Histogram of tool rounds per turn
//! - `forkchat_tokens_total`: Counter of tokens by kind (input/output/cached)
//! - `forkchat_active_turns`: Gauge of turns currently streaming
//!
//! Nothing is exported unless a recorder is installed, see
//! [`init_metrics_exporter`].
//!
//! # Examples
//!
//! ```
//! use forkchat::session::metrics::TurnMetrics;
//!
//! let metrics = TurnMetrics::new();
//! metrics.record("completed", 1, None);
//! ```

use metrics::{counter, decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::conversation::Usage;

/// Metrics for a single streaming turn
///
/// Records exactly once; later calls to [`TurnMetrics::record`] are ignored.
#[derive(Debug)]
pub struct TurnMetrics {
    start: Instant,
    recorded: AtomicBool,
}

impl Default for TurnMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnMetrics {
    /// Starts tracking a turn
    pub fn new() -> Self {
        increment_gauge!("forkchat_active_turns", 1.0);
        Self {
            start: Instant::now(),
            recorded: AtomicBool::new(false),
        }
    }

    /// Records the turn outcome (`completed`, `cancelled` or `failed`)
    pub fn record(&self, outcome: &str, tool_rounds: u32, usage: Option<&Usage>) {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return;
        }

        increment_counter!("forkchat_turns_total", "outcome" => outcome.to_string());
        histogram!(
            "forkchat_turn_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "outcome" => outcome.to_string()
        );
        histogram!("forkchat_tool_rounds", tool_rounds as f64);

        if let Some(usage) = usage {
            counter!("forkchat_tokens_total", usage.input, "kind" => "input");
            counter!("forkchat_tokens_total", usage.output, "kind" => "output");
            counter!("forkchat_tokens_total", usage.cached, "kind" => "cached");
        }

        decrement_gauge!("forkchat_active_turns", 1.0);
    }

    /// Whether the outcome has been recorded
    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }

    /// Time since the turn started
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for TurnMetrics {
    fn drop(&mut self) {
        if !self.recorded.load(Ordering::SeqCst) {
            decrement_gauge!("forkchat_active_turns", 1.0);
        }
    }
}

/// Installs the Prometheus exporter when the `prometheus` feature is on
///
/// A no-op otherwise.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Err(e) = PrometheusBuilder::new().install() {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        }
    }
}
