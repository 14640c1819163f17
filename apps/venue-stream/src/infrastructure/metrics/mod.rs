//! Prometheus Metrics Module
//!
//! Records connection metrics through the `metrics` facade. Nothing is
//! exported unless the host calls [`init_metrics`]; without a recorder the
//! recording functions are no-ops.
//!
//! # Metrics Categories
//!
//! - **Frames**: Counts of frames read and written by type
//! - **Connections**: Dialed links and link losses
//! - **Subscriptions**: Entries per lifecycle state
//! - **Diagnostics**: Unhandled frames, ping failures, request timeouts
//! - **Latency**: Round-trip latency per operation

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;

use crate::application::ports::Reporter;
use crate::domain::frame::FrameType;
use crate::domain::subscription::RegistryStats;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns an error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let _guard = INIT_LOCK.lock();
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    let _ = PROMETHEUS_HANDLE.set(handle.clone());
    Ok(handle)
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "venue_stream_frames_received_total",
        "Total frames read from venue connections"
    );
    describe_counter!(
        "venue_stream_frames_sent_total",
        "Total frames written to venue connections"
    );

    // Connection state
    describe_gauge!(
        "venue_stream_connections",
        "Number of dialed venue connections"
    );
    describe_counter!(
        "venue_stream_connection_lost_total",
        "Total venue connections lost"
    );

    // Subscription gauges
    describe_gauge!(
        "venue_stream_subscriptions",
        "Subscription entries by lifecycle state"
    );

    // Diagnostics
    describe_counter!(
        "venue_stream_unhandled_messages_total",
        "Total frames that matched no route"
    );
    describe_counter!(
        "venue_stream_ping_failures_total",
        "Total keep-alive pings that could not be sent"
    );
    describe_counter!(
        "venue_stream_correlation_timeouts_total",
        "Total correlated requests that timed out"
    );

    // Latency histograms
    describe_histogram!(
        "venue_stream_latency_seconds",
        "Round-trip latency by operation"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame read from a venue.
pub fn record_frame_received(frame_type: FrameType) {
    counter!(
        "venue_stream_frames_received_total",
        "frame_type" => frame_type.as_str()
    )
    .increment(1);
}

/// Record a frame written to a venue.
pub fn record_frame_sent(frame_type: FrameType) {
    counter!(
        "venue_stream_frames_sent_total",
        "frame_type" => frame_type.as_str()
    )
    .increment(1);
}

/// Record a connection being dialed.
pub fn record_connected() {
    gauge!("venue_stream_connections").increment(1.0);
}

/// Record a dialed connection going away (shutdown or loss).
pub fn record_disconnected() {
    gauge!("venue_stream_connections").decrement(1.0);
}

/// Record a connection loss.
pub fn record_connection_lost() {
    counter!("venue_stream_connection_lost_total").increment(1);
}

/// Update the subscription gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(stats: RegistryStats) {
    gauge!("venue_stream_subscriptions", "state" => "subscribing").set(stats.subscribing as f64);
    gauge!("venue_stream_subscriptions", "state" => "subscribed").set(stats.subscribed as f64);
    gauge!("venue_stream_subscriptions", "state" => "unsubscribing")
        .set(stats.unsubscribing as f64);
}

/// Record a frame that matched no route.
pub fn record_unhandled_message() {
    counter!("venue_stream_unhandled_messages_total").increment(1);
}

/// Record a ping send failure.
pub fn record_ping_failure() {
    counter!("venue_stream_ping_failures_total").increment(1);
}

/// Record a correlated request timing out.
pub fn record_correlation_timeout() {
    counter!("venue_stream_correlation_timeouts_total").increment(1);
}

/// Record round-trip latency for an operation.
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "venue_stream_latency_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Reporter
// =============================================================================

/// [`Reporter`] that records latency into the `venue_stream_latency_seconds`
/// histogram.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsReporter;

impl MetricsReporter {
    /// Create a new metrics reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Reporter for MetricsReporter {
    fn latency(&self, name: &str, _message: &[u8], duration: Duration) {
        record_latency(name, duration);
    }
}

// =============================================================================
// Tests
// =============================================================================
