//! Metric definitions for the session core.
//!
//! All metrics use the `vs_` prefix. Recording goes through the `metrics`
//! facade; without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return its handle.
///
/// Must be called before any metrics are recorded. Upload durations get
/// buckets sized for multi-second HTTP requests.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("vs_segment_upload".to_string()),
            &[
                0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000,
            ],
        )
        .map_err(|e| format!("Failed to set segment upload buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Peer Link Metrics
// ============================================================================

/// Record a peer link being opened.
///
/// Metric: `vs_links_created_total`
/// Labels: none
pub fn record_link_created() {
    counter!("vs_links_created_total").increment(1);
}

/// Record a link state transition driven by the transport.
///
/// Metric: `vs_link_transitions_total`
/// Labels: `to`
///
/// Cardinality: 6 (bounded by `LinkState`)
pub fn record_link_transition(to: &str) {
    counter!("vs_link_transitions_total", "to" => to.to_string()).increment(1);
}

/// Record a link closed because it did not connect or recover in time.
///
/// Metric: `vs_links_lost_total`
/// Labels: none
pub fn record_link_lost() {
    counter!("vs_links_lost_total").increment(1);
}

/// Record an offer collision.
///
/// Metric: `vs_glare_total`
/// Labels: `resolution` (kept_local, rolled_back)
pub fn record_glare(resolution: &str) {
    counter!("vs_glare_total", "resolution" => resolution.to_string()).increment(1);
}

/// Set the number of links currently connected.
///
/// Metric: `vs_links_connected`
/// Labels: none
pub fn set_links_connected(count: usize) {
    // usize to f64 conversion is safe for realistic link counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("vs_links_connected").set(count as f64);
}

// ============================================================================
// Quality Metrics
// ============================================================================

/// Record a change of the active quality profile.
///
/// Metric: `vs_quality_changes_total`
/// Labels: `from`, `to`
///
/// Cardinality: 6 (ordered pairs of distinct tiers)
pub fn record_quality_change(from: &str, to: &str) {
    counter!(
        "vs_quality_changes_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

// ============================================================================
// Recording Metrics
// ============================================================================

/// Record the final outcome of one segment upload, including retries.
///
/// Metric: `vs_segment_uploads_total`, `vs_segment_upload_duration_seconds`
/// Labels: `outcome` (success, failed)
pub fn record_segment_upload(outcome: &str, duration: Duration) {
    counter!("vs_segment_uploads_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("vs_segment_upload_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retried segment upload attempt.
///
/// Metric: `vs_segment_upload_retries_total`
/// Labels: none
pub fn record_upload_retry() {
    counter!("vs_segment_upload_retries_total").increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a signaling reconnect attempt.
///
/// Metric: `vs_signaling_reconnects_total`
/// Labels: `outcome` (success, error, exhausted)
pub fn record_signaling_reconnect(outcome: &str) {
    counter!("vs_signaling_reconnects_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a negotiation payload relayed to a peer.
///
/// Metric: `vs_signals_relayed_total`
/// Labels: `kind` (offer, answer, candidate)
pub fn record_signal_relayed(kind: &str) {
    counter!("vs_signals_relayed_total", "kind" => kind.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only exercise the recording functions against the no-op recorder.

    #[test]
    fn test_link_metrics() {
        record_link_created();
        record_link_transition("connected");
        record_link_transition("reconnecting");
        record_link_lost();
        record_glare("kept_local");
        record_glare("rolled_back");
        set_links_connected(0);
        set_links_connected(3);
    }

    #[test]
    fn test_quality_metrics() {
        record_quality_change("high", "low");
        record_quality_change("low", "medium");
    }

    #[test]
    fn test_recording_metrics() {
        record_segment_upload("success", Duration::from_millis(320));
        record_segment_upload("failed", Duration::from_secs(12));
        record_upload_retry();
    }

    #[test]
    fn test_signaling_metrics() {
        record_signaling_reconnect("success");
        record_signaling_reconnect("exhausted");
        record_signal_relayed("offer");
        record_signal_relayed("candidate");
    }
}
