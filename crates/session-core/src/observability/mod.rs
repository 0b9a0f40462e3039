//! Observability for the session core.
//!
//! Metric labels are bounded:
//! - `to`: link states
//! - `from`/`to` on quality changes: the three tiers
//! - `outcome`, `resolution`, `kind`: fixed sets named in each function
//!
//! Participant and session identifiers never appear as labels; they go in
//! tracing fields.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `vs_links_created_total` | Counter | none |
//! | `vs_link_transitions_total` | Counter | `to` |
//! | `vs_links_lost_total` | Counter | none |
//! | `vs_glare_total` | Counter | `resolution` |
//! | `vs_links_connected` | Gauge | none |
//! | `vs_quality_changes_total` | Counter | `from`, `to` |
//! | `vs_segment_uploads_total` | Counter | `outcome` |
//! | `vs_segment_upload_duration_seconds` | Histogram | `outcome` |
//! | `vs_segment_upload_retries_total` | Counter | none |
//! | `vs_signaling_reconnects_total` | Counter | `outcome` |
//! | `vs_signals_relayed_total` | Counter | `kind` |

pub mod metrics;

pub use metrics::init_metrics_recorder;
