//! Connection monitor: per-link stats sampling and health classification.

use crate::peer::manager::PeerLinkManager;
use chrono::{DateTime, Utc};
use common::types::ParticipantId;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Cumulative counters as read from the transport engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawTransportStats {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// From the selected candidate pair, if it has reported yet.
    pub round_trip_ms: Option<f64>,
}

/// One derived sample for one link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    pub bandwidth_bps: u64,
    pub packet_loss_percent: f64,
    pub round_trip_ms: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Health label derived from packet loss alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkHealth {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl LinkHealth {
    #[must_use]
    pub fn classify(packet_loss_percent: f64) -> Self {
        if packet_loss_percent < 1.0 {
            LinkHealth::Excellent
        } else if packet_loss_percent < 3.0 {
            LinkHealth::Good
        } else if packet_loss_percent < 5.0 {
            LinkHealth::Fair
        } else {
            LinkHealth::Poor
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LinkHealth::Excellent => "excellent",
            LinkHealth::Good => "good",
            LinkHealth::Fair => "fair",
            LinkHealth::Poor => "poor",
        }
    }
}

impl fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one tick for one link.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub participant_id: ParticipantId,
    pub stats: ConnectionStats,
    pub health: LinkHealth,
}

/// Turns cumulative counters into interval samples.
///
/// Keeps the previous counters of every sampled link; the first sample of a
/// link is computed from the cumulative values.
#[derive(Debug)]
pub struct ConnectionMonitor {
    interval: Duration,
    previous: HashMap<ParticipantId, RawTransportStats>,
}

impl ConnectionMonitor {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            previous: HashMap::new(),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Derives a sample from fresh counters and remembers them.
    pub fn observe(&mut self, participant_id: &ParticipantId, raw: RawTransportStats) -> HealthSample {
        let prev = self
            .previous
            .insert(participant_id.clone(), raw)
            .unwrap_or_default();
        let stats = compute(&prev, &raw, self.interval);
        HealthSample {
            participant_id: participant_id.clone(),
            health: LinkHealth::classify(stats.packet_loss_percent),
            stats,
        }
    }

    /// Drops the remembered counters of a link that went away.
    pub fn forget(&mut self, participant_id: &ParticipantId) {
        self.previous.remove(participant_id);
    }

    /// Samples every connected link once.
    ///
    /// All samples of a tick are returned together. A link whose stats read
    /// fails is logged and left out of this tick.
    pub async fn sample(&mut self, links: &mut PeerLinkManager) -> Vec<HealthSample> {
        let connected = links.connected_participants();
        let mut samples = Vec::with_capacity(connected.len());

        for participant_id in connected {
            match links.read_stats(&participant_id).await {
                Some(Ok(raw)) => {
                    let sample = self.observe(&participant_id, raw);
                    debug!(
                        target: "vs.monitor",
                        participant_id = %participant_id,
                        bandwidth_bps = sample.stats.bandwidth_bps,
                        loss = sample.stats.packet_loss_percent,
                        rtt_ms = sample.stats.round_trip_ms,
                        health = %sample.health,
                        "Link sampled"
                    );
                    links.record_health(&participant_id, &sample);
                    samples.push(sample);
                }
                Some(Err(e)) => {
                    warn!(
                        target: "vs.monitor",
                        participant_id = %participant_id,
                        error = %e,
                        "Stats read failed, skipping link for this tick"
                    );
                }
                None => {}
            }
        }

        samples
    }
}

/// Interval sample between two cumulative readings.
///
/// Counters that went backwards (transport restart) count as a zero delta.
#[must_use]
pub fn compute(
    prev: &RawTransportStats,
    current: &RawTransportStats,
    interval: Duration,
) -> ConnectionStats {
    let bytes = current.bytes_received.saturating_sub(prev.bytes_received);
    let received = current.packets_received.saturating_sub(prev.packets_received);
    let lost = current.packets_lost.saturating_sub(prev.packets_lost);

    let total = lost.saturating_add(received);
    #[allow(clippy::cast_precision_loss)]
    let packet_loss_percent = if total == 0 {
        0.0
    } else {
        lost as f64 / total as f64 * 100.0
    };

    let secs = interval.as_secs_f64();
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let bandwidth_bps = if secs > 0.0 {
        (bytes as f64 * 8.0 / secs) as u64
    } else {
        0
    };

    ConnectionStats {
        bandwidth_bps,
        packet_loss_percent,
        round_trip_ms: current.round_trip_ms.unwrap_or(0.0),
        sampled_at: Utc::now(),
    }
}
