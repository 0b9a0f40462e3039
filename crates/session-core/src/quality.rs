//! Quality profiles and the adaptive quality policy.
//!
//! The active profile is one value for the whole session. Every connected
//! link receives the same encoder ceiling whenever it changes.

use crate::monitor::ConnectionStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Named quality tier, totally ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    /// Capture and encoder settings for this tier.
    #[must_use]
    pub fn profile(self) -> &'static QualityProfile {
        match self {
            QualityTier::Low => &QualityProfile::LOW,
            QualityTier::Medium => &QualityProfile::MEDIUM,
            QualityTier::High => &QualityProfile::HIGH,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(QualityTier::Low),
            "medium" => Ok(QualityTier::Medium),
            "high" => Ok(QualityTier::High),
            other => Err(format!("unknown quality tier '{other}'")),
        }
    }
}

/// Frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Concrete capture bounds and encoder ceiling of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub tier: QualityTier,
    pub ideal: Resolution,
    pub max: Resolution,
    pub max_frame_rate: u32,
    pub max_bitrate_bps: u64,
}

impl QualityProfile {
    pub const LOW: QualityProfile = QualityProfile {
        tier: QualityTier::Low,
        ideal: Resolution::new(640, 360),
        max: Resolution::new(640, 480),
        max_frame_rate: 15,
        max_bitrate_bps: 300_000,
    };

    pub const MEDIUM: QualityProfile = QualityProfile {
        tier: QualityTier::Medium,
        ideal: Resolution::new(1280, 720),
        max: Resolution::new(1280, 720),
        max_frame_rate: 24,
        max_bitrate_bps: 1_000_000,
    };

    pub const HIGH: QualityProfile = QualityProfile {
        tier: QualityTier::High,
        ideal: Resolution::new(1920, 1080),
        max: Resolution::new(1920, 1080),
        max_frame_rate: 30,
        max_bitrate_bps: 2_500_000,
    };
}

/// Default loss above which the profile drops to `Low`.
pub const DEFAULT_LOSS_LOW_PERCENT: f64 = 5.0;
/// Default loss above which the profile is capped at `Medium`.
pub const DEFAULT_LOSS_MEDIUM_PERCENT: f64 = 2.0;
/// Default loss below which `High` is allowed.
pub const DEFAULT_LOSS_HIGH_PERCENT: f64 = 1.0;
/// Default incoming bandwidth above which `High` is allowed.
pub const DEFAULT_HIGH_BANDWIDTH_BPS: u64 = 1_000_000;
/// Default round trip above which the profile drops to `Low`.
pub const DEFAULT_RTT_LOW_MS: f64 = 300.0;
/// Default round trip above which the profile is capped at `Medium`.
pub const DEFAULT_RTT_MEDIUM_MS: f64 = 150.0;

/// Thresholds of the adaptive policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub loss_low_percent: f64,
    pub loss_medium_percent: f64,
    pub loss_high_percent: f64,
    pub high_bandwidth_bps: u64,
    pub rtt_low_ms: f64,
    pub rtt_medium_ms: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            loss_low_percent: DEFAULT_LOSS_LOW_PERCENT,
            loss_medium_percent: DEFAULT_LOSS_MEDIUM_PERCENT,
            loss_high_percent: DEFAULT_LOSS_HIGH_PERCENT,
            high_bandwidth_bps: DEFAULT_HIGH_BANDWIDTH_BPS,
            rtt_low_ms: DEFAULT_RTT_LOW_MS,
            rtt_medium_ms: DEFAULT_RTT_MEDIUM_MS,
        }
    }
}

/// Computes the target tier for one stats sample.
///
/// The loss rule and the round-trip cap are evaluated independently and the
/// lower of the two wins.
#[must_use]
pub fn evaluate(stats: &ConnectionStats, thresholds: &QualityThresholds) -> QualityTier {
    let by_loss = if stats.packet_loss_percent > thresholds.loss_low_percent {
        QualityTier::Low
    } else if stats.packet_loss_percent > thresholds.loss_medium_percent {
        QualityTier::Medium
    } else if stats.packet_loss_percent < thresholds.loss_high_percent
        && stats.bandwidth_bps > thresholds.high_bandwidth_bps
    {
        QualityTier::High
    } else {
        QualityTier::Medium
    };

    let rtt_cap = if stats.round_trip_ms > thresholds.rtt_low_ms {
        QualityTier::Low
    } else if stats.round_trip_ms > thresholds.rtt_medium_ms {
        QualityTier::Medium
    } else {
        QualityTier::High
    };

    by_loss.min(rtt_cap)
}

/// A change of the active profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityChange {
    pub from: QualityTier,
    pub to: QualityTier,
}

/// Owner of the active profile.
///
/// The controller only decides. Applying the profile to the media source and
/// the links is done by the session actor when a [`QualityChange`] comes back.
#[derive(Debug, Clone)]
pub struct QualityController {
    active: QualityTier,
    adaptive: bool,
    thresholds: QualityThresholds,
}

impl QualityController {
    #[must_use]
    pub fn new(initial: QualityTier, adaptive: bool, thresholds: QualityThresholds) -> Self {
        Self {
            active: initial,
            adaptive,
            thresholds,
        }
    }

    #[must_use]
    pub fn active(&self) -> QualityTier {
        self.active
    }

    #[must_use]
    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    pub fn set_adaptive(&mut self, adaptive: bool) {
        if self.adaptive != adaptive {
            info!(target: "vs.quality", adaptive, "Adaptive quality toggled");
        }
        self.adaptive = adaptive;
    }

    /// Feeds one stats sample. Returns the change to apply, if any.
    pub fn on_stats(&mut self, stats: &ConnectionStats) -> Option<QualityChange> {
        if !self.adaptive {
            return None;
        }

        let target = evaluate(stats, &self.thresholds);
        debug!(
            target: "vs.quality",
            loss = stats.packet_loss_percent,
            bandwidth_bps = stats.bandwidth_bps,
            rtt_ms = stats.round_trip_ms,
            current = %self.active,
            target = %target,
            "Evaluated quality"
        );
        self.transition(target)
    }

    /// Feeds every sample of one monitor tick. The worst link decides, so a
    /// single bad link pulls the shared profile down. `None` for an empty
    /// tick.
    pub fn on_samples<'a>(
        &mut self,
        samples: impl IntoIterator<Item = &'a ConnectionStats>,
    ) -> Option<QualityChange> {
        if !self.adaptive {
            return None;
        }

        let mut links = 0usize;
        let target = samples
            .into_iter()
            .inspect(|_| links += 1)
            .map(|stats| evaluate(stats, &self.thresholds))
            .min()?;
        debug!(
            target: "vs.quality",
            links,
            current = %self.active,
            target = %target,
            "Evaluated quality across links"
        );
        self.transition(target)
    }

    /// Manual override, applied through the same path as adaptive changes.
    pub fn force(&mut self, tier: QualityTier) -> Option<QualityChange> {
        self.transition(tier)
    }

    fn transition(&mut self, to: QualityTier) -> Option<QualityChange> {
        if to == self.active {
            return None;
        }
        let change = QualityChange {
            from: self.active,
            to,
        };
        self.active = to;
        info!(
            target: "vs.quality",
            from = %change.from,
            to = %change.to,
            "Quality profile changed"
        );
        Some(change)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn stats(loss: f64, bandwidth_bps: u64, rtt: f64) -> ConnectionStats {
        ConnectionStats {
            bandwidth_bps,
            packet_loss_percent: loss,
            round_trip_ms: rtt,
            sampled_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_profile_table() {
        let low = QualityTier::Low.profile();
        assert_eq!(low.ideal, Resolution::new(640, 360));
        assert_eq!(low.max, Resolution::new(640, 480));
        assert_eq!(low.max_frame_rate, 15);
        assert_eq!(low.max_bitrate_bps, 300_000);

        let medium = QualityTier::Medium.profile();
        assert_eq!(medium.ideal, Resolution::new(1280, 720));
        assert_eq!(medium.max_frame_rate, 24);
        assert_eq!(medium.max_bitrate_bps, 1_000_000);

        let high = QualityTier::High.profile();
        assert_eq!(high.max, Resolution::new(1920, 1080));
        assert_eq!(high.max_frame_rate, 30);
        assert_eq!(high.max_bitrate_bps, 2_500_000);
    }

    #[test]
    fn test_tier_ordering_and_parse() {
        assert!(QualityTier::Low < QualityTier::Medium);
        assert!(QualityTier::Medium < QualityTier::High);
        assert_eq!("HIGH".parse::<QualityTier>().unwrap(), QualityTier::High);
        assert_eq!(" low ".parse::<QualityTier>().unwrap(), QualityTier::Low);
        assert!("ultra".parse::<QualityTier>().is_err());
    }

    #[test]
    fn test_loss_above_five_is_low() {
        let t = QualityThresholds::default();
        assert_eq!(evaluate(&stats(6.0, 5_000_000, 20.0), &t), QualityTier::Low);
    }

    #[test]
    fn test_high_rtt_forces_low_regardless_of_loss() {
        let t = QualityThresholds::default();
        assert_eq!(evaluate(&stats(0.0, 5_000_000, 350.0), &t), QualityTier::Low);
    }

    #[test]
    fn test_upgrade_needs_bandwidth() {
        let t = QualityThresholds::default();
        assert_eq!(evaluate(&stats(0.5, 500_000, 80.0), &t), QualityTier::Medium);
        assert_eq!(evaluate(&stats(0.5, 2_000_000, 80.0), &t), QualityTier::High);
        // Loss between the high and medium thresholds stays at Medium.
        assert_eq!(evaluate(&stats(1.5, 2_000_000, 80.0), &t), QualityTier::Medium);
    }

    #[test]
    fn test_min_of_two_grid() {
        let t = QualityThresholds::default();
        // (loss, bandwidth) giving each loss outcome
        let loss_cases = [
            ((7.0, 2_000_000), QualityTier::Low),
            ((3.0, 2_000_000), QualityTier::Medium),
            ((0.2, 2_000_000), QualityTier::High),
        ];
        // rtt giving each cap
        let rtt_cases = [
            (400.0, QualityTier::Low),
            (200.0, QualityTier::Medium),
            (50.0, QualityTier::High),
        ];

        for ((loss, bw), by_loss) in loss_cases {
            for (rtt, cap) in rtt_cases {
                let got = evaluate(&stats(loss, bw, rtt), &t);
                assert_eq!(
                    got,
                    by_loss.min(cap),
                    "loss={loss} rtt={rtt} expected min({by_loss}, {cap})"
                );
            }
        }
    }

    #[test]
    fn test_controller_scenario_high_low_medium() {
        let mut qc = QualityController::new(QualityTier::Medium, true, QualityThresholds::default());

        let up = qc.on_stats(&stats(0.5, 2_000_000, 80.0)).unwrap();
        assert_eq!(up, QualityChange { from: QualityTier::Medium, to: QualityTier::High });

        let down = qc.on_stats(&stats(6.0, 2_000_000, 80.0)).unwrap();
        assert_eq!(down.to, QualityTier::Low);

        let back = qc.on_stats(&stats(0.5, 500_000, 80.0)).unwrap();
        assert_eq!(back, QualityChange { from: QualityTier::Low, to: QualityTier::Medium });
        assert_eq!(qc.active(), QualityTier::Medium);
    }

    #[test]
    fn test_unchanged_profile_is_noop() {
        let mut qc = QualityController::new(QualityTier::High, true, QualityThresholds::default());
        assert!(qc.on_stats(&stats(0.1, 3_000_000, 40.0)).is_none());
        assert_eq!(qc.active(), QualityTier::High);
    }

    #[test]
    fn test_non_adaptive_ignores_stats_but_accepts_force() {
        let mut qc = QualityController::new(QualityTier::Medium, false, QualityThresholds::default());
        assert!(qc.on_stats(&stats(9.0, 100_000, 500.0)).is_none());
        assert_eq!(qc.active(), QualityTier::Medium);

        let forced = qc.force(QualityTier::High).unwrap();
        assert_eq!(forced.from, QualityTier::Medium);
        assert!(qc.force(QualityTier::High).is_none());

        qc.set_adaptive(true);
        assert_eq!(
            qc.on_stats(&stats(9.0, 100_000, 50.0)).map(|c| c.to),
            Some(QualityTier::Low)
        );
    }

    #[test]
    fn test_worst_link_decides_regardless_of_order() {
        let good = stats(0.5, 2_000_000, 50.0);
        let bad = stats(12.0, 100_000, 50.0);

        for tick in [[good, bad], [bad, good]] {
            let mut c = QualityController::new(QualityTier::Medium, true, QualityThresholds::default());
            let change = c.on_samples(&tick).unwrap();
            assert_eq!(change.to, QualityTier::Low);
            assert_eq!(c.active(), QualityTier::Low);
        }
    }

    #[test]
    fn test_tick_upgrades_only_when_every_link_allows() {
        let mut c = QualityController::new(QualityTier::Medium, true, QualityThresholds::default());
        let high = stats(0.5, 2_000_000, 50.0);
        let medium = stats(3.0, 2_000_000, 50.0);

        assert!(c.on_samples(&[high, medium]).is_none());
        assert_eq!(c.on_samples(&[high, high]).unwrap().to, QualityTier::High);
        assert!(c.on_samples(std::iter::empty()).is_none());
        assert_eq!(c.active(), QualityTier::High);

        c.set_adaptive(false);
        assert!(c.on_samples(&[stats(20.0, 0, 900.0)]).is_none());
    }

    #[test]
    fn test_custom_thresholds() {
        let t = QualityThresholds {
            loss_low_percent: 10.0,
            rtt_low_ms: 500.0,
            ..QualityThresholds::default()
        };
        assert_eq!(evaluate(&stats(6.0, 2_000_000, 350.0), &t), QualityTier::Medium);
    }
}
