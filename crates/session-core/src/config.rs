//! Session configuration.
//!
//! Configuration is loaded from environment variables. The upload token and
//! relay credentials are redacted in Debug output.

use crate::quality::{QualityThresholds, QualityTier};
use common::secret::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default bound on waiting for the roster after `join-consultation`.
pub const DEFAULT_JOIN_TIMEOUT_SECONDS: u64 = 10;

/// Default interval between connection monitor samples.
pub const DEFAULT_MONITOR_INTERVAL_SECONDS: u64 = 5;

/// Default time a disconnected link may spend in `Reconnecting`.
pub const DEFAULT_LINK_GRACE_PERIOD_SECONDS: u64 = 10;

/// Default time a link may take to reach `Connected`.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECONDS: u64 = 20;

/// Default recording segment duration.
pub const DEFAULT_SEGMENT_DURATION_SECONDS: u64 = 10;

/// Default attempts per segment upload (first try included).
pub const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first upload retry.
pub const DEFAULT_UPLOAD_INITIAL_BACKOFF_MS: u64 = 500;

/// Default reconnect attempts after the signaling connection drops.
pub const DEFAULT_SIGNALING_MAX_RECONNECTS: u32 = 5;

/// Default STUN endpoint used when no ICE configuration is supplied.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// One entry of the ICE configuration handed to the transport engine.
#[derive(Clone, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    /// TURN credential, never logged.
    #[serde(default)]
    pub credential: Option<SecretString>,
}

impl IceServer {
    /// A credential-less STUN entry.
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Session configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the rendezvous service.
    pub signaling_url: String,

    /// Segment upload endpoint. Recording is unavailable without it.
    pub upload_url: Option<String>,

    /// Bearer token for segment uploads.
    pub upload_token: Option<SecretString>,

    pub ice_servers: Vec<IceServer>,

    pub join_timeout: Duration,
    pub monitor_interval: Duration,
    pub link_grace_period: Duration,
    pub negotiation_timeout: Duration,
    pub segment_duration: Duration,

    pub upload_max_attempts: u32,
    pub upload_initial_backoff: Duration,

    pub signaling_max_reconnects: u32,

    pub adaptive_quality: bool,
    pub initial_quality: QualityTier,
    pub thresholds: QualityThresholds,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("signaling_url", &self.signaling_url)
            .field("upload_url", &self.upload_url)
            .field(
                "upload_token",
                &self.upload_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ice_servers", &self.ice_servers)
            .field("join_timeout", &self.join_timeout)
            .field("monitor_interval", &self.monitor_interval)
            .field("link_grace_period", &self.link_grace_period)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("segment_duration", &self.segment_duration)
            .field("upload_max_attempts", &self.upload_max_attempts)
            .field("upload_initial_backoff", &self.upload_initial_backoff)
            .field("signaling_max_reconnects", &self.signaling_max_reconnects)
            .field("adaptive_quality", &self.adaptive_quality)
            .field("initial_quality", &self.initial_quality)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SessionConfig {
    /// Configuration with every default and the given rendezvous URL.
    #[must_use]
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            upload_url: None,
            upload_token: None,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECONDS),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECONDS),
            link_grace_period: Duration::from_secs(DEFAULT_LINK_GRACE_PERIOD_SECONDS),
            negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECONDS),
            segment_duration: Duration::from_secs(DEFAULT_SEGMENT_DURATION_SECONDS),
            upload_max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
            upload_initial_backoff: Duration::from_millis(DEFAULT_UPLOAD_INITIAL_BACKOFF_MS),
            signaling_max_reconnects: DEFAULT_SIGNALING_MAX_RECONNECTS,
            adaptive_quality: true,
            initial_quality: QualityTier::Medium,
            thresholds: QualityThresholds::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_url = vars
            .get("VS_SIGNALING_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("VS_SIGNALING_URL".to_string()))?
            .clone();

        let mut config = Self::new(signaling_url);

        config.upload_url = vars.get("VS_UPLOAD_URL").cloned();
        config.upload_token = vars
            .get("VS_UPLOAD_TOKEN")
            .map(|t| SecretString::from(t.clone()));

        if let Some(raw) = vars.get("VS_ICE_SERVERS") {
            let servers: Vec<IceServer> = serde_json::from_str(raw).map_err(|e| {
                ConfigError::InvalidValue(format!("VS_ICE_SERVERS must be a JSON array: {e}"))
            })?;
            if servers.iter().any(|s| s.urls.is_empty()) {
                return Err(ConfigError::InvalidValue(
                    "VS_ICE_SERVERS entries must have at least one url".to_string(),
                ));
            }
            config.ice_servers = servers;
        }

        config.join_timeout = seconds(vars, "VS_JOIN_TIMEOUT_SECONDS", config.join_timeout)?;
        config.monitor_interval =
            seconds(vars, "VS_MONITOR_INTERVAL_SECONDS", config.monitor_interval)?;
        config.link_grace_period =
            seconds(vars, "VS_LINK_GRACE_PERIOD_SECONDS", config.link_grace_period)?;
        config.negotiation_timeout = seconds(
            vars,
            "VS_NEGOTIATION_TIMEOUT_SECONDS",
            config.negotiation_timeout,
        )?;
        config.segment_duration =
            seconds(vars, "VS_SEGMENT_DURATION_SECONDS", config.segment_duration)?;

        config.upload_max_attempts =
            parse_or(vars, "VS_UPLOAD_MAX_ATTEMPTS", config.upload_max_attempts)?;
        if config.upload_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "VS_UPLOAD_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        config.signaling_max_reconnects = parse_or(
            vars,
            "VS_SIGNALING_MAX_RECONNECTS",
            config.signaling_max_reconnects,
        )?;
        config.adaptive_quality = parse_or(vars, "VS_ADAPTIVE_QUALITY", config.adaptive_quality)?;
        config.initial_quality = parse_or(vars, "VS_INITIAL_QUALITY", config.initial_quality)?;

        let t = &mut config.thresholds;
        t.loss_low_percent = parse_or(vars, "VS_LOSS_LOW_PERCENT", t.loss_low_percent)?;
        t.loss_medium_percent = parse_or(vars, "VS_LOSS_MEDIUM_PERCENT", t.loss_medium_percent)?;
        t.loss_high_percent = parse_or(vars, "VS_LOSS_HIGH_PERCENT", t.loss_high_percent)?;
        t.rtt_low_ms = parse_or(vars, "VS_RTT_LOW_MS", t.rtt_low_ms)?;
        t.rtt_medium_ms = parse_or(vars, "VS_RTT_MEDIUM_MS", t.rtt_medium_ms)?;
        t.high_bandwidth_bps = parse_or(vars, "VS_HIGH_BANDWIDTH_BPS", t.high_bandwidth_bps)?;

        if !(t.loss_high_percent <= t.loss_medium_percent
            && t.loss_medium_percent <= t.loss_low_percent)
        {
            return Err(ConfigError::InvalidValue(format!(
                "loss thresholds must satisfy high <= medium <= low, got {} / {} / {}",
                t.loss_high_percent, t.loss_medium_percent, t.loss_low_percent
            )));
        }
        if t.rtt_medium_ms > t.rtt_low_ms {
            return Err(ConfigError::InvalidValue(format!(
                "VS_RTT_MEDIUM_MS ({}) must not exceed VS_RTT_LOW_MS ({})",
                t.rtt_medium_ms, t.rtt_low_ms
            )));
        }

        Ok(config)
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            ConfigError::InvalidValue(format!("{key} has invalid value '{raw}': {e}"))
        }),
        None => Ok(default),
    }
}

fn seconds(
    vars: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_or(vars, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{key} must be positive, got 0"
        )));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "VS_SIGNALING_URL".to_string(),
            "wss://signal.example.com/ws".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = SessionConfig::from_vars(&base_vars()).expect("Config should load");

        assert_eq!(config.signaling_url, "wss://signal.example.com/ws");
        assert!(config.upload_url.is_none());
        assert!(config.upload_token.is_none());
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.link_grace_period, Duration::from_secs(10));
        assert_eq!(config.negotiation_timeout, Duration::from_secs(20));
        assert_eq!(config.segment_duration, Duration::from_secs(10));
        assert_eq!(config.upload_max_attempts, 3);
        assert_eq!(config.upload_initial_backoff, Duration::from_millis(500));
        assert_eq!(config.signaling_max_reconnects, 5);
        assert!(config.adaptive_quality);
        assert_eq!(config.initial_quality, QualityTier::Medium);
        assert_eq!(config.thresholds, QualityThresholds::default());
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
    }

    #[test]
    fn test_from_vars_missing_signaling_url() {
        let result = SessionConfig::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "VS_SIGNALING_URL"));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("VS_UPLOAD_URL".to_string(), "https://rec.example.com/upload".to_string());
        vars.insert("VS_UPLOAD_TOKEN".to_string(), "upload-secret".to_string());
        vars.insert("VS_JOIN_TIMEOUT_SECONDS".to_string(), "3".to_string());
        vars.insert("VS_UPLOAD_MAX_ATTEMPTS".to_string(), "5".to_string());
        vars.insert("VS_ADAPTIVE_QUALITY".to_string(), "false".to_string());
        vars.insert("VS_INITIAL_QUALITY".to_string(), "low".to_string());
        vars.insert("VS_RTT_LOW_MS".to_string(), "400".to_string());

        let config = SessionConfig::from_vars(&vars).expect("Config should load");
        assert_eq!(config.upload_url.as_deref(), Some("https://rec.example.com/upload"));
        assert_eq!(
            config.upload_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("upload-secret".to_string())
        );
        assert_eq!(config.join_timeout, Duration::from_secs(3));
        assert_eq!(config.upload_max_attempts, 5);
        assert!(!config.adaptive_quality);
        assert_eq!(config.initial_quality, QualityTier::Low);
        assert!((config.thresholds.rtt_low_ms - 400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_numeric_is_rejected() {
        let mut vars = base_vars();
        vars.insert("VS_MONITOR_INTERVAL_SECONDS".to_string(), "five".to_string());

        let result = SessionConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("VS_MONITOR_INTERVAL_SECONDS"))
        );
    }

    #[test]
    fn test_zero_duration_is_rejected() {
        let mut vars = base_vars();
        vars.insert("VS_SEGMENT_DURATION_SECONDS".to_string(), "0".to_string());

        let result = SessionConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("must be positive")));
    }

    #[test]
    fn test_zero_upload_attempts_is_rejected() {
        let mut vars = base_vars();
        vars.insert("VS_UPLOAD_MAX_ATTEMPTS".to_string(), "0".to_string());

        assert!(matches!(
            SessionConfig::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_inverted_loss_thresholds_rejected() {
        let mut vars = base_vars();
        vars.insert("VS_LOSS_MEDIUM_PERCENT".to_string(), "8".to_string());

        let result = SessionConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("loss thresholds")));
    }

    #[test]
    fn test_ice_servers_json() {
        let mut vars = base_vars();
        vars.insert(
            "VS_ICE_SERVERS".to_string(),
            r#"[
                {"urls": "stun:stun.example.com:3478"},
                {"urls": ["turn:relay.example.com:3478", "turns:relay.example.com:5349"],
                 "username": "vs", "credential": "turn-pass"}
            ]"#
            .to_string(),
        );

        let config = SessionConfig::from_vars(&vars).expect("Config should load");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls.len(), 2);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("vs"));

        let debug = format!("{config:?}");
        assert!(!debug.contains("turn-pass"));
        assert!(debug.contains("relay.example.com"));
    }

    #[test]
    fn test_ice_servers_invalid_json() {
        let mut vars = base_vars();
        vars.insert("VS_ICE_SERVERS".to_string(), "stun:nope".to_string());

        assert!(matches!(
            SessionConfig::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("VS_ICE_SERVERS")
        ));
    }

    #[test]
    fn test_debug_redacts_upload_token() {
        let mut vars = base_vars();
        vars.insert("VS_UPLOAD_TOKEN".to_string(), "super-secret-token".to_string());

        let config = SessionConfig::from_vars(&vars).unwrap();
        let debug = format!("{config:?}");

        assert!(!debug.contains("super-secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }
}
