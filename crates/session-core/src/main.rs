//! Session Probe
//!
//! Joins a consultation session over WebSocket signaling without any local
//! media and logs the roster and every participant event until Ctrl+C.
//! Useful for checking a rendezvous deployment end to end.
//!
//! # Environment
//!
//! - `VS_SIGNALING_URL` (required) and the other `VS_*` session settings
//! - `VS_SESSION_ID` (required): session to join
//! - `VS_IDENTITY_TOKEN` (required): participant identity token
//! - `VS_LOG_FORMAT`: `json` for JSON log lines, plain text otherwise
//!
//! On exit the collected metrics are printed in Prometheus text format.

#![warn(clippy::pedantic)]

use anyhow::{anyhow, Context};
use common::secret::SecretString;
use common::types::SessionId;
use session_core::observability::{init_metrics_recorder, metrics};
use session_core::retry::Backoff;
use session_core::signaling::{SignalingChannel, SignalingEvent, WebSocketConnector};
use session_core::SessionConfig;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let json = std::env::var("VS_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_probe=info,session_core=info,vs=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    let config = SessionConfig::from_env().context("Failed to load configuration")?;
    let session_id = SessionId::from(required_env("VS_SESSION_ID")?);
    let token = SecretString::from(required_env("VS_IDENTITY_TOKEN")?);

    let prometheus = init_metrics_recorder().map_err(|e| anyhow!(e))?;

    info!(target: "vs.probe", config = ?config, session_id = %session_id, "Starting session probe");

    let connector = Arc::new(WebSocketConnector::new(config.signaling_url.clone()));
    let mut channel = SignalingChannel::new(connector, config.join_timeout);

    let roster = channel
        .join(session_id, token)
        .await
        .context("Failed to join session")?;
    info!(target: "vs.probe", participants = roster.len(), "Joined");
    for participant in &roster {
        info!(
            target: "vs.probe",
            participant_id = %participant.participant_id,
            has_video = participant.has_video,
            has_audio = participant.has_audio,
            "Present"
        );
    }

    let mut backoff = Backoff::signaling(config.signaling_max_reconnects);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(target: "vs.probe", "Shutdown requested");
                break Ok(());
            }

            event = channel.next_event() => {
                if event == SignalingEvent::Disconnected {
                    if let Err(e) = reconnect(&mut channel, &mut backoff).await {
                        break Err(e);
                    }
                } else {
                    log_event(&event);
                }
            }
        }
    };

    channel.leave();
    println!("{}", prometheus.render());
    outcome
}

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("Missing environment variable: {name}"))
}

async fn reconnect(channel: &mut SignalingChannel, backoff: &mut Backoff) -> anyhow::Result<()> {
    while let Some(delay) = backoff.next_delay() {
        warn!(
            target: "vs.probe",
            attempt = backoff.retries(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Signaling lost, reconnecting"
        );
        tokio::time::sleep(delay).await;

        match channel.reconnect().await {
            Ok(roster) => {
                metrics::record_signaling_reconnect("success");
                info!(target: "vs.probe", participants = roster.len(), "Signaling restored");
                backoff.reset();
                return Ok(());
            }
            Err(e) => {
                metrics::record_signaling_reconnect("error");
                warn!(target: "vs.probe", error = %e, "Reconnect failed");
            }
        }
    }
    metrics::record_signaling_reconnect("exhausted");
    Err(anyhow!(
        "signaling lost after {} reconnect attempts",
        backoff.retries()
    ))
}

fn log_event(event: &SignalingEvent) {
    match event {
        SignalingEvent::ParticipantJoined(p) => {
            info!(target: "vs.probe", participant_id = %p.participant_id, transport_id = %p.transport_id, "Participant joined");
        }
        SignalingEvent::ParticipantLeft(participant_id) => {
            info!(target: "vs.probe", participant_id = %participant_id, "Participant left");
        }
        SignalingEvent::SignalReceived { from, signal } => {
            // No media in probe mode; negotiation is observed, not answered
            info!(target: "vs.probe", from = %from, kind = signal.kind(), "Signal received");
        }
        SignalingEvent::MediaSettingsChanged {
            participant_id,
            has_video,
            has_audio,
        } => {
            info!(
                target: "vs.probe",
                participant_id = %participant_id,
                has_video,
                has_audio,
                "Media settings changed"
            );
        }
        SignalingEvent::RemoteRecording { started, by } => {
            info!(target: "vs.probe", started, by = ?by, "Remote recording");
        }
        SignalingEvent::ServerError(message) => {
            warn!(target: "vs.probe", message = %message, "Server error");
        }
        SignalingEvent::Disconnected => {}
    }
}
