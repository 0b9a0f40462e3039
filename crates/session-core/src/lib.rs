//! Consultation Session Core
//!
//! Connects a client and a professional in a live audio/video consultation:
//!
//! - Joins a session through a rendezvous service and tracks its roster
//! - Acquires local camera/microphone capture at a quality profile
//! - Keeps one direct transport link per remote participant, negotiated over
//!   the rendezvous relay
//! - Samples link health and adapts the quality profile to it
//! - Optionally records the session in timed segments with durable upload
//!
//! # Architecture
//!
//! ```text
//! SessionActor (one per session, single select! loop)
//! ├── SignalingChannel ── SignalingConnector (WebSocket)
//! ├── MediaSource ─────── CaptureDevices
//! ├── PeerLinkManager ─── PeerTransportFactory
//! │   └── PeerLink (one per participant)
//! ├── ConnectionMonitor
//! ├── QualityController
//! └── RecordingPipeline ─ RecorderFactory, SegmentUploader (HTTP multipart)
//! ```
//!
//! The media engine, capture hardware and recorder are capability traits.
//! [`peer::WebRtcTransportFactory`] implements the transport capability over
//! the `webrtc` crate; capture and recording are provided by the host
//! platform.
//!
//! # Modules
//!
//! - [`session`] - Session actor, handle, events
//! - [`signaling`] - Rendezvous protocol and channel
//! - [`peer`] - Transport capability and per-participant links
//! - [`media`] - Local capture
//! - [`monitor`] - Link statistics and health
//! - [`quality`] - Quality profiles and adaptation policy
//! - [`recording`] - Segmenting and upload
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types with error codes

pub mod config;
pub mod errors;
pub mod media;
pub mod monitor;
pub mod observability;
pub mod peer;
pub mod quality;
pub mod recording;
pub mod retry;
pub mod session;
pub mod signaling;

pub use config::SessionConfig;
pub use errors::SessionError;
pub use session::{SessionActor, SessionDeps, SessionEvent, SessionHandle, SessionSnapshot};
