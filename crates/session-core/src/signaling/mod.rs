//! Rendezvous signaling: session membership and relay of negotiation
//! payloads.

pub mod channel;
pub mod error;
pub mod messages;
pub mod websocket;

pub use channel::{SessionPhase, SignalingChannel, SignalingConnector, SignalingEvent, SignalingLink};
pub use error::SignalingError;
pub use messages::{ClientMessage, Envelope, Participant, ServerMessage};
pub use websocket::WebSocketConnector;
