//! Peer links: transport capability, per-link state machine, the manager
//! that owns one link per remote participant, and the `webrtc` adapter.

pub mod link;
pub mod manager;
pub mod transport;
pub mod webrtc;

pub use link::{LinkSnapshot, LinkState, NegotiationState};
pub use manager::{LinkOutput, PeerLinkManager};
pub use transport::{
    IceCandidate, PeerTransport, PeerTransportFactory, RemoteStream, SdpKind, Signal,
    TransportError, TransportEvent, TransportNotice, TransportNotifier, TransportState,
};
pub use self::webrtc::{LocalTrackRegistry, WebRtcTransportFactory};
