//! The session actor: one serialized event loop per consultation session.

pub mod actor;
pub mod messages;

pub use actor::{SessionActor, SessionDeps, SessionHandle};
pub use messages::{SessionEvent, SessionMessage, SessionSnapshot};
