//! # Session Test Utilities
//!
//! In-memory fakes for every capability the session core runs on, plus
//! fixtures for driving a `SessionActor` end to end without a network,
//! capture hardware or a media engine.
//!
//! ## Modules
//!
//! - `signaling` - Fake rendezvous service (auto-roster, server push, drop)
//! - `transport` - Fake peer transports with a call log and scripted stats
//! - `devices` - Fake capture devices
//! - `recorder` - Fake segment recorder fed from the test
//! - `uploader` - Scripted segment uploader with per-sequence failures
//! - `fixtures` - Participants, configuration and a ready-to-use harness
//!
//! ## Usage
//!
//! ```rust,ignore
//! use session_test_utils::fixtures::TestSession;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let mut session = TestSession::spawn("client-1");
//!     session.signaling.set_roster(vec![participant("pro-1")]);
//!
//!     let roster = session.join().await.unwrap();
//!     assert_eq!(roster.len(), 1);
//! }
//! ```

pub mod devices;
pub mod fixtures;
pub mod recorder;
pub mod signaling;
pub mod transport;
pub mod uploader;

pub use devices::FakeDevices;
pub use fixtures::TestSession;
pub use recorder::FakeRecorderFactory;
pub use signaling::FakeSignaling;
pub use transport::FakeTransportFactory;
pub use uploader::ScriptedUploader;
