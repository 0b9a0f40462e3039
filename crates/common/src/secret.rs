//! Secret types for values that must never reach the logs.
//!
//! Re-exports the [`secrecy`] types. Wrapping a value in `SecretString` gives
//! it a redacting `Debug`, so structs that derive `Debug` stay safe to log
//! with `{:?}` or as a `tracing` field.
//!
//! Values carried as secrets in the session crates:
//! - the participant identity token presented on `join-consultation`
//! - the bearer token used for recording uploads
//! - TURN relay credentials from the ICE configuration
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct JoinRequest {
//!     session_id: String,
//!     identity_token: SecretString,
//! }
//!
//! let req = JoinRequest {
//!     session_id: "consult-42".to_string(),
//!     identity_token: SecretString::from("eyJhbGciOi"),
//! };
//!
//! assert!(!format!("{req:?}").contains("eyJhbGciOi"));
//! assert_eq!(req.identity_token.expose_secret(), "eyJhbGciOi");
//! ```

pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("bearer-abc");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("bearer-abc"));
    }

    #[test]
    fn test_relay_credential_deserializes_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Relay {
            urls: String,
            credential: SecretString,
        }

        let json = r#"{"urls": "turn:relay.example.com:3478", "credential": "turn-pass"}"#;
        let relay: Relay = serde_json::from_str(json).expect("deserialize");

        assert_eq!(relay.credential.expose_secret(), "turn-pass");

        let debug = format!("{relay:?}");
        assert!(debug.contains("turn:relay.example.com"));
        assert!(!debug.contains("turn-pass"));
    }

    #[test]
    fn test_clone_keeps_value() {
        let secret = SecretString::from("identity");
        let cloned = secret.clone();
        assert_eq!(cloned.expose_secret(), "identity");
    }
}
