//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use these types
//! for every sensitive value the mesh handles, most notably TURN credentials
//! loaded from configuration.
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so any
//! struct deriving `Debug` that holds one gets safe logging behavior for free.
//! Secrets are zeroized when dropped.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct TurnServer {
//!     url: String,
//!     credential: SecretString,  // Debug shows "[REDACTED]"
//! }
//!
//! let server = TurnServer {
//!     url: "turn:turn.example.com:3478".to_string(),
//!     credential: SecretString::from("hunter2"),
//! };
//!
//! println!("{:?}", server);
//!
//! // Reading the value requires an explicit expose_secret()
//! let credential: &str = server.credential.expose_secret();
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};
