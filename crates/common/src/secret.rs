//! Secret types for values that must never reach a log line.
//!
//! Re-exports [`secrecy`]. `SecretString` redacts itself in `Debug`, so any
//! struct deriving `Debug` that holds one (TURN relay credentials, for
//! example) is safe to pass to `tracing` fields.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct RelayCredentials {
//!     username: String,
//!     credential: SecretString,
//! }
//!
//! let creds = RelayCredentials {
//!     username: "relay-user".to_string(),
//!     credential: SecretString::from("relay-pass"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("relay-pass"));
//! assert_eq!(creds.credential.expose_secret(), "relay-pass");
//! ```

pub use secrecy::{ExposeSecret, SecretString};
