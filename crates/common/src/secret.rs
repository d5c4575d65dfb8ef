//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types. The gateway keeps its TURN credential in a
//! `SecretString`, so any struct deriving `Debug` around it prints a redacted
//! value and the credential is zeroized on drop.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TurnSettings {
//!     username: String,
//!     credential: SecretString,
//! }
//!
//! let settings = TurnSettings {
//!     username: "relay".to_string(),
//!     credential: SecretString::from("s3cret"),
//! };
//!
//! assert!(!format!("{settings:?}").contains("s3cret"));
//! assert_eq!(settings.credential.expose_secret(), "s3cret");
//! ```

pub use secrecy::{ExposeSecret, SecretString};
