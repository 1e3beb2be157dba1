//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers of gateway-events do not need a
//! direct dependency to read the database URL.

pub use secrecy::{ExposeSecret, SecretString};
