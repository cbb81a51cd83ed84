//! Secret handling.
//!
//! Re-exports the secrecy types used for connection strings so callers
//! need not depend on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};
