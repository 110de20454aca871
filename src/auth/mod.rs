//! Authentication Module
//!
//! Connection admission, signed logins and session tokens for the gateway.

mod admission;
mod identity;
mod session;

pub use admission::AllowList;
pub use identity::{Ed25519Verifier, IdentityService, SignatureVerifier};
pub use session::SessionStore;
