//! Core data types, canonical encoding, and cryptographic primitives for the
//! profile server protocol.
//!
//! # Modules
//!
//! - [`types`]: identities, neighborhood peers, actions, relays, cards
//! - [`canonical`]: deterministic serialization for hashing/signing
//! - [`crypto`]: SHA-256 id derivation and Ed25519 signature utilities
//! - [`error`]: shared error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
