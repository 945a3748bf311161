//! Base types and utilities for orbit

pub mod base32;
pub mod hash;
pub mod key;

pub use hash::Hash;
pub use key::{Identity, IdentityId, PublicIdentity, PublicKey, Signer, SigningError};
