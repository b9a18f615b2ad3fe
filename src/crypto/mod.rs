//! Cryptographic functions for encrypted archives
//!
//! AES-256-GCM per-document sealing with Argon2id key derivation.

pub mod encryption;
pub mod key_derivation;

pub use encryption::{key_check, open, seal, verify_key_check};
pub use key_derivation::{derive_key, DerivedKey, KdfCost, KeyDerivationParams};
