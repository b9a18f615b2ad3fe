//! Key derivation using Argon2id
//!
//! Archive keys are derived from a passphrase and a per-archive salt. The
//! salt and cost travel in the archive header so any copy of the engine can
//! re-derive the key.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2, Params,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EngineError, EngineResult};

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfCost {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_cost: u32,
    /// Iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism degree (default: 4)
    pub parallelism: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfCost {
    /// Highest cost an engine will write or agree to derive with
    pub const CEILING: KdfCost = KdfCost {
        memory_cost: 4 * 65536,
        time_cost: 12,
        parallelism: 16,
    };

    /// Whether any parameter is above [`KdfCost::CEILING`]
    pub fn exceeds_ceiling(&self) -> bool {
        self.memory_cost > Self::CEILING.memory_cost
            || self.time_cost > Self::CEILING.time_cost
            || self.parallelism > Self::CEILING.parallelism
    }
}

/// Salt plus cost, everything needed to re-derive a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDerivationParams {
    /// Salt in the PHC base64 alphabet
    pub salt: String,
    pub cost: KdfCost,
}

impl KeyDerivationParams {
    /// Fresh params with a random salt
    pub fn generate(cost: KdfCost) -> Self {
        let salt = SaltString::generate(&mut OsRng);
        Self {
            salt: salt.to_string(),
            cost,
        }
    }
}

/// A derived 32-byte AES-256 key, wiped on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; 32],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// Derive an encryption key from a passphrase
pub fn derive_key(passphrase: &str, params: &KeyDerivationParams) -> EngineResult<DerivedKey> {
    if passphrase.is_empty() {
        return Err(EngineError::Encryption("Passphrase must not be empty".into()));
    }

    if params.cost.exceeds_ceiling() {
        return Err(EngineError::Encryption(format!(
            "Argon2 cost {:?} is above the supported ceiling",
            params.cost
        )));
    }

    let salt = SaltString::from_b64(&params.salt)
        .map_err(|e| EngineError::Encryption(format!("Invalid salt: {}", e)))?;

    let argon2_params = Params::new(
        params.cost.memory_cost,
        params.cost.time_cost,
        params.cost.parallelism,
        Some(32),
    )
    .map_err(|e| EngineError::Encryption(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| EngineError::Encryption(format!("Key derivation failed: {}", e)))?;

    let hash_output = hash
        .hash
        .ok_or_else(|| EngineError::Encryption("No hash output generated".to_string()))?;

    let hash_bytes = hash_output.as_bytes();
    if hash_bytes.len() < 32 {
        return Err(EngineError::Encryption(
            "Hash output too short for AES-256 key".to_string(),
        ));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&hash_bytes[..32]);
    Ok(DerivedKey { key })
}

#[cfg(test)]
pub(crate) fn test_cost() -> KdfCost {
    KdfCost {
        memory_cost: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}
