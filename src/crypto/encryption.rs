//! AES-256-GCM sealing of archive documents
//!
//! A sealed blob is the 12-byte nonce followed by ciphertext and tag. Each
//! call draws a fresh random nonce.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};

use super::DerivedKey;
use crate::error::{EngineError, EngineResult};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Plaintext sealed into the archive header to verify the passphrase
const KEY_CHECK_PLAINTEXT: &[u8] = b"cms-backup key check v1";

fn cipher(key: &DerivedKey) -> EngineResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| EngineError::Encryption(format!("Failed to create cipher: {}", e)))
}

/// Encrypt bytes, returning `nonce || ciphertext`
pub fn seal(plaintext: &[u8], key: &DerivedKey) -> EngineResult<Vec<u8>> {
    let cipher = cipher(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| EngineError::Encryption(format!("Encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a blob produced by [`seal`]
pub fn open(sealed: &[u8], key: &DerivedKey) -> EngineResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(EngineError::Encryption(format!(
            "Sealed data too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher(key)?.decrypt(nonce, ciphertext).map_err(|_| {
        EngineError::Encryption("Decryption failed: invalid key or corrupted data".to_string())
    })
}

/// Sealed marker written to encrypted archive headers
pub fn key_check(key: &DerivedKey) -> EngineResult<Vec<u8>> {
    seal(KEY_CHECK_PLAINTEXT, key)
}

/// Confirm that `key` opens a header marker from [`key_check`]
pub fn verify_key_check(sealed: &[u8], key: &DerivedKey) -> EngineResult<()> {
    match open(sealed, key) {
        Ok(plain) if plain == KEY_CHECK_PLAINTEXT => Ok(()),
        _ => Err(EngineError::Encryption(
            "Wrong passphrase for encrypted archive".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_derivation::{derive_key, test_cost, KeyDerivationParams};

    fn test_key(passphrase: &str) -> DerivedKey {
        derive_key(passphrase, &KeyDerivationParams::generate(test_cost())).unwrap()
    }

    #[test]
    fn test_seal_open() {
        let key = test_key("secret");
        let sealed = seal(b"{\"_id\":\"a\"}", &key).unwrap();
        assert_eq!(open(&sealed, &key).unwrap(), b"{\"_id\":\"a\"}");
    }

    #[test]
    fn test_different_nonces() {
        let key = test_key("secret");
        let a = seal(b"same", &key).unwrap();
        let b = seal(b"same", &key).unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key("secret");
        let mut sealed = seal(b"payload", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&sealed, &key).is_err());
    }

    #[test]
    fn test_truncated_blob_fails() {
        let key = test_key("secret");
        assert!(open(&[0u8; 4], &key).is_err());
    }

    #[test]
    fn test_key_check_detects_wrong_key() {
        let right = test_key("right");
        let wrong = test_key("wrong");
        let check = key_check(&right).unwrap();

        assert!(verify_key_check(&check, &right).is_ok());
        let err = verify_key_check(&check, &wrong).unwrap_err();
        assert!(err.to_string().contains("Wrong passphrase"));
    }
}
