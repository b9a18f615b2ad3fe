//! Passphrase input for encrypted archives

use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult};

/// Environment variable consulted before prompting
pub const PASSPHRASE_ENV: &str = "CMS_BACKUP_PASSPHRASE";

const MIN_PASSPHRASE_LEN: usize = 8;

/// Passphrase for a new encrypted backup, confirmed when typed
pub fn new_passphrase() -> EngineResult<Zeroizing<String>> {
    if let Some(pass) = from_env() {
        return check_length(pass);
    }

    let first = prompt_passphrase("Enter backup passphrase: ")?;
    let first = check_length(first)?;
    let second = prompt_passphrase("Confirm passphrase: ")?;
    if *first != *second {
        return Err(EngineError::Validation("Passphrases do not match".into()));
    }
    Ok(first)
}

/// Passphrase for reading an existing encrypted archive
pub fn existing_passphrase() -> EngineResult<Zeroizing<String>> {
    match from_env() {
        Some(pass) => Ok(pass),
        None => prompt_passphrase("Enter archive passphrase: "),
    }
}

fn from_env() -> Option<Zeroizing<String>> {
    std::env::var(PASSPHRASE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(Zeroizing::new)
}

fn check_length(pass: Zeroizing<String>) -> EngineResult<Zeroizing<String>> {
    if pass.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(EngineError::Validation(format!(
            "Passphrase must be at least {} characters",
            MIN_PASSPHRASE_LEN
        )));
    }
    Ok(pass)
}

/// Prompt for a passphrase (hidden input)
fn prompt_passphrase(prompt: &str) -> EngineResult<Zeroizing<String>> {
    rpassword::prompt_password(prompt)
        .map(Zeroizing::new)
        .map_err(|e| EngineError::Encryption(format!("Failed to read passphrase: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_passphrase_rejected() {
        let err = check_length(Zeroizing::new("short".to_string())).unwrap_err();
        assert!(err.is_validation());
        assert!(check_length(Zeroizing::new("long enough".to_string())).is_ok());
    }
}
