//! Line encryption for the identity log and secret-key resolution.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;
use tracing::{error, warn};

/// Required key length in bytes (AES-128).
pub const KEY_LEN: usize = 16;

/// Used when no other key source yields a valid key.
pub const FALLBACK_KEY: &str = "1234567890ABCDEF";

/// Name of the persisted key file inside the data directory.
pub const KEY_FILE_NAME: &str = "player-cache.key";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("key must be exactly 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("line is not valid hex")]
    Encoding,

    #[error("ciphertext too short")]
    TooShort,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed (wrong key or corrupted line)")]
    Decrypt,

    #[error("decrypted line is not valid UTF-8")]
    Utf8,
}

/// Encrypts one plaintext line into hex(nonce || ciphertext) and back.
pub struct LineCipher {
    cipher: Aes128Gcm,
}

impl LineCipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, line: &str) -> Result<String, CipherError> {
        let bytes = hex::decode(line.trim()).map_err(|_| CipherError::Encoding)?;
        if bytes.len() <= NONCE_LEN {
            return Err(CipherError::TooShort);
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
    }
}

impl std::fmt::Debug for LineCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineCipher").finish_non_exhaustive()
    }
}

/// Where a key may come from, highest precedence first.
#[derive(Debug, Clone, Default)]
pub struct KeySources {
    /// Process-environment secret (`AES_KEY`). Never persisted.
    pub env: Option<String>,
    /// Configuration secret. Persisted to the key file when used.
    pub config: Option<String>,
    pub key_file: PathBuf,
}

impl KeySources {
    /// Read `AES_KEY` from the environment and place the key file in `data_dir`.
    pub fn from_env(config_secret: Option<String>, data_dir: &Path) -> Self {
        Self {
            env: std::env::var("AES_KEY").ok(),
            config: config_secret,
            key_file: data_dir.join(KEY_FILE_NAME),
        }
    }
}

/// Pick the identity log key.
///
/// Order: environment secret, configuration secret, key file, fallback.
/// Values of the wrong length are logged and skipped; an invalid key file is
/// deleted. Never fails: a key file that cannot be written only costs
/// persistence.
pub fn resolve_key(sources: &KeySources) -> String {
    let env_present = sources.env.as_deref().is_some_and(|v| !v.trim().is_empty());

    if let Some(key) = validated(sources.env.as_deref(), "environment variable AES_KEY") {
        return key;
    }

    if let Some(key) = validated(sources.config.as_deref(), "configured identity secret") {
        persist_key(&sources.key_file, &key, env_present);
        return key;
    }

    if let Some(key) = load_persisted(&sources.key_file) {
        return key;
    }

    persist_key(&sources.key_file, FALLBACK_KEY, env_present);
    warn!("Identity log is using the built-in fallback key; configure a secret");
    FALLBACK_KEY.to_string()
}

fn validated(raw: Option<&str>, source: &str) -> Option<String> {
    let value = raw.map(str::trim).filter(|v| !v.is_empty())?;
    if value.len() != KEY_LEN {
        error!("Ignoring {} because it is not exactly {} bytes long", source, KEY_LEN);
        return None;
    }
    Some(value.to_string())
}

fn load_persisted(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let key = validated(Some(&raw), "stored key file");
    if key.is_none() {
        error!("Stored key at {} is invalid and will be regenerated", path.display());
        if let Err(e) = fs::remove_file(path) {
            warn!("Could not delete invalid key file {}: {}", path.display(), e);
        }
    }
    key
}

fn persist_key(path: &Path, key: &str, env_present: bool) {
    if env_present {
        return;
    }
    if fs::read_to_string(path).is_ok_and(|existing| existing == key) {
        return;
    }
    if let Some(parent) = path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        warn!("Could not create key directory {}: {}", parent.display(), e);
        return;
    }
    if let Err(e) = fs::write(path, key) {
        warn!("Could not persist identity key to {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(dir: &Path, env: Option<&str>, config: Option<&str>) -> KeySources {
        KeySources {
            env: env.map(str::to_string),
            config: config.map(str::to_string),
            key_file: dir.join(KEY_FILE_NAME),
        }
    }

    #[test]
    fn lines_round_trip_with_fresh_nonces() {
        let cipher = LineCipher::new(FALLBACK_KEY.as_bytes()).unwrap();
        let a = cipher.encrypt("Alice|x|1.2.3.4").unwrap();
        let b = cipher.encrypt("Alice|x|1.2.3.4").unwrap();

        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "Alice|x|1.2.3.4");
    }

    #[test]
    fn bad_lines_are_reported_not_panicked() {
        let cipher = LineCipher::new(FALLBACK_KEY.as_bytes()).unwrap();
        let other = LineCipher::new(b"ABCDEF1234567890").unwrap();

        assert_eq!(cipher.decrypt("zz-not-hex"), Err(CipherError::Encoding));
        assert_eq!(cipher.decrypt("00ff"), Err(CipherError::TooShort));
        let foreign = other.encrypt("secret").unwrap();
        assert_eq!(cipher.decrypt(&foreign), Err(CipherError::Decrypt));
        assert!(matches!(LineCipher::new(b"short"), Err(CipherError::InvalidKeyLength(5))));
    }

    #[test]
    fn env_key_wins_and_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let key = resolve_key(&sources(dir.path(), Some("EEEEEEEEEEEEEEEE"), Some("CCCCCCCCCCCCCCCC")));
        assert_eq!(key, "EEEEEEEEEEEEEEEE");
        assert!(!dir.path().join(KEY_FILE_NAME).exists());
    }

    #[test]
    fn config_key_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let key = resolve_key(&sources(dir.path(), None, Some("CCCCCCCCCCCCCCCC")));
        assert_eq!(key, "CCCCCCCCCCCCCCCC");
        assert_eq!(
            fs::read_to_string(dir.path().join(KEY_FILE_NAME)).unwrap(),
            "CCCCCCCCCCCCCCCC"
        );

        assert_eq!(resolve_key(&sources(dir.path(), None, None)), "CCCCCCCCCCCCCCCC");
    }

    #[test]
    fn wrong_length_values_fall_through_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join(KEY_FILE_NAME);
        fs::write(&key_file, "too-short").unwrap();

        // A set (if unusable) environment secret still suppresses persistence.
        let key = resolve_key(&sources(dir.path(), Some("nope"), Some("also wrong")));
        assert_eq!(key, FALLBACK_KEY);
        assert!(!key_file.exists(), "invalid key file is deleted");

        let key = resolve_key(&sources(dir.path(), None, Some("also wrong")));
        assert_eq!(key, FALLBACK_KEY);
        assert_eq!(fs::read_to_string(&key_file).unwrap(), FALLBACK_KEY);
    }
}
