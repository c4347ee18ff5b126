//! Anonymous identity derivation
//!
//! Raw member identifiers (chat IDs, node IDs) never reach the database.
//! Every row is keyed by the peppered digest computed here, so the stored
//! data on its own cannot be joined back to a real identifier.

use std::path::Path;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the server-side pepper.
pub const PEPPER_ENV: &str = "LEDGER_PEPPER";
/// Environment variable holding the hash salt.
pub const SALT_ENV: &str = "LEDGER_SALT";

/// Derives stable anonymous keys: lowercase hex of
/// HMAC-SHA256(pepper, raw_id || salt).
///
/// The same pepper and salt always map a raw identifier to the same key,
/// which is what lets score rows accumulate without the identifier itself
/// ever being stored.
#[derive(Clone)]
pub struct IdentityHasher {
    mac: HmacSha256,
    salt: Vec<u8>,
}

impl IdentityHasher {
    pub fn new(pepper: &[u8], salt: impl Into<Vec<u8>>) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(pepper)
            .map_err(|e| anyhow::anyhow!("invalid pepper: {}", e))?;
        Ok(Self {
            mac,
            salt: salt.into(),
        })
    }

    /// Build a hasher from `LEDGER_PEPPER` / `LEDGER_SALT`.
    ///
    /// In production both must be set or startup fails. In development a
    /// missing secret falls back to a generated value persisted on disk
    /// (the salt at `salt_file`, the pepper next to it), both loudly.
    pub fn from_env(production: bool, salt_file: &Path) -> Result<Self> {
        let pepper = std::env::var(PEPPER_ENV).ok().filter(|v| !v.is_empty());
        let salt = std::env::var(SALT_ENV).ok().filter(|v| !v.is_empty());
        Self::from_parts(pepper, salt, production, salt_file)
    }

    pub fn from_parts(
        pepper: Option<String>,
        salt: Option<String>,
        production: bool,
        salt_file: &Path,
    ) -> Result<Self> {
        let pepper = match pepper {
            Some(value) => value.into_bytes(),
            None if production => {
                anyhow::bail!("{} must be set when running in production", PEPPER_ENV)
            }
            None => load_or_create_secret_file(&salt_file.with_extension("pepper"), PEPPER_ENV)?,
        };

        let salt = match salt {
            Some(value) => value.into_bytes(),
            None if production => {
                anyhow::bail!("{} must be set when running in production", SALT_ENV)
            }
            None => load_or_create_secret_file(salt_file, SALT_ENV)?,
        };

        Self::new(&pepper, salt)
    }

    /// Anonymous key for a raw identifier. 64 lowercase hex characters.
    pub fn hash_identity(&self, raw_id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(raw_id.as_bytes());
        mac.update(&self.salt);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Development-only secret persistence. Reuses the file when present so keys
/// stay stable across restarts on the same machine, but a redeploy without
/// the file loses the pseudonym mapping.
fn load_or_create_secret_file(path: &Path, env_name: &str) -> Result<Vec<u8>> {
    if path.exists() {
        let value = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secret file {}", path.display()))?;
        let value = value.trim();
        if !value.is_empty() {
            warn!(
                "{} not set; using development fallback from {}. \
                 Pseudonym stability across redeployments is NOT guaranteed.",
                env_name,
                path.display()
            );
            return Ok(value.as_bytes().to_vec());
        }
    }

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let value = hex::encode(bytes);
    std::fs::write(path, &value)
        .with_context(|| format!("failed to write secret file {}", path.display()))?;
    warn!(
        "{} not set; generated a development fallback at {}. \
         Pseudonym stability across redeployments is NOT guaranteed.",
        env_name,
        path.display()
    );
    Ok(value.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_salt_path() -> PathBuf {
        std::env::temp_dir().join(format!("ledger-salt-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_hash_is_deterministic_hex() {
        let hasher = IdentityHasher::new(b"pepper", b"salt".to_vec()).unwrap();
        let a = hasher.hash_identity("user-123");
        let b = hasher.hash_identity("user-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_distinct_ids_do_not_collide() {
        let hasher = IdentityHasher::new(b"pepper", b"salt".to_vec()).unwrap();
        assert_ne!(hasher.hash_identity("user-1"), hasher.hash_identity("user-2"));
    }

    #[test]
    fn test_pepper_and_salt_both_change_output() {
        let base = IdentityHasher::new(b"pepper", b"salt".to_vec()).unwrap();
        let other_pepper = IdentityHasher::new(b"different", b"salt".to_vec()).unwrap();
        let other_salt = IdentityHasher::new(b"pepper", b"other".to_vec()).unwrap();
        let id = "user-123";
        assert_ne!(base.hash_identity(id), other_pepper.hash_identity(id));
        assert_ne!(base.hash_identity(id), other_salt.hash_identity(id));
    }

    #[test]
    fn test_production_requires_both_secrets() {
        let path = temp_salt_path();
        assert!(IdentityHasher::from_parts(None, Some("salt".into()), true, &path).is_err());
        assert!(IdentityHasher::from_parts(Some("pepper".into()), None, true, &path).is_err());
        assert!(
            IdentityHasher::from_parts(Some("pepper".into()), Some("salt".into()), true, &path)
                .is_ok()
        );
    }

    #[test]
    fn test_development_salt_file_is_stable() {
        let path = temp_salt_path();
        let first = IdentityHasher::from_parts(Some("pepper".into()), None, false, &path).unwrap();
        let second = IdentityHasher::from_parts(Some("pepper".into()), None, false, &path).unwrap();
        assert_eq!(
            first.hash_identity("user-123"),
            second.hash_identity("user-123")
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_development_pepper_file_is_stable() {
        let path = temp_salt_path();
        let first = IdentityHasher::from_parts(None, Some("salt".into()), false, &path).unwrap();
        let second = IdentityHasher::from_parts(None, Some("salt".into()), false, &path).unwrap();
        assert_eq!(
            first.hash_identity("user-123"),
            second.hash_identity("user-123")
        );
        assert!(path.with_extension("pepper").exists());
        let _ = std::fs::remove_file(path.with_extension("pepper"));
        let _ = std::fs::remove_file(&path);
    }
}
