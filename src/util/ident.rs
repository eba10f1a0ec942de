//! Local identity: the persisted system id and the cluster shared secret.

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The system id assigned by the region at registration, persisted so that
/// restarts present the same identity.
#[derive(Debug)]
pub struct IdentStore {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl IdentStore {
    pub fn new(path: PathBuf) -> Self {
        let cached = fs::read_to_string(&path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.cached.lock().clone()
    }

    pub fn set(&self, system_id: &str) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, system_id)?;
        fs::rename(&tmp, &self.path)?;
        *self.cached.lock() = Some(system_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("cannot read shared secret at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("shared secret at {0} is not valid hex")]
    Malformed(String),
}

/// The shared secret both sides prove knowledge of during the handshake.
/// Stored hex-encoded on disk.
#[derive(Clone)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, SecretError> {
        let text = fs::read_to_string(path).map_err(|source| SecretError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let bytes = hex::decode(text.trim())
            .map_err(|_| SecretError::Malformed(path.display().to_string()))?;
        Ok(Self(bytes))
    }

    /// `HMAC-SHA256(secret, message ++ salt)`.
    pub fn calculate_digest(&self, message: &[u8], salt: &[u8]) -> Vec<u8> {
        self.mac(message, salt).finalize().into_bytes().to_vec()
    }

    /// Check a peer's digest in constant time.
    pub fn verify_digest(&self, message: &[u8], salt: &[u8], digest: &[u8]) -> bool {
        self.mac(message, salt).verify_slice(digest).is_ok()
    }

    fn mac(&self, message: &[u8], salt: &[u8]) -> Hmac<Sha256> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.0)
            .expect("HMAC accepts keys of any length");
        mac.update(message);
        mac.update(salt);
        mac
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}
