//! Local node identity: WireGuard-style X25519 keys, base64 everywhere a
//! key crosses a textual boundary, and keypair persistence on disk.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use x25519_dalek::StaticSecret;

const DEFAULT_IDENTITY_DIR: &str = ".plexus";
const IDENTITY_FILE: &str = "identity.key";

#[derive(Debug, Error)]
pub enum KeyParseError {
    #[error("invalid base64 key")]
    Base64,
    #[error("key must decode to 32 bytes, got {0}")]
    Length(usize),
}

/// A tunnel public key. This is the sole identity of a remote peer;
/// overlay addresses and endpoints are derived attributes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> String {
        let full = self.to_base64();
        full[..8.min(full.len())].to_string()
    }
}

impl FromStr for PublicKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64.decode(s).map_err(|_| KeyParseError::Base64)?;
        let bytes: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| KeyParseError::Length(decoded.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", self.short())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A tunnel private key. Never logged, never serialized onto the wire.
#[derive(Clone)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Derive the matching public key (X25519 base point multiplication).
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }
}

impl FromStr for PrivateKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64.decode(s).map_err(|_| KeyParseError::Base64)?;
        let bytes: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| KeyParseError::Length(decoded.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// The local node's persisted keypair.
#[derive(Debug)]
pub struct Identity {
    private_key: PrivateKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            private_key: PrivateKey::generate(),
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_IDENTITY_DIR)
    }

    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let base_path = path.cloned().unwrap_or_else(Self::default_path);
        let key_path = base_path.join(IDENTITY_FILE);

        let data = fs::read_to_string(&key_path)
            .context(format!("failed to read identity from {:?}", key_path))?;
        let private_key: PrivateKey = data
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid identity file {:?}: {}", key_path, e))?;

        info!("loaded identity from {:?}", key_path);
        Ok(Self { private_key })
    }

    pub fn save(&self, path: Option<&PathBuf>) -> Result<()> {
        let base_path = path.cloned().unwrap_or_else(Self::default_path);
        fs::create_dir_all(&base_path).context("failed to create identity directory")?;

        let key_path = base_path.join(IDENTITY_FILE);
        fs::write(&key_path, self.private_key.to_base64())
            .context(format!("failed to write identity to {:?}", key_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&key_path, perms)?;
        }

        info!("saved identity to {:?}", key_path);
        Ok(())
    }

    pub fn load_or_generate(path: Option<&PathBuf>) -> Result<Self> {
        match Self::load(path) {
            Ok(id) => Ok(id),
            Err(_) => {
                info!("generating new identity");
                let id = Self::generate();
                id.save(path)?;
                Ok(id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_base64_roundtrip() {
        let key = PrivateKey::generate().public_key();
        let encoded = key.to_base64();
        let parsed: PublicKey = encoded.parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn rejects_wrong_length_keys() {
        assert!(matches!(
            "AAAA".parse::<PublicKey>(),
            Err(KeyParseError::Length(3))
        ));
        assert!("not base64!".parse::<PublicKey>().is_err());
    }

    #[test]
    fn derived_public_key_is_stable() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn identity_save_and_load() {
        let dir = std::env::temp_dir().join(format!("plexus-id-test-{}", std::process::id()));
        let id = Identity::generate();
        id.save(Some(&dir)).unwrap();

        let loaded = Identity::load(Some(&dir)).unwrap();
        assert_eq!(id.public_key(), loaded.public_key());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
