//! Payload sealing for the management transport and the per-pair
//! preshared-key derivation.
//!
//! Sealing uses crypto_box (X25519 + XSalsa20-Poly1305) keyed with the
//! tunnel keypairs themselves, so registration needs no extra key exchange
//! beyond fetching the server's public key.

use crypto_box::aead::Aead;
use crypto_box::{Nonce, PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::identity::{PrivateKey, PublicKey};

/// A payload sealed to one recipient. The nonce travels with the
/// ciphertext; the sender key lets the recipient derive the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub sender: PublicKey,
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

pub fn seal(
    plaintext: &[u8],
    recipient: &PublicKey,
    sender: &PrivateKey,
) -> Result<SealedEnvelope, CryptoError> {
    let salsa_box = SalsaBox::new(
        &BoxPublicKey::from(*recipient.as_bytes()),
        &BoxSecretKey::from(*sender.as_bytes()),
    );

    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = salsa_box
        .encrypt(&Nonce::from(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    Ok(SealedEnvelope {
        sender: sender.public_key(),
        nonce,
        ciphertext,
    })
}

pub fn open(envelope: &SealedEnvelope, recipient: &PrivateKey) -> Result<Vec<u8>, CryptoError> {
    let salsa_box = SalsaBox::new(
        &BoxPublicKey::from(*envelope.sender.as_bytes()),
        &BoxSecretKey::from(*recipient.as_bytes()),
    );

    salsa_box
        .decrypt(&Nonce::from(envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| CryptoError::Decrypt)
}

/// Derive the per-pair preshared key for the tunnel.
///
/// Hashes the two public keys in canonical (byte-lexicographic) order
/// together with the pair's current ICE ufrags, also sorted. Both peers
/// know all four values after the offer/answer exchange, so the result is
/// symmetric, and each renegotiation rotates the key with fresh ufrags.
pub fn preshared_key(
    local: &PublicKey,
    remote: &PublicKey,
    local_ufrag: &str,
    remote_ufrag: &str,
) -> [u8; 32] {
    let (lo_key, hi_key) = if local.as_bytes() <= remote.as_bytes() {
        (local, remote)
    } else {
        (remote, local)
    };
    let (lo_ufrag, hi_ufrag) = if local_ufrag <= remote_ufrag {
        (local_ufrag, remote_ufrag)
    } else {
        (remote_ufrag, local_ufrag)
    };

    let mut hasher = Sha256::new();
    hasher.update(lo_key.as_bytes());
    hasher.update(hi_key.as_bytes());
    hasher.update(lo_ufrag.as_bytes());
    hasher.update(hi_ufrag.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_roundtrip() {
        let server = PrivateKey::generate();
        let client = PrivateKey::generate();

        let envelope = seal(b"register me", &server.public_key(), &client).unwrap();
        assert_eq!(envelope.sender, client.public_key());

        let opened = open(&envelope, &server).unwrap();
        assert_eq!(opened, b"register me");
    }

    #[test]
    fn open_fails_with_wrong_key() {
        let server = PrivateKey::generate();
        let client = PrivateKey::generate();
        let stranger = PrivateKey::generate();

        let envelope = seal(b"register me", &server.public_key(), &client).unwrap();
        assert!(open(&envelope, &stranger).is_err());
    }

    #[test]
    fn preshared_key_is_symmetric() {
        let a = PrivateKey::generate().public_key();
        let b = PrivateKey::generate().public_key();

        let ours = preshared_key(&a, &b, "ufragA", "ufragB");
        let theirs = preshared_key(&b, &a, "ufragB", "ufragA");
        assert_eq!(ours, theirs);
    }

    #[test]
    fn preshared_key_rotates_with_ufrags() {
        let a = PrivateKey::generate().public_key();
        let b = PrivateKey::generate().public_key();

        let first = preshared_key(&a, &b, "one", "two");
        let second = preshared_key(&a, &b, "three", "four");
        assert_ne!(first, second);
    }
}
