//! Hybrid encryption for request and response payloads.
//!
//! Protocol: ephemeral secp256k1 ECDH → HKDF-SHA256 (empty salt, info
//! `"vin-ecies-v1"`) → AES-256-GCM. Only the X coordinate of the shared
//! point feeds the KDF. The envelope carries the ciphertext (tag appended,
//! base64), the 33-byte compressed ephemeral public key (hex) and the
//! 12-byte AES-GCM nonce (hex).
//!
//! Public keys crossing the wire are parsed as curve points before use and
//! rejected if not on-curve. `open` collapses every failure into a single
//! opaque error kind so callers cannot distinguish cryptographic failure
//! modes.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, prelude::BASE64_STANDARD};
use hkdf::Hkdf;
use k256::{PublicKey, SecretKey, ecdh::diffie_hellman, elliptic_curve::sec1::ToEncodedPoint};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// HKDF info string binding derived keys to this protocol version.
pub const ECIES_INFO: &[u8] = b"vin-ecies-v1";

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Compressed SEC1 secp256k1 public key length in bytes.
pub const PUBKEY_LEN: usize = 33;

/// The sealed form of a payload as it crosses the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// AES-256-GCM output including the authentication tag, base64.
    pub ciphertext: String,
    /// 33-byte compressed secp256k1 point, lowercase hex.
    pub ephemeral_pubkey: String,
    /// 12-byte AES-GCM nonce, lowercase hex.
    pub nonce: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("AEAD operation failed")]
    AeadFailed,
}

/// Generates a fresh secp256k1 secret key.
pub fn generate_secret() -> SecretKey {
    let mut rng = rand::rng();
    loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return secret;
        }
    }
}

/// Interprets 32 derived bytes as a secp256k1 scalar.
///
/// Fails on the (cryptographically negligible) chance the bytes are zero or
/// exceed the curve order; the caller treats that as a failed derivation.
pub fn secret_from_seed(seed: &[u8; 32]) -> Result<SecretKey, CryptoError> {
    SecretKey::from_slice(seed).map_err(|_| CryptoError::InvalidSecretKey)
}

/// Compressed SEC1 encoding of the public half of a secret key.
pub fn compressed_public(secret: &SecretKey) -> [u8; PUBKEY_LEN] {
    let point = secret.public_key().to_encoded_point(true);
    let mut out = [0u8; PUBKEY_LEN];
    out.copy_from_slice(point.as_bytes());
    out
}

/// Parses a 33-byte compressed secp256k1 public key, rejecting anything
/// that is not a valid curve point.
pub fn parse_public(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    if bytes.len() != PUBKEY_LEN {
        return Err(CryptoError::InvalidPublicKey);
    }
    PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Parses a hex-encoded compressed secp256k1 public key.
pub fn parse_public_hex(text: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(text).map_err(|_| CryptoError::InvalidPublicKey)?;
    parse_public(&bytes)
}

/// Seals a plaintext for a recipient public key.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
    let ephemeral = generate_secret();
    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    let cipher = derive_cipher(shared.raw_secret_bytes().as_slice());

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AeadFailed)?;

    Ok(EncryptedEnvelope {
        ciphertext: BASE64_STANDARD.encode(ciphertext),
        ephemeral_pubkey: hex::encode(compressed_public(&ephemeral)),
        nonce: hex::encode(nonce),
    })
}

/// Opens an envelope with the recipient's secret key.
///
/// Fails if the ephemeral key is not a curve point, the nonce is malformed
/// or the authentication tag does not verify. The error carries no detail.
pub fn open(recipient: &SecretKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = parse_public_hex(&envelope.ephemeral_pubkey)
        .map_err(|_| CryptoError::MalformedEnvelope)?;
    let nonce = hex::decode(&envelope.nonce).map_err(|_| CryptoError::MalformedEnvelope)?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::MalformedEnvelope);
    }
    let ciphertext = BASE64_STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|_| CryptoError::MalformedEnvelope)?;

    let shared = diffie_hellman(recipient.to_nonzero_scalar(), ephemeral.as_affine());
    let cipher = derive_cipher(shared.raw_secret_bytes().as_slice());
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| CryptoError::AeadFailed)
}

fn derive_cipher(shared_x: &[u8]) -> Aes256Gcm {
    let hk = Hkdf::<Sha256>::new(None, shared_x);
    let mut okm = [0u8; 32];
    hk.expand(ECIES_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let recipient = generate_secret();
        let public = parse_public(&compressed_public(&recipient)).unwrap();

        let envelope = seal(&public, b"confidential request").unwrap();
        assert_eq!(hex::decode(&envelope.nonce).unwrap().len(), NONCE_LEN);
        assert_eq!(
            hex::decode(&envelope.ephemeral_pubkey).unwrap().len(),
            PUBKEY_LEN
        );

        let plaintext = open(&recipient, &envelope).unwrap();
        assert_eq!(plaintext, b"confidential request");
    }

    #[test]
    fn wrong_key_fails() {
        let recipient = generate_secret();
        let public = parse_public(&compressed_public(&recipient)).unwrap();
        let envelope = seal(&public, b"secret").unwrap();

        let wrong = generate_secret();
        assert!(matches!(
            open(&wrong, &envelope),
            Err(CryptoError::AeadFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let recipient = generate_secret();
        let public = parse_public(&compressed_public(&recipient)).unwrap();
        let mut envelope = seal(&public, b"secret").unwrap();

        let mut raw = BASE64_STANDARD.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0x01;
        envelope.ciphertext = BASE64_STANDARD.encode(raw);
        assert!(open(&recipient, &envelope).is_err());
    }

    #[test]
    fn rejects_off_curve_points() {
        // x = 0 has no corresponding curve point for either parity prefix.
        let mut bogus = [0u8; PUBKEY_LEN];
        bogus[0] = 0x02;
        assert!(parse_public(&bogus).is_err());
        assert!(parse_public(&[0u8; 32]).is_err());
        assert!(parse_public_hex("zz").is_err());
    }

    #[test]
    fn malformed_nonce_fails() {
        let recipient = generate_secret();
        let public = parse_public(&compressed_public(&recipient)).unwrap();
        let mut envelope = seal(&public, b"secret").unwrap();
        envelope.nonce = "00ff".to_string();
        assert!(matches!(
            open(&recipient, &envelope),
            Err(CryptoError::MalformedEnvelope)
        ));
    }
}
