//! Node keypair resolution.
//!
//! Resolution order: TEE key-derivation service, then a configured key
//! file, then generate-and-persist, then ephemeral with a prominent
//! warning. Private key material stays in memory for the process lifetime
//! and is never serialized to logs, panics or error payloads.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use k256::SecretKey;
use rand::RngCore;
use std::path::Path;

use vin_core::{BoxError, canonical::b64url_encode, crypto};

use crate::tee::TeeAdapter;

/// TEE derivation path for the Ed25519 signing seed.
pub const SIGNING_DERIVATION_PATH: &str = "vin-signing-v1";

/// TEE derivation path for the secp256k1 encryption scalar.
pub const ENCRYPTION_DERIVATION_PATH: &str = "vin-encryption-v1";

/// The node's long-lived keys: Ed25519 for receipts, secp256k1 for the
/// hybrid encryption scheme.
pub struct NodeKeypair {
    signing: SigningKey,
    verifying: VerifyingKey,
    encryption: SecretKey,
    encryption_public: [u8; crypto::PUBKEY_LEN],
}

impl NodeKeypair {
    fn from_parts(signing_seed: [u8; 32], encryption: SecretKey) -> Self {
        let signing = SigningKey::from_bytes(&signing_seed);
        let verifying = signing.verifying_key();
        let encryption_public = crypto::compressed_public(&encryption);
        Self {
            signing,
            verifying,
            encryption,
            encryption_public,
        }
    }

    /// Resolves the node keys, trying the TEE first, then the key file.
    pub async fn resolve(tee: &TeeAdapter, key_path: Option<&Path>) -> Result<Self, BoxError> {
        if tee.available().await {
            let signing = tee.derive_key(SIGNING_DERIVATION_PATH).await;
            let encryption = tee.derive_key(ENCRYPTION_DERIVATION_PATH).await;
            if let (Some(signing), Some(encryption)) = (signing, encryption) {
                let seed = first_32(&signing).ok_or("TEE signing derivation too short")?;
                let scalar = first_32(&encryption).ok_or("TEE encryption derivation too short")?;
                let encryption = crypto::secret_from_seed(&scalar)
                    .map_err(|_| "TEE-derived bytes are not a valid secp256k1 scalar")?;
                log::info!("node keys derived from TEE key-derivation service");
                return Ok(Self::from_parts(seed, encryption));
            }
            log::warn!("TEE reported available but key derivation failed, falling back");
        }

        match key_path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                let keys = Self::generate();
                keys.persist(path)?;
                log::warn!("generated new node keys, persisted to {}", path.display());
                Ok(keys)
            }
            None => {
                log::warn!(
                    "EPHEMERAL NODE KEYS: no TEE and no key_path configured; \
                     node identity will change on restart"
                );
                Ok(Self::generate())
            }
        }
    }

    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_parts(seed, crypto::generate_secret())
    }

    /// Loads keys from a 64-byte hex file: signing seed then encryption
    /// scalar.
    pub fn load(path: &Path) -> Result<Self, BoxError> {
        let content = std::fs::read_to_string(path)?;
        let bytes = hex::decode(content.trim()).map_err(|_| "key file is not valid hex")?;
        if bytes.len() != 64 {
            return Err("key file must hold exactly 64 bytes".into());
        }
        let seed: [u8; 32] = bytes[..32].try_into().expect("length checked");
        let scalar: [u8; 32] = bytes[32..].try_into().expect("length checked");
        let encryption = crypto::secret_from_seed(&scalar)
            .map_err(|_| "key file encryption scalar is invalid")?;
        Ok(Self::from_parts(seed, encryption))
    }

    /// Persists as 64 hex-encoded bytes with owner-only permissions.
    pub fn persist(&self, path: &Path) -> Result<(), BoxError> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.signing.to_bytes());
        bytes.extend_from_slice(&self.encryption.to_bytes());
        let content = hex::encode(bytes);

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(content.as_bytes())?;
        }
        #[cfg(not(unix))]
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub fn signing(&self) -> &SigningKey {
        &self.signing
    }

    pub fn encryption(&self) -> &SecretKey {
        &self.encryption
    }

    /// Base64url Ed25519 public key, the node identity in receipts.
    pub fn node_pubkey(&self) -> String {
        b64url_encode(self.verifying.as_bytes())
    }

    /// Lowercase hex compressed secp256k1 public key clients seal to.
    pub fn encryption_pubkey_hex(&self) -> String {
        hex::encode(self.encryption_public)
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("node_pubkey", &self.node_pubkey())
            .field("encryption_pubkey", &self.encryption_pubkey_hex())
            .finish()
    }
}

fn first_32(bytes: &[u8]) -> Option<[u8; 32]> {
    bytes.get(..32)?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("vin-keys-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.key");
        let _ = std::fs::remove_file(&path);

        let keys = NodeKeypair::generate();
        keys.persist(&path).unwrap();
        let loaded = NodeKeypair::load(&path).unwrap();
        assert_eq!(keys.node_pubkey(), loaded.node_pubkey());
        assert_eq!(keys.encryption_pubkey_hex(), loaded.encryption_pubkey_hex());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn debug_never_exposes_secrets() {
        let keys = NodeKeypair::generate();
        let formatted = format!("{:?}", keys);
        assert!(!formatted.contains(&hex::encode(keys.encryption.to_bytes())));
        assert!(!formatted.contains(&hex::encode(keys.signing.to_bytes())));
    }

    #[test]
    fn rejects_malformed_key_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("vin-bad-key-{}", std::process::id()));
        std::fs::write(&path, "not-hex").unwrap();
        assert!(NodeKeypair::load(&path).is_err());
        std::fs::write(&path, hex::encode([1u8; 16])).unwrap();
        assert!(NodeKeypair::load(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
