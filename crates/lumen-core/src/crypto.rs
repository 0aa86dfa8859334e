//! Cryptography service.
//!
//! The chain engine treats hashing and signatures as a black-box service
//! behind [`Cryptography`]. [`DefaultCryptography`] wires BLAKE3 digests and
//! secp256k1 ECDSA from audited dependencies; it implements nothing novel.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::types::CoreError;

/// A hex-encoded key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// SEC1-compressed public key, hex.
    pub public: String,
    /// Secret scalar, hex.
    pub private: String,
}

impl core::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Hash, sign, verify and key generation as consumed by the chain engine.
pub trait Cryptography: Send + Sync {
    /// Hex digest of `data`.
    fn hash(&self, data: &[u8]) -> String;

    /// Signature over `data` with a hex private key.
    fn sign(&self, data: &[u8], private_key: &str) -> Result<String, CoreError>;

    /// Whether `signature` is valid for `data` under `public_key`.
    ///
    /// Malformed keys or signatures verify as `false`.
    fn verify(&self, data: &[u8], signature: &str, public_key: &str) -> bool;

    /// Fresh random key pair.
    fn generate_key_pair(&self) -> KeyPair;
}

/// BLAKE3 + secp256k1 ECDSA.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCryptography;

impl Cryptography for DefaultCryptography {
    fn hash(&self, data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    fn sign(&self, data: &[u8], private_key: &str) -> Result<String, CoreError> {
        let bytes = hex::decode(private_key)?;
        let sk = SigningKey::from_slice(&bytes).map_err(|_| CoreError::InvalidKey("private key"))?;
        let sig: Signature = sk.sign(data);
        Ok(hex::encode(sig.to_bytes()))
    }

    fn verify(&self, data: &[u8], signature: &str, public_key: &str) -> bool {
        let (Ok(sig_bytes), Ok(pk_bytes)) = (hex::decode(signature), hex::decode(public_key)) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let Ok(vk) = VerifyingKey::from_sec1_bytes(&pk_bytes) else {
            return false;
        };
        vk.verify(data, &sig).is_ok()
    }

    fn generate_key_pair(&self) -> KeyPair {
        let sk = SigningKey::random(&mut OsRng);
        let public = hex::encode(sk.verifying_key().to_encoded_point(true).as_bytes());
        let private = hex::encode(sk.to_bytes());
        KeyPair { public, private }
    }
}

/// Random hex identifier of `len` bytes.
pub fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
