//! Cryptographic primitives the fabric depends on: AES-256-GCM sealing,
//! RSA-4096 asymmetric encryption and signatures, SHA-256 hashing, and
//! Merkle roots over canonically-serialized transactions.
//!
//! These are pure functions over bytes; nothing here touches the network,
//! the ledger, or node state.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

pub const RSA_KEY_BITS: usize = 4096;
pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const GCM_NONCE_LEN: usize = 12;

pub type Hash = [u8; 32];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD authentication failed, ciphertext or tag corrupted")]
    AuthFailure,
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),
    #[error("RSA-OAEP encryption failed: {0}")]
    AsymEncrypt(String),
    #[error("RSA-OAEP decryption failed: {0}")]
    AsymDecrypt(String),
    #[error("RSA-PSS signing failed: {0}")]
    Sign(String),
    #[error("invalid PEM key material: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// 32 uniformly random bytes from the OS CSPRNG, used as an AES-256 key.
pub fn generate_symmetric_key() -> [u8; SYMMETRIC_KEY_LEN] {
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// A sealed (authenticated-encryption) blob, wire-representable per the
/// fabric's frame encoding: hex ciphertext/iv/tag plus an algorithm tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedBlob {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub algorithm: String,
}

const AES_GCM_TAG_LEN: usize = 16;
const AES_GCM_ALGO: &str = "AES-256-GCM";

/// Seal `plaintext` under `key` with a fresh random 12-byte nonce.
/// Authenticated encryption; fails only if the OS RNG cannot be read.
pub fn seal(plaintext: &[u8], key: &[u8; SYMMETRIC_KEY_LEN]) -> Result<SealedBlob> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv_bytes = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);

    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::AuthFailure)?;
    let tag_offset = sealed.len() - AES_GCM_TAG_LEN;
    let tag = sealed.split_off(tag_offset);

    Ok(SealedBlob {
        ciphertext: hex::encode(sealed),
        iv: hex::encode(iv_bytes),
        tag: hex::encode(tag),
        algorithm: AES_GCM_ALGO.to_string(),
    })
}

/// Open a sealed blob. Fails with `AuthFailure` on tag mismatch or corrupted
/// ciphertext/iv; never returns partial plaintext.
pub fn open(sealed: &SealedBlob, key: &[u8; SYMMETRIC_KEY_LEN]) -> Result<Vec<u8>> {
    let iv = hex::decode(&sealed.iv).map_err(|_| CryptoError::AuthFailure)?;
    let ciphertext = hex::decode(&sealed.ciphertext).map_err(|_| CryptoError::AuthFailure)?;
    let tag = hex::decode(&sealed.tag).map_err(|_| CryptoError::AuthFailure)?;
    if iv.len() != GCM_NONCE_LEN || tag.len() != AES_GCM_TAG_LEN {
        return Err(CryptoError::AuthFailure);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&iv);
    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);

    cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| CryptoError::AuthFailure)
}

/// RSA-4096 asymmetric keypair, PEM-serializable (PKCS#8 private,
/// SubjectPublicKeyInfo public) per the fabric's wire representation.
pub struct Keypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl Keypair {
    /// Generates a fresh RSA-4096 keypair (public exponent 65537). This is
    /// the one crypto call worth pushing to a blocking thread: it can take
    /// tens of milliseconds.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.public
            .to_public_key_pem(Default::default())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn private_key_pem(&self) -> Result<String> {
        self.private
            .to_pkcs8_pem(Default::default())
            .map(|z| z.to_string())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn from_pem(private_pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Sign `message` with RSA-PSS/SHA-256, MGF1-SHA-256, max salt length.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signing_key = rsa::pss::SigningKey::<Sha256>::new(self.private.clone());
        let mut rng = rand::rngs::OsRng;
        let signature = signing_key.try_sign_with_rng(&mut rng, message);
        signature
            .map(|s| s.to_vec())
            .map_err(|e| CryptoError::Sign(e.to_string()))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }
}

/// Parse a PEM-encoded SubjectPublicKeyInfo public key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// RSA-OAEP (SHA-256 MGF1) encrypt. `plaintext` must fit the key size minus
/// OAEP overhead; larger payloads should be hybrid-encrypted with `seal`.
pub fn asym_encrypt(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;
    let padding = Oaep::new::<Sha256>();
    public_key
        .encrypt(&mut rng, padding, plaintext)
        .map_err(|e| CryptoError::AsymEncrypt(e.to_string()))
}

/// RSA-OAEP (SHA-256 MGF1) decrypt.
pub fn asym_decrypt(ciphertext: &[u8], keypair: &Keypair) -> Result<Vec<u8>> {
    let padding = Oaep::new::<Sha256>();
    keypair
        .private
        .decrypt(padding, ciphertext)
        .map_err(|e| CryptoError::AsymDecrypt(e.to_string()))
}

/// Verify an RSA-PSS/SHA-256 signature. Never panics; always returns a bool.
pub fn verify(message: &[u8], signature: &[u8], public_key: &RsaPublicKey) -> bool {
    let verifying_key = rsa::pss::VerifyingKey::<Sha256>::new(public_key.clone());
    let Ok(sig) = rsa::pss::Signature::try_from(signature) else {
        return false;
    };
    verifying_key.verify(message, &sig).is_ok()
}

/// SHA-256 digest of arbitrary bytes.
pub fn sha256(data: &[u8]) -> Hash {
    let digest = sha2::Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn sha256_concat(left: &Hash, right: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(left);
    buf.extend_from_slice(right);
    sha256(&buf)
}

/// Merkle root over ordered, canonically-serialized transaction bytes.
/// Empty input hashes to `Hash("")`; an odd trailing leaf is duplicated
/// before pairing. Order of transactions matters.
pub fn merkle_root(tx_bytes: &[Vec<u8>]) -> Hash {
    if tx_bytes.is_empty() {
        return sha256(b"");
    }

    let mut level: Vec<Hash> = tx_bytes.iter().map(|tx| sha256(tx)).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let combined = if pair.len() == 2 {
                sha256_concat(&pair[0], &pair[1])
            } else {
                sha256_concat(&pair[0], &pair[0])
            };
            next.push(combined);
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trip() {
        let key = generate_symmetric_key();
        let plaintext = b"move to grid reference niner-six";
        let sealed = seal(plaintext, &key).unwrap();
        let opened = open(&sealed, &key).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn aead_tamper_detected() {
        let key = generate_symmetric_key();
        let sealed = seal(b"hello", &key).unwrap();
        let mut tampered = sealed.clone();
        let mut raw = hex::decode(&tampered.ciphertext).unwrap();
        raw[0] ^= 0x01;
        tampered.ciphertext = hex::encode(raw);
        assert!(matches!(
            open(&tampered, &key),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn signature_round_trip() {
        let keypair = Keypair::generate().unwrap();
        let msg = b"authenticate this order";
        let sig = keypair.sign(msg).unwrap();
        assert!(verify(msg, &sig, keypair.public_key()));
        assert!(!verify(b"authenticate this orde!", &sig, keypair.public_key()));
    }

    #[test]
    fn merkle_empty_is_hash_of_empty_string() {
        assert_eq!(merkle_root(&[]), sha256(b""));
    }

    #[test]
    fn merkle_single_leaf_is_itself() {
        let leaf = b"only-tx".to_vec();
        assert_eq!(merkle_root(&[leaf.clone()]), sha256(&leaf));
    }

    #[test]
    fn merkle_changes_with_any_leaf() {
        let a = merkle_root(&[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        let b = merkle_root(&[b"one".to_vec(), b"two".to_vec(), b"three!".to_vec()]);
        assert_ne!(a, b);
    }
}
