//! Cryptographic primitives shared by the core.
//!
//! Key derivation is Argon2id with explicit cost parameters; the costs in
//! force at seal time are persisted next to the wrapped secret so a future
//! unlock always re-derives with the original parameters. Sealing is
//! XChaCha20-Poly1305 with a fresh 24-byte nonce per seal operation.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const SECRET_LEN: usize = 32;
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Algorithm identifiers persisted in key-set records. Unknown identifiers
/// are rejected on read, never silently downgraded.
pub const KDF_ARGON2ID: u32 = 1;
pub const CIPHER_XCHACHA20_POLY1305: u32 = 1;

/// Argon2id cost parameters, persisted alongside every sealed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
        }
    }
}

/// Derive a 32-byte key-encryption key from a credential and salt.
pub fn derive_key(credential: &[u8], salt: &[u8], params: KdfParams) -> Result<Zeroizing<Vec<u8>>> {
    let params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| Error::Crypto(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    argon
        .hash_password_into(credential, salt, &mut key)
        .map_err(|e| Error::Crypto(format!("argon2 derive: {e}")))?;
    Ok(key)
}

pub fn encrypt(key: &[u8], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("encrypt: {e}")))
}

/// Open an authenticated ciphertext. A failed tag check is reported as
/// `InvalidCredential`: the caller cannot tell a wrong key apart from a
/// corrupted ciphertext.
pub fn decrypt(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| Error::InvalidCredential)?;
    Ok(Zeroizing::new(plaintext))
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Generate a fresh volume secret (SDEK).
pub fn generate_secret() -> Zeroizing<Vec<u8>> {
    let mut secret = Zeroizing::new(vec![0u8; SECRET_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

pub fn sign_bytes(key: &SigningKey, bytes: &[u8]) -> Signature {
    key.sign(bytes)
}

pub fn verify_signature(public: &VerifyingKey, bytes: &[u8], sig: &Signature) -> Result<()> {
    public
        .verify(bytes, sig)
        .map_err(|e| Error::Crypto(format!("signature verify failed: {e}")))
}

/// BLAKE3 hex digest of `data`.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Derive a purpose-bound subkey from a volume secret. Context strings are
/// compile-time constants; two contexts never collide.
pub fn derive_subkey(context: &str, secret: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(blake3::derive_key(context, secret).to_vec())
}
