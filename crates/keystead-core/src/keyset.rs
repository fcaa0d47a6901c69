//! Persisted key-set records.
//!
//! A `KeySetRecord` is one wrapped copy of a volume secret: a fixed-size
//! binary header (magic, format version, algorithm identifiers, KDF costs,
//! salt, nonce) followed by the AEAD ciphertext of the sealed payload.
//! Records are installed only via write-temp-then-rename, so a crash during
//! Setup or Rewrap never leaves a partial file and the previous record stays
//! intact until the new one is fully written.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{
    self, KdfParams, CIPHER_XCHACHA20_POLY1305, KDF_ARGON2ID, NONCE_LEN, SALT_LEN, SECRET_LEN,
};
use crate::error::{Error, Result};

pub const KEYSET_MAGIC: &[u8] = b"KSTD01\0\0";
pub const KEYSET_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;

const KEYSET_AAD: &[u8] = b"keystead-keyset-v1";

/// Plaintext payload sealed inside a record. Both credential paths of a
/// volume wrap byte-identical payloads. The key material is wiped when the
/// payload drops.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeySetPayload {
    /// Volume secret (SDEK), base64.
    pub secret: String,
    /// Ed25519 device signing key, base64. Created once at Setup and
    /// carried unchanged through every rewrap.
    pub signing_key: String,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl KeySetPayload {
    pub fn new(secret: &[u8], signing_key: &SigningKey, created_at: DateTime<Utc>) -> Self {
        Self {
            secret: general_purpose::STANDARD.encode(secret),
            signing_key: general_purpose::STANDARD.encode(signing_key.to_bytes()),
            created_at,
        }
    }

    pub fn secret_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = general_purpose::STANDARD
            .decode(&self.secret)
            .map_err(|e| Error::Crypto(format!("decode secret: {e}")))?;
        if bytes.len() != SECRET_LEN {
            return Err(Error::Crypto("secret length invalid".into()));
        }
        Ok(Zeroizing::new(bytes))
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        let bytes = general_purpose::STANDARD
            .decode(&self.signing_key)
            .map_err(|e| Error::Crypto(format!("decode signing key: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("signing key length invalid".into()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }
}

#[derive(Debug, Clone)]
pub struct KeySetHeader {
    pub format_version: u32,
    pub kdf_id: u32,
    pub cipher_id: u32,
    pub kdf_params: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl KeySetHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(KEYSET_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kdf_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.cipher_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf_params.time_cost.to_le_bytes());
        buf[24..28].copy_from_slice(&self.kdf_params.memory_cost.to_le_bytes());
        buf[28..32].copy_from_slice(&self.kdf_params.parallelism.to_le_bytes());
        buf[32..64].copy_from_slice(&self.salt);
        buf[64..88].copy_from_slice(&self.nonce);
        // remaining bytes stay zero
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE {
            return Err(Error::Crypto("invalid key-set header size".into()));
        }
        if &buf[..8] != KEYSET_MAGIC {
            return Err(Error::Crypto("invalid key-set magic".into()));
        }
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let format_version = u32_at(8);
        if format_version != KEYSET_VERSION {
            return Err(Error::UnsupportedAlgorithm {
                kind: "key-set format",
                id: format_version,
            });
        }
        Ok(Self {
            format_version,
            kdf_id: u32_at(12),
            cipher_id: u32_at(16),
            kdf_params: KdfParams {
                time_cost: u32_at(20),
                memory_cost: u32_at(24),
                parallelism: u32_at(28),
            },
            salt: buf[32..64].try_into().unwrap(),
            nonce: buf[64..88].try_into().unwrap(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeySetRecord {
    pub header: KeySetHeader,
    pub ciphertext: Vec<u8>,
}

impl KeySetRecord {
    /// Seal `payload` under a credential with fresh salt and nonce.
    pub fn seal(credential: &[u8], payload: &KeySetPayload, params: KdfParams) -> Result<Self> {
        let salt = crypto::generate_salt();
        let nonce = crypto::generate_nonce();
        let kek = crypto::derive_key(credential, &salt, params)?;
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let ciphertext = crypto::encrypt(&kek, &nonce, &plaintext, KEYSET_AAD)?;
        Ok(Self {
            header: KeySetHeader {
                format_version: KEYSET_VERSION,
                kdf_id: KDF_ARGON2ID,
                cipher_id: CIPHER_XCHACHA20_POLY1305,
                kdf_params: params,
                salt,
                nonce,
            },
            ciphertext,
        })
    }

    /// Unseal the payload with a credential.
    ///
    /// Unknown algorithm identifiers are rejected before any key derivation;
    /// an authentication failure maps to the single generic
    /// `InvalidCredential`.
    pub fn open(&self, credential: &[u8]) -> Result<KeySetPayload> {
        if self.header.kdf_id != KDF_ARGON2ID {
            return Err(Error::UnsupportedAlgorithm {
                kind: "KDF",
                id: self.header.kdf_id,
            });
        }
        if self.header.cipher_id != CIPHER_XCHACHA20_POLY1305 {
            return Err(Error::UnsupportedAlgorithm {
                kind: "cipher",
                id: self.header.cipher_id,
            });
        }
        let kek = crypto::derive_key(credential, &self.header.salt, self.header.kdf_params)?;
        let plaintext = crypto::decrypt(&kek, &self.header.nonce, &self.ciphertext, KEYSET_AAD)?;
        let payload: KeySetPayload =
            serde_json::from_slice(&plaintext).map_err(|_| Error::InvalidCredential)?;
        Ok(payload)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = KeySetHeader::from_bytes(&header_buf)?;
        let mut ciphertext = Vec::new();
        file.read_to_end(&mut ciphertext)?;
        Ok(Self { header, ciphertext })
    }

    /// Install the record at `path` via write-temp-then-rename with strict
    /// permissions. The prior record, if any, survives any failure before
    /// the final rename.
    pub fn store(&self, path: &Path) -> Result<()> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        write_atomic(path, &bytes)
    }
}

/// Write `bytes` to `path` atomically: temp file in the destination
/// directory, fsync, rename over the target, fsync the directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Crypto("destination has no parent directory".into()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    use std::io::Write;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path).map_err(|e| Error::Storage(e.error))?;
    fsync_dir(parent)?;
    Ok(())
}

pub fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
