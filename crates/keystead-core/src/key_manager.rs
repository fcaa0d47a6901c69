//! Key lifecycle manager for the post-auth volume secret.
//!
//! State machine: `Uninitialized → Initialized+Locked ⇄ Unlocked`. The
//! unsealed secret exists in memory exactly while the manager is unlocked
//! and is zeroed on lock. Two independent credential paths — the admin
//! password and the recovery phrase — each have their own persisted record
//! wrapping the identical payload.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::KdfParams;
use crate::error::{Error, Result};
use crate::keyset::{KeySetPayload, KeySetRecord};

pub const PASSWORD_RECORD_FILE: &str = "keyset-password.dat";
pub const RECOVERY_RECORD_FILE: &str = "keyset-recovery.dat";

/// Which credential path unsealed the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialPath {
    Password,
    Recovery,
}

impl CredentialPath {
    fn record_file(self) -> &'static str {
        match self {
            CredentialPath::Password => PASSWORD_RECORD_FILE,
            CredentialPath::Recovery => RECOVERY_RECORD_FILE,
        }
    }
}

#[derive(Default)]
struct Inner {
    secret: Option<Zeroizing<Vec<u8>>>,
    signing_key: Option<SigningKey>,
    unlocked_via: Option<CredentialPath>,
    created_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn clear(&mut self) {
        // Zeroizing buffers wipe on drop.
        self.secret = None;
        self.signing_key = None;
        self.unlocked_via = None;
        self.created_at = None;
    }
}

pub struct KeyManager {
    dir: PathBuf,
    params: KdfParams,
    inner: RwLock<Inner>,
}

impl KeyManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self::with_params(dir, KdfParams::default())
    }

    pub fn with_params(dir: impl AsRef<Path>, params: KdfParams) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            params,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn record_path(&self, path: CredentialPath) -> PathBuf {
        self.dir.join(path.record_file())
    }

    /// Create the volume secret and both credential records. Returns the
    /// recovery phrase, shown to the operator exactly once. Leaves the
    /// manager locked.
    pub fn setup(&self, password: &str) -> Result<Zeroizing<String>> {
        let _guard = self.inner.write();
        if password.is_empty() {
            return Err(Error::InvalidInput("password must not be empty"));
        }
        // Only the password record marks the device initialized; an orphan
        // recovery record from an interrupted setup is simply overwritten.
        if self.record_path(CredentialPath::Password).exists() {
            return Err(Error::AlreadyInitialized);
        }

        let secret = crate::crypto::generate_secret();
        let signing_key = crate::crypto::generate_signing_key();
        let payload = KeySetPayload::new(&secret, &signing_key, Utc::now());

        let phrase = generate_recovery_phrase();
        let recovery_record = KeySetRecord::seal(phrase.as_bytes(), &payload, self.params)?;
        let password_record = KeySetRecord::seal(password.as_bytes(), &payload, self.params)?;

        // Recovery first, password last: installing the password record is
        // the commit point, so a crash in between leaves the device
        // uninitialized and setup can be re-run.
        recovery_record.store(&self.record_path(CredentialPath::Recovery))?;
        password_record.store(&self.record_path(CredentialPath::Password))?;

        info!("key set initialized");
        Ok(phrase)
    }

    pub fn unlock(&self, password: &str) -> Result<()> {
        self.unlock_via(password.as_bytes(), CredentialPath::Password)
    }

    pub fn unlock_with_recovery(&self, phrase: &str) -> Result<()> {
        self.unlock_via(phrase.as_bytes(), CredentialPath::Recovery)
    }

    /// Read-only on failure; callers may retry freely.
    fn unlock_via(&self, credential: &[u8], path: CredentialPath) -> Result<()> {
        // The password record is the initialization marker; without it any
        // other record on disk is setup debris, not a credential.
        if !self.record_path(CredentialPath::Password).exists() {
            return Err(Error::NotInitialized);
        }
        let record_path = self.record_path(path);
        if !record_path.exists() {
            return Err(Error::NotInitialized);
        }
        let record = KeySetRecord::load(&record_path)?;
        let payload = record.open(credential)?;

        let mut inner = self.inner.write();
        inner.secret = Some(payload.secret_bytes()?);
        inner.signing_key = Some(payload.signing_key()?);
        inner.unlocked_via = Some(path);
        inner.created_at = Some(payload.created_at);
        info!(via = ?path, "key set unlocked");
        Ok(())
    }

    /// Zero and release the in-memory secret. Idempotent, always succeeds.
    pub fn lock(&self) {
        let mut inner = self.inner.write();
        if inner.secret.is_some() {
            info!("key set locked");
        }
        inner.clear();
    }

    /// Reseal the unchanged payload under a new password with fresh salt and
    /// nonce, replacing the password record atomically. The recovery record
    /// keeps its original wrapping; both continue to unwrap the same secret.
    pub fn rewrap_unlocked(&self, new_password: &str) -> Result<()> {
        let inner = self.inner.write();
        if new_password.is_empty() {
            return Err(Error::InvalidInput("password must not be empty"));
        }
        let secret = inner
            .secret
            .as_ref()
            .ok_or(Error::InvalidState("rewrap requires an unlocked key set"))?;
        let signing_key = inner
            .signing_key
            .as_ref()
            .ok_or(Error::InvalidState("rewrap requires an unlocked key set"))?;
        let created_at = inner
            .created_at
            .ok_or(Error::InvalidState("rewrap requires an unlocked key set"))?;

        let payload = KeySetPayload::new(secret, signing_key, created_at);
        let record = KeySetRecord::seal(new_password.as_bytes(), &payload, self.params)?;
        record.store(&self.record_path(CredentialPath::Password))?;
        info!("password wrapping replaced");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        let _guard = self.inner.read();
        self.record_path(CredentialPath::Password).exists()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.read().secret.is_none()
    }

    pub fn unlocked_via(&self) -> Option<CredentialPath> {
        self.inner.read().unlocked_via
    }

    /// Hand the secret to a seal/unseal or storage-handoff operation by
    /// exclusive borrow. The closure must not copy the bytes out.
    pub fn with_secret<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let inner = self.inner.read();
        let secret = inner
            .secret
            .as_ref()
            .ok_or(Error::InvalidState("key set is locked"))?;
        Ok(f(secret))
    }

    /// Device signing key, available only while unlocked.
    pub fn signing_key(&self) -> Result<SigningKey> {
        let inner = self.inner.read();
        inner
            .signing_key
            .clone()
            .ok_or(Error::InvalidState("key set is locked"))
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        // Best-effort zeroing on shutdown.
        self.inner.write().clear();
    }
}

/// Human-typable recovery phrase: eight groups of five characters from an
/// unambiguous alphabet (no 0/O, 1/l/i), ~198 bits of entropy.
pub fn generate_recovery_phrase() -> Zeroizing<String> {
    const ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
    let mut rng = rand::rngs::OsRng;
    let mut phrase = String::with_capacity(47);
    for group in 0..8 {
        if group > 0 {
            phrase.push('-');
        }
        for _ in 0..5 {
            let idx = rng.gen_range(0..ALPHABET.len());
            phrase.push(ALPHABET[idx] as char);
        }
    }
    Zeroizing::new(phrase)
}
