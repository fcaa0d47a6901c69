//! Dual-volume orchestration across the two trust phases.
//!
//! Boot: a hardware sealer (when present) releases the pre-auth volume
//! secret without user input; the storage subsystem receives a restricted
//! key and serves bounded pre-auth duties. After the admin authenticates,
//! the post-auth secret is unwrapped, the second volume mounts, and the
//! storage subsystem pivots to full mode, replaying anything journaled
//! while restricted.
//!
//! Without a hardware sealer the pre-auth phase does not exist: the
//! pre-auth secret is wrapped under the post-auth secret instead, both
//! volumes are gated by the admin credential, and restricted-mode
//! functionality is unavailable by design.

use std::path::PathBuf;

use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, KdfParams, NONCE_LEN};
use crate::error::{Error, Result};
use crate::integrity::{Checkpoint, IntegrityAlert, IntegrityChecker};
use crate::key_manager::KeyManager;
use crate::keyset::write_atomic;
use crate::sealer::HardwareSealer;
use crate::volume::{VolumeHandle, VolumeKind, VolumeSet};

pub const PREAUTH_SEAL_FILE: &str = "preauth.seal";
pub const PREAUTH_WRAPPED_FILE: &str = "preauth.wrapped";
pub const INTEGRITY_STATE_FILE: &str = "integrity.json";

const CTX_PREAUTH_WRAP: &str = "keystead v1 preauth sdek wrap";
const PREAUTH_AAD: &[u8] = b"keystead-preauth-v1";

/// Outcome of the boot phase.
#[derive(Debug)]
pub enum BootOutcome {
    /// Pre-auth volume mounted; storage subsystem is in restricted mode.
    Restricted { alerts: Vec<IntegrityAlert> },
    /// No hardware sealer (or nothing provisioned for it); nothing mounts
    /// until the admin authenticates.
    AwaitingAdmin { alerts: Vec<IntegrityAlert> },
}

/// Storage-subsystem handoff, consumed by the orchestrator at each phase
/// transition. The subsystem replays its restricted-mode journal when it
/// receives `pivot_full`.
pub trait StorageHandoff: Send + Sync {
    fn enter_restricted(&self, key: &[u8]) -> Result<()>;
    fn pivot_full(&self, key: &[u8]) -> Result<()>;
}

/// Persisted form of the hardware-sealed pre-auth secret, tagged with the
/// policy digest it was sealed under.
#[derive(Debug, Serialize, Deserialize)]
struct SealedPreAuth {
    policy: String,
    blob: String,
}

struct Phases {
    preauth: VolumeHandle,
    postauth: VolumeHandle,
}

pub struct DualVolumeOrchestrator {
    data_dir: PathBuf,
    volumes: VolumeSet,
    key_manager: KeyManager,
    integrity: IntegrityChecker,
    sealer: Option<Box<dyn HardwareSealer>>,
    phases: Mutex<Phases>,
}

impl DualVolumeOrchestrator {
    pub fn new(data_dir: impl Into<PathBuf>, sealer: Option<Box<dyn HardwareSealer>>) -> Result<Self> {
        Self::with_params(data_dir, sealer, KdfParams::default())
    }

    pub fn with_params(
        data_dir: impl Into<PathBuf>,
        sealer: Option<Box<dyn HardwareSealer>>,
        params: KdfParams,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        if data_dir.join(crate::export::IMPORT_PENDING_DIR).exists() {
            warn!("unfinished import found; completing it before startup");
            crate::export::apply_pending_import(&data_dir)?;
        }
        let volumes = VolumeSet::new(data_dir.join("volumes"));
        volumes.ensure_layout()?;
        let key_manager = KeyManager::with_params(&data_dir, params);
        let integrity =
            IntegrityChecker::new(volumes.clone(), data_dir.join(INTEGRITY_STATE_FILE))?;
        Ok(Self {
            data_dir,
            volumes,
            key_manager,
            integrity,
            sealer,
            phases: Mutex::new(Phases {
                preauth: VolumeHandle::unmounted(VolumeKind::PreAuth),
                postauth: VolumeHandle::unmounted(VolumeKind::PostAuth),
            }),
        })
    }

    pub fn volumes(&self) -> &VolumeSet {
        &self.volumes
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.key_manager
    }

    pub fn integrity(&self) -> &IntegrityChecker {
        &self.integrity
    }

    pub fn sealer(&self) -> Option<&dyn HardwareSealer> {
        self.sealer.as_deref()
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    pub fn handle(&self, kind: VolumeKind) -> VolumeHandle {
        let phases = self.phases.lock();
        match kind {
            VolumeKind::PreAuth => phases.preauth.clone(),
            VolumeKind::PostAuth => phases.postauth.clone(),
        }
    }

    /// First-time setup: create the post-auth key set, generate the
    /// pre-auth volume secret and persist its wrappings. Returns the
    /// recovery phrase. Leaves everything locked.
    pub fn provision(&self, password: &str) -> Result<Zeroizing<String>> {
        let phrase = self.key_manager.setup(password)?;
        self.key_manager.unlock(password)?;
        let result: Result<()> = (|| {
            let preauth = crypto::generate_secret();
            self.write_preauth_wrapped(&preauth)?;
            if let Some(sealer) = self.sealer.as_deref() {
                self.write_preauth_sealed(sealer, &preauth)?;
            } else {
                warn!("no hardware sealer: pre-auth phase disabled; both volumes gated by the admin credential");
            }
            self.integrity.refresh(VolumeKind::PreAuth)?;
            self.integrity.refresh(VolumeKind::PostAuth)?;
            Ok(())
        })();
        self.key_manager.lock();
        result?;
        info!("device provisioned");
        Ok(phrase)
    }

    /// Boot-time phase. With a hardware sealer the pre-auth volume mounts
    /// and the storage subsystem enters restricted mode; otherwise nothing
    /// mounts until `unlock`.
    pub fn boot(&self, handoff: &dyn StorageHandoff) -> Result<BootOutcome> {
        let alerts = self.integrity.check_all(Checkpoint::Boot)?;

        let sealer = match self.sealer.as_deref() {
            Some(s) => s,
            None => {
                info!("boot: no hardware sealer; awaiting admin authentication");
                return Ok(BootOutcome::AwaitingAdmin { alerts });
            }
        };
        let seal_path = self.data_dir.join(PREAUTH_SEAL_FILE);
        if !seal_path.exists() {
            return Err(Error::NotInitialized);
        }

        let sealed: SealedPreAuth = serde_json::from_slice(&std::fs::read(&seal_path)?)?;
        if sealed.policy != sealer.policy_digest() {
            return Err(Error::Sealer(
                "pre-auth secret is sealed for a different hardware policy; re-seal required"
                    .into(),
            ));
        }
        let blob = general_purpose::STANDARD
            .decode(&sealed.blob)
            .map_err(|e| Error::Sealer(format!("decode sealed blob: {e}")))?;
        let secret = sealer.unseal(&blob)?;

        handoff.enter_restricted(&secret)?;
        {
            let mut phases = self.phases.lock();
            phases.preauth.mounted = true;
            phases.preauth.unlocked_via = None;
            phases.preauth.last_verified_hash = self.integrity.recorded_hash(VolumeKind::PreAuth);
        }
        info!("boot: pre-auth volume mounted, storage in restricted mode");
        Ok(BootOutcome::Restricted { alerts })
    }

    /// Admin authentication: unwrap the post-auth secret, mount what
    /// remains, and pivot the storage subsystem to full mode.
    pub fn unlock(&self, password: &str, handoff: &dyn StorageHandoff) -> Result<Vec<IntegrityAlert>> {
        self.key_manager.unlock(password)?;
        self.finish_unlock(handoff)
    }

    pub fn unlock_with_recovery(
        &self,
        phrase: &str,
        handoff: &dyn StorageHandoff,
    ) -> Result<Vec<IntegrityAlert>> {
        self.key_manager.unlock_with_recovery(phrase)?;
        self.finish_unlock(handoff)
    }

    fn finish_unlock(&self, handoff: &dyn StorageHandoff) -> Result<Vec<IntegrityAlert>> {
        let alerts = self.integrity.check_all(Checkpoint::Unlock)?;

        // TPM-less fallback: the pre-auth volume only becomes readable now.
        // Its key is delivered immediately before the pivot; no restricted
        // window ever runs.
        let preauth_mounted = self.handle(VolumeKind::PreAuth).mounted;
        if !preauth_mounted {
            let preauth = self.unwrap_preauth_with_master()?;
            handoff.enter_restricted(&preauth)?;
            let mut phases = self.phases.lock();
            phases.preauth.mounted = true;
            phases.preauth.unlocked_via = self.key_manager.unlocked_via();
            phases.preauth.last_verified_hash = self.integrity.recorded_hash(VolumeKind::PreAuth);
        }

        self.key_manager.with_secret(|key| handoff.pivot_full(key))??;
        {
            let mut phases = self.phases.lock();
            phases.postauth.mounted = true;
            phases.postauth.unlocked_via = self.key_manager.unlocked_via();
            phases.postauth.last_verified_hash =
                self.integrity.recorded_hash(VolumeKind::PostAuth);
        }
        info!("post-auth volume mounted, storage pivoted to full mode");
        Ok(alerts)
    }

    /// Zero the post-auth secret and unmount whatever its credential gated.
    pub fn lock(&self) {
        let tpmless = self.sealer.is_none();
        self.key_manager.lock();
        let mut phases = self.phases.lock();
        phases.postauth = VolumeHandle::unmounted(VolumeKind::PostAuth);
        if tpmless {
            phases.preauth = VolumeHandle::unmounted(VolumeKind::PreAuth);
        }
    }

    /// Storage-subsystem change notification. Pre-auth content changes
    /// re-seal immediately; either way the recorded integrity hash is
    /// refreshed so exports reflect current state.
    pub fn volume_changed(&self, kind: VolumeKind) -> Result<()> {
        if kind == VolumeKind::PreAuth && self.sealer.is_some() {
            self.reseal_preauth()?;
        }
        self.integrity.refresh(kind)?;
        Ok(())
    }

    /// Re-bind the pre-auth secret to the sealer's current policy. Required
    /// after restoring onto different hardware and run before every export;
    /// also called whenever pre-auth contents rotate.
    pub fn reseal_preauth(&self) -> Result<()> {
        let sealer = self
            .sealer
            .as_deref()
            .ok_or(Error::InvalidState("no hardware sealer to re-seal against"))?;
        let secret = self.preauth_secret()?;
        self.write_preauth_sealed(sealer, &secret)?;
        self.integrity.refresh(VolumeKind::PreAuth)?;
        info!(policy = %sealer.policy_digest(), "pre-auth secret re-sealed");
        Ok(())
    }

    /// Recover the pre-auth secret plaintext: via the hardware sealer when
    /// its policy matches, otherwise via the master-wrapped copy (which
    /// requires the key manager to be unlocked).
    pub fn preauth_secret(&self) -> Result<Zeroizing<Vec<u8>>> {
        if let Some(sealer) = self.sealer.as_deref() {
            let seal_path = self.data_dir.join(PREAUTH_SEAL_FILE);
            if seal_path.exists() {
                let sealed: SealedPreAuth = serde_json::from_slice(&std::fs::read(&seal_path)?)?;
                if sealed.policy == sealer.policy_digest() {
                    let blob = general_purpose::STANDARD
                        .decode(&sealed.blob)
                        .map_err(|e| Error::Sealer(format!("decode sealed blob: {e}")))?;
                    return sealer.unseal(&blob);
                }
            }
        }
        self.unwrap_preauth_with_master()
    }

    fn unwrap_preauth_with_master(&self) -> Result<Zeroizing<Vec<u8>>> {
        let path = self.data_dir.join(PREAUTH_WRAPPED_FILE);
        if !path.exists() {
            return Err(Error::NotInitialized);
        }
        let bytes = std::fs::read(&path)?;
        if bytes.len() < NONCE_LEN {
            return Err(Error::Crypto("wrapped pre-auth secret truncated".into()));
        }
        let nonce: [u8; NONCE_LEN] = bytes[..NONCE_LEN].try_into().unwrap();
        let ciphertext = &bytes[NONCE_LEN..];
        self.key_manager.with_secret(|master| {
            let wrap_key = crypto::derive_subkey(CTX_PREAUTH_WRAP, master);
            crypto::decrypt(&wrap_key, &nonce, ciphertext, PREAUTH_AAD)
        })?
    }

    fn write_preauth_wrapped(&self, preauth: &[u8]) -> Result<()> {
        let (nonce, ciphertext) = self.key_manager.with_secret(|master| {
            let wrap_key = crypto::derive_subkey(CTX_PREAUTH_WRAP, master);
            let nonce = crypto::generate_nonce();
            let ciphertext = crypto::encrypt(&wrap_key, &nonce, preauth, PREAUTH_AAD)?;
            Ok::<_, Error>((nonce, ciphertext))
        })??;
        let mut bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&ciphertext);
        write_atomic(&self.data_dir.join(PREAUTH_WRAPPED_FILE), &bytes)
    }

    fn write_preauth_sealed(&self, sealer: &dyn HardwareSealer, preauth: &[u8]) -> Result<()> {
        let blob = sealer.seal(preauth)?;
        let sealed = SealedPreAuth {
            policy: sealer.policy_digest(),
            blob: general_purpose::STANDARD.encode(blob),
        };
        write_atomic(
            &self.data_dir.join(PREAUTH_SEAL_FILE),
            &serde_json::to_vec_pretty(&sealed)?,
        )
    }

    pub(crate) fn preauth_wrapped_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.data_dir.join(PREAUTH_WRAPPED_FILE))?)
    }
}
