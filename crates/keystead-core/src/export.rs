//! Encrypted export bundles and all-or-nothing import.
//!
//! A bundle is one file: a plaintext JSON header carrying the wrapped
//! key-set records (each already sealed under its own credential), followed
//! by an AEAD ciphertext of a zstd-compressed tar of both volumes and a
//! signed manifest. Because the key-set records travel in the clear-text
//! header, the destination device can unlock them with the admin password
//! or recovery phrase before it can read a single byte of volume data.
//!
//! Import stages the entire bundle in a scratch directory and verifies the
//! manifest signature and every volume hash there; any failure up to that
//! point leaves the destination untouched. The verified tree is then parked
//! at a well-known pending path in one rename and applied from there in
//! idempotent steps, so a crash mid-apply is finished by
//! [`apply_pending_import`] on the next open instead of leaving the
//! destination half-replaced.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::control_store::ControlStore;
use crate::crypto::{self, KdfParams, NONCE_LEN};
use crate::error::{Error, Result};
use crate::integrity::{hash_volume_dir, Checkpoint};
use crate::key_manager::{KeyManager, PASSWORD_RECORD_FILE, RECOVERY_RECORD_FILE};
use crate::keyset::{fsync_dir, write_atomic};
use crate::orchestrator::{
    DualVolumeOrchestrator, INTEGRITY_STATE_FILE, PREAUTH_WRAPPED_FILE,
};
use crate::sealer::HardwareSealer;
use crate::volume::VolumeKind;

pub const BUNDLE_MAGIC: &[u8] = b"KSTDEXP1";
pub const BUNDLE_VERSION: u32 = 1;
pub const MANIFEST_NAME: &str = "manifest.json";
pub const IMPORT_PENDING_DIR: &str = "import.pending";

const CTX_BUNDLE: &str = "keystead v1 export bundle";
const BUNDLE_AAD: &[u8] = b"keystead-bundle-v1";
const ZSTD_LEVEL: i32 = 3;

/// Plaintext bundle header. Everything here is either public or already
/// sealed under a credential the destination operator must supply.
#[derive(Debug, Serialize, Deserialize)]
struct BundleHeader {
    format_version: u32,
    created_at: DateTime<Utc>,
    /// Wrapped key-set records, byte-for-byte as persisted on the source.
    keyset_password: String,
    keyset_recovery: String,
    /// Pre-auth secret wrapped under the master secret, so the bundle stays
    /// portable across hardware.
    preauth_wrapped: String,
    nonce: String,
}

/// What an export covered, signed by the device identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Ed25519 device public key, base64.
    pub device_public_key: String,
    pub volumes: BTreeMap<String, VolumeSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub hash: String,
    pub file_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedManifest {
    manifest: ExportManifest,
    /// Ed25519 signature over the serialized manifest, hex.
    signature: String,
}

pub struct ExportService;

impl ExportService {
    /// Write a complete bundle to `dest`. Requires the key set to be
    /// unlocked. The control store, when given, is quiesced for the whole
    /// snapshot so the database files inside the volume are consistent.
    pub fn export(
        orch: &DualVolumeOrchestrator,
        store: Option<&ControlStore>,
        dest: &Path,
    ) -> Result<ExportManifest> {
        if orch.key_manager().is_locked() {
            return Err(Error::InvalidState("export requires an unlocked key set"));
        }

        // Bind the pre-auth secret to the current hardware policy first, so
        // the bundle reflects a state that boots on this device as-is.
        if orch.sealer().is_some() {
            orch.reseal_preauth()?;
        }

        let alerts = orch.integrity().check_all(Checkpoint::PreExport)?;
        if let Some(alert) = alerts.into_iter().next() {
            return Err(Error::IntegrityMismatch {
                volume: alert.volume.to_string(),
                expected: alert.expected,
                actual: alert.actual,
            });
        }

        let _quiesced = match store {
            Some(store) => Some(store.quiesce()?),
            None => None,
        };

        // The checkpoint above may have compacted database files inside the
        // volume; re-record the hashes so the manifest and the recorded
        // state agree.
        for kind in [VolumeKind::PreAuth, VolumeKind::PostAuth] {
            orch.integrity().refresh(kind)?;
        }

        let manifest = Self::build_manifest(orch)?;
        let signed = Self::sign_manifest(orch, &manifest)?;
        let archive = Self::pack_archive(orch, &signed)?;
        let compressed = zstd::stream::encode_all(Cursor::new(archive), ZSTD_LEVEL)
            .map_err(|e| Error::Crypto(format!("compress bundle: {e}")))?;

        let nonce = crypto::generate_nonce();
        let ciphertext = orch.key_manager().with_secret(|master| {
            let key = crypto::derive_subkey(CTX_BUNDLE, master);
            crypto::encrypt(&key, &nonce, &compressed, BUNDLE_AAD)
        })??;

        let header = BundleHeader {
            format_version: BUNDLE_VERSION,
            created_at: manifest.created_at,
            keyset_password: general_purpose::STANDARD
                .encode(fs::read(orch.data_dir().join(PASSWORD_RECORD_FILE))?),
            keyset_recovery: general_purpose::STANDARD
                .encode(fs::read(orch.data_dir().join(RECOVERY_RECORD_FILE))?),
            preauth_wrapped: general_purpose::STANDARD.encode(orch.preauth_wrapped_bytes()?),
            nonce: general_purpose::STANDARD.encode(nonce),
        };
        let header_json = serde_json::to_vec(&header)?;

        let mut bundle = Vec::with_capacity(
            BUNDLE_MAGIC.len() + 4 + header_json.len() + ciphertext.len(),
        );
        bundle.extend_from_slice(BUNDLE_MAGIC);
        bundle.extend_from_slice(&(header_json.len() as u32).to_le_bytes());
        bundle.extend_from_slice(&header_json);
        bundle.extend_from_slice(&ciphertext);
        write_atomic(dest, &bundle)?;

        info!(dest = %dest.display(), bytes = bundle.len(), "export bundle written");
        Ok(manifest)
    }

    /// Restore a bundle onto `data_dir`, returning a ready orchestrator.
    /// The staged tree replaces the destination only after the manifest
    /// signature and every volume hash verify; the pre-auth secret is then
    /// re-sealed to the destination's hardware policy. The returned
    /// orchestrator is locked.
    pub fn import(
        bundle_path: &Path,
        password: &str,
        data_dir: &Path,
        sealer: Option<Box<dyn HardwareSealer>>,
        params: KdfParams,
    ) -> Result<DualVolumeOrchestrator> {
        let bytes = fs::read(bundle_path)?;
        let (header, ciphertext) = Self::split_bundle(&bytes)?;

        fs::create_dir_all(data_dir)?;
        let staging = tempfile::tempdir_in(data_dir)?;

        let password_record = general_purpose::STANDARD
            .decode(&header.keyset_password)
            .map_err(|e| Error::Crypto(format!("decode key-set record: {e}")))?;
        let recovery_record = general_purpose::STANDARD
            .decode(&header.keyset_recovery)
            .map_err(|e| Error::Crypto(format!("decode key-set record: {e}")))?;
        let preauth_wrapped = general_purpose::STANDARD
            .decode(&header.preauth_wrapped)
            .map_err(|e| Error::Crypto(format!("decode wrapped pre-auth secret: {e}")))?;
        write_atomic(&staging.path().join(PASSWORD_RECORD_FILE), &password_record)?;
        write_atomic(&staging.path().join(RECOVERY_RECORD_FILE), &recovery_record)?;

        // Unlock from the staged records; KDF costs travel inside them.
        let km = KeyManager::with_params(staging.path(), params);
        km.unlock(password)?;

        let nonce: [u8; NONCE_LEN] = general_purpose::STANDARD
            .decode(&header.nonce)
            .map_err(|e| Error::Crypto(format!("decode bundle nonce: {e}")))?
            .try_into()
            .map_err(|_| Error::Crypto("bundle nonce length invalid".into()))?;
        let compressed: Zeroizing<Vec<u8>> = km.with_secret(|master| {
            let key = crypto::derive_subkey(CTX_BUNDLE, master);
            crypto::decrypt(&key, &nonce, ciphertext, BUNDLE_AAD)
        })??;
        let archive = zstd::stream::decode_all(Cursor::new(&compressed[..]))
            .map_err(|e| Error::Crypto(format!("decompress bundle: {e}")))?;

        let mut tar = tar::Archive::new(Cursor::new(archive));
        tar.unpack(staging.path())?;

        let signed: SignedManifest =
            serde_json::from_slice(&fs::read(staging.path().join(MANIFEST_NAME))?)?;
        Self::verify_manifest(&km, &signed)?;

        for (name, summary) in &signed.manifest.volumes {
            let actual = hash_volume_dir(&staging.path().join("volumes").join(name))?;
            if actual != summary.hash {
                return Err(Error::IntegrityMismatch {
                    volume: name.clone(),
                    expected: summary.hash.clone(),
                    actual,
                });
            }
        }
        km.lock();

        // Everything verified. Park the staged tree at the pending path in
        // one rename — the commit point — then apply it. The apply steps are
        // idempotent, so an interruption anywhere past the rename is
        // finished on the next open.
        write_atomic(&staging.path().join(PREAUTH_WRAPPED_FILE), &preauth_wrapped)?;
        let pending = data_dir.join(IMPORT_PENDING_DIR);
        if pending.exists() {
            fs::remove_dir_all(&pending)?;
        }
        fs::rename(staging.path(), &pending)?;
        fsync_dir(data_dir)?;
        drop(staging);
        apply_pending_import(data_dir)?;

        let had_sealer = sealer.is_some();
        let orch = DualVolumeOrchestrator::with_params(data_dir, sealer, params)?;
        orch.key_manager().unlock(password)?;
        let bind: Result<()> = (|| {
            if had_sealer {
                orch.reseal_preauth()?;
            } else {
                warn!("import onto a device without a hardware sealer; pre-auth phase disabled");
            }
            orch.integrity().refresh(VolumeKind::PreAuth)?;
            orch.integrity().refresh(VolumeKind::PostAuth)?;
            Ok(())
        })();
        orch.lock();
        bind?;

        info!(from = %bundle_path.display(), "import complete");
        Ok(orch)
    }

    fn build_manifest(orch: &DualVolumeOrchestrator) -> Result<ExportManifest> {
        let mut volumes = BTreeMap::new();
        for kind in [VolumeKind::PreAuth, VolumeKind::PostAuth] {
            let dir = orch.volumes().dir(kind);
            let file_count = walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count() as u64;
            volumes.insert(
                kind.as_str().to_string(),
                VolumeSummary {
                    hash: hash_volume_dir(&dir)?,
                    file_count,
                },
            );
        }
        let public = orch.key_manager().signing_key()?.verifying_key();
        Ok(ExportManifest {
            format_version: BUNDLE_VERSION,
            created_at: Utc::now(),
            device_public_key: general_purpose::STANDARD.encode(public.to_bytes()),
            volumes,
        })
    }

    fn sign_manifest(
        orch: &DualVolumeOrchestrator,
        manifest: &ExportManifest,
    ) -> Result<SignedManifest> {
        let bytes = serde_json::to_vec(manifest)?;
        let signature = crypto::sign_bytes(&orch.key_manager().signing_key()?, &bytes);
        Ok(SignedManifest {
            manifest: manifest.clone(),
            signature: hex::encode(signature.to_bytes()),
        })
    }

    /// The manifest must verify against the identity key carried inside the
    /// bundle's own key-set records; a bundle signed by any other device is
    /// rejected even when its password is known.
    fn verify_manifest(km: &KeyManager, signed: &SignedManifest) -> Result<()> {
        let expected_public = km.signing_key()?.verifying_key();
        let claimed = general_purpose::STANDARD
            .decode(&signed.manifest.device_public_key)
            .map_err(|e| Error::Crypto(format!("decode manifest public key: {e}")))?;
        let claimed: [u8; 32] = claimed
            .try_into()
            .map_err(|_| Error::Crypto("manifest public key length invalid".into()))?;
        if VerifyingKey::from_bytes(&claimed)
            .map_err(|e| Error::Crypto(format!("manifest public key: {e}")))?
            != expected_public
        {
            return Err(Error::Crypto(
                "manifest signed by a different device identity".into(),
            ));
        }
        let sig_bytes = hex::decode(&signed.signature)
            .map_err(|e| Error::Crypto(format!("decode manifest signature: {e}")))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| Error::Crypto("manifest signature length invalid".into()))?;
        let bytes = serde_json::to_vec(&signed.manifest)?;
        crypto::verify_signature(&expected_public, &bytes, &Signature::from_bytes(&sig_bytes))
    }

    fn pack_archive(orch: &DualVolumeOrchestrator, signed: &SignedManifest) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for kind in [VolumeKind::PreAuth, VolumeKind::PostAuth] {
            builder.append_dir_all(
                Path::new("volumes").join(kind.as_str()),
                orch.volumes().dir(kind),
            )?;
        }
        let manifest_json = serde_json::to_vec_pretty(signed)?;
        let mut entry = tar::Header::new_gnu();
        entry.set_size(manifest_json.len() as u64);
        entry.set_mode(0o600);
        entry.set_cksum();
        builder.append_data(&mut entry, MANIFEST_NAME, Cursor::new(manifest_json))?;
        builder.into_inner().map_err(Error::Storage)
    }

    fn split_bundle(bytes: &[u8]) -> Result<(BundleHeader, &[u8])> {
        if bytes.len() < BUNDLE_MAGIC.len() + 4 || &bytes[..BUNDLE_MAGIC.len()] != BUNDLE_MAGIC {
            return Err(Error::Crypto("not an export bundle".into()));
        }
        let header_len =
            u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let body_start = 12 + header_len;
        if bytes.len() < body_start {
            return Err(Error::Crypto("export bundle truncated".into()));
        }
        let header: BundleHeader = serde_json::from_slice(&bytes[12..body_start])?;
        if header.format_version != BUNDLE_VERSION {
            return Err(Error::UnsupportedAlgorithm {
                kind: "bundle format",
                id: header.format_version,
            });
        }
        Ok((header, &bytes[body_start..]))
    }
}

/// Apply (or finish applying) a parked import tree. Every step here is
/// idempotent against a partially applied pending directory: records are
/// re-copied while the pending copy survives, the volume swap runs only
/// while the staged volumes still sit in pending, and the directory is
/// removed last. Callers re-run this from the top after any interruption.
pub(crate) fn apply_pending_import(data_dir: &Path) -> Result<()> {
    let pending = data_dir.join(IMPORT_PENDING_DIR);
    for file in [PASSWORD_RECORD_FILE, RECOVERY_RECORD_FILE, PREAUTH_WRAPPED_FILE] {
        let src = pending.join(file);
        if src.exists() {
            write_atomic(&data_dir.join(file), &fs::read(&src)?)?;
        }
    }
    let staged_volumes = pending.join("volumes");
    if staged_volumes.exists() {
        let volumes_dir = data_dir.join("volumes");
        if volumes_dir.exists() {
            fs::remove_dir_all(&volumes_dir)?;
        }
        fs::rename(&staged_volumes, &volumes_dir)?;
        fsync_dir(data_dir)?;
    }
    let stale = data_dir.join(INTEGRITY_STATE_FILE);
    if stale.exists() {
        fs::remove_file(&stale)?;
    }
    fs::remove_dir_all(&pending)?;
    Ok(())
}
