//! Volume integrity checkpoints.
//!
//! Hashes each volume's ciphertext at boot, at unlock, and immediately
//! before every export, comparing against the last recorded hash. A
//! mismatch raises an alert for operators — the checker never mutates or
//! repairs. Change notifications from the storage subsystem refresh the
//! recorded hash so exports are never stale.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::keyset::write_atomic;
use crate::volume::{VolumeKind, VolumeSet};

pub const RESTORE_RECOMMENDATION: &str = "restore from the most recent export";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Checkpoint {
    Boot,
    Unlock,
    PreExport,
}

/// Raised when a volume's ciphertext no longer matches its recorded hash.
/// Surfaced to operators; recovery decisions stay with them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityAlert {
    pub volume: VolumeKind,
    pub checkpoint: Checkpoint,
    pub expected: String,
    pub actual: String,
    pub observed_at: DateTime<Utc>,
    pub recommendation: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordedHashes {
    volumes: HashMap<String, String>,
}

pub struct IntegrityChecker {
    volumes: VolumeSet,
    state_path: PathBuf,
    recorded: Mutex<RecordedHashes>,
}

impl IntegrityChecker {
    pub fn new(volumes: VolumeSet, state_path: impl AsRef<Path>) -> Result<Self> {
        let state_path = state_path.as_ref().to_path_buf();
        let recorded = if state_path.exists() {
            let json = std::fs::read_to_string(&state_path)?;
            serde_json::from_str(&json)?
        } else {
            RecordedHashes::default()
        };
        Ok(Self {
            volumes,
            state_path,
            recorded: Mutex::new(recorded),
        })
    }

    /// Verify one volume at a checkpoint. The first observation of a volume
    /// records its hash; later mismatches produce an alert without touching
    /// the recorded value.
    pub fn check(&self, kind: VolumeKind, checkpoint: Checkpoint) -> Result<Option<IntegrityAlert>> {
        let actual = hash_volume_dir(&self.volumes.dir(kind))?;
        let mut recorded = self.recorded.lock();
        match recorded.volumes.get(kind.as_str()) {
            Some(expected) if *expected != actual => {
                let alert = IntegrityAlert {
                    volume: kind,
                    checkpoint,
                    expected: expected.clone(),
                    actual,
                    observed_at: Utc::now(),
                    recommendation: RESTORE_RECOMMENDATION.to_string(),
                };
                warn!(
                    volume = %kind,
                    checkpoint = ?checkpoint,
                    expected = %alert.expected,
                    actual = %alert.actual,
                    "volume integrity mismatch"
                );
                Ok(Some(alert))
            }
            Some(_) => Ok(None),
            None => {
                recorded.volumes.insert(kind.as_str().to_string(), actual);
                self.persist(&recorded)?;
                Ok(None)
            }
        }
    }

    /// Verify both volumes at a checkpoint, collecting alerts.
    pub fn check_all(&self, checkpoint: Checkpoint) -> Result<Vec<IntegrityAlert>> {
        let mut alerts = Vec::new();
        for kind in [VolumeKind::PreAuth, VolumeKind::PostAuth] {
            if let Some(alert) = self.check(kind, checkpoint)? {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }

    /// Re-record a volume's hash after a legitimate mutation (storage
    /// subsystem change notification, export re-seal, import).
    pub fn refresh(&self, kind: VolumeKind) -> Result<String> {
        let actual = hash_volume_dir(&self.volumes.dir(kind))?;
        let mut recorded = self.recorded.lock();
        recorded
            .volumes
            .insert(kind.as_str().to_string(), actual.clone());
        self.persist(&recorded)?;
        info!(volume = %kind, hash = %actual, "recorded integrity hash refreshed");
        Ok(actual)
    }

    pub fn recorded_hash(&self, kind: VolumeKind) -> Option<String> {
        self.recorded.lock().volumes.get(kind.as_str()).cloned()
    }

    fn persist(&self, recorded: &RecordedHashes) -> Result<()> {
        let json = serde_json::to_vec_pretty(recorded)?;
        write_atomic(&self.state_path, &json)
    }
}

/// Deterministic BLAKE3 hash over a directory tree: files in sorted order,
/// each contributing its relative path, length and contents.
pub fn hash_volume_dir(dir: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    if dir.exists() {
        let mut entries: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        entries.sort();
        for path in entries {
            let rel = path.strip_prefix(dir).unwrap_or(&path);
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(&[0x1f]);
            let mut file = File::open(&path)?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            hasher.update(&(buf.len() as u64).to_le_bytes());
            hasher.update(&buf);
            hasher.update(b"\n");
        }
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, IntegrityChecker) {
        let dir = tempdir().unwrap();
        let volumes = VolumeSet::new(dir.path().join("volumes"));
        volumes.ensure_layout().unwrap();
        std::fs::write(volumes.dir(VolumeKind::PreAuth).join("blob.bin"), b"ciphertext").unwrap();
        let checker =
            IntegrityChecker::new(volumes, dir.path().join("integrity.json")).unwrap();
        (dir, checker)
    }

    #[test]
    fn first_check_records_then_clean_check_passes() {
        let (_dir, checker) = fixture();
        assert!(checker.check(VolumeKind::PreAuth, Checkpoint::Boot).unwrap().is_none());
        assert!(checker.recorded_hash(VolumeKind::PreAuth).is_some());
        assert!(checker.check(VolumeKind::PreAuth, Checkpoint::Unlock).unwrap().is_none());
    }

    #[test]
    fn mutation_raises_alert_and_keeps_recorded_hash() {
        let (dir, checker) = fixture();
        checker.check(VolumeKind::PreAuth, Checkpoint::Boot).unwrap();
        let recorded = checker.recorded_hash(VolumeKind::PreAuth).unwrap();

        std::fs::write(
            dir.path().join("volumes").join("preauth").join("blob.bin"),
            b"tampered",
        )
        .unwrap();

        let alert = checker
            .check(VolumeKind::PreAuth, Checkpoint::PreExport)
            .unwrap()
            .expect("mismatch must raise an alert");
        assert_eq!(alert.expected, recorded);
        assert_ne!(alert.actual, recorded);
        assert_eq!(alert.recommendation, RESTORE_RECOMMENDATION);
        // Alert does not auto-mutate the recorded value.
        assert_eq!(checker.recorded_hash(VolumeKind::PreAuth).unwrap(), recorded);
    }

    #[test]
    fn refresh_accepts_a_legitimate_change() {
        let (dir, checker) = fixture();
        checker.check(VolumeKind::PreAuth, Checkpoint::Boot).unwrap();
        std::fs::write(
            dir.path().join("volumes").join("preauth").join("blob.bin"),
            b"rotated",
        )
        .unwrap();
        checker.refresh(VolumeKind::PreAuth).unwrap();
        assert!(checker
            .check(VolumeKind::PreAuth, Checkpoint::PreExport)
            .unwrap()
            .is_none());
    }

    #[test]
    fn recorded_state_survives_reopen() {
        let (dir, checker) = fixture();
        checker.check(VolumeKind::PreAuth, Checkpoint::Boot).unwrap();
        let recorded = checker.recorded_hash(VolumeKind::PreAuth).unwrap();
        drop(checker);

        let volumes = VolumeSet::new(dir.path().join("volumes"));
        let reopened =
            IntegrityChecker::new(volumes, dir.path().join("integrity.json")).unwrap();
        assert_eq!(reopened.recorded_hash(VolumeKind::PreAuth).unwrap(), recorded);
    }
}
