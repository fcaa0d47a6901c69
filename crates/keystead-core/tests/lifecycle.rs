//! End-to-end lifecycle: provision, boot, unlock, export, import.

use std::path::Path;
use std::sync::Mutex;

use tempfile::tempdir;
use zeroize::Zeroizing;

use keystead_core::control_store::ControlStore;
use keystead_core::error::Error;
use keystead_core::export::{ExportService, IMPORT_PENDING_DIR};
use keystead_core::key_manager::{PASSWORD_RECORD_FILE, RECOVERY_RECORD_FILE};
use keystead_core::orchestrator::{
    BootOutcome, DualVolumeOrchestrator, StorageHandoff, PREAUTH_WRAPPED_FILE,
};
use keystead_core::sealer::HardwareSealer;
use keystead_core::volume::VolumeKind;
use keystead_core::KdfParams;

const PASSWORD: &str = "orchard-silo-ledger";

fn fast_params() -> KdfParams {
    KdfParams {
        time_cost: 1,
        memory_cost: 8,
        parallelism: 1,
    }
}

/// Sealer double: a blob is the policy digest followed by the secret, and
/// unseal refuses blobs sealed under any other policy.
struct FakeSealer {
    policy: String,
}

impl FakeSealer {
    fn new(policy: &str) -> Self {
        Self {
            policy: policy.to_string(),
        }
    }
}

impl HardwareSealer for FakeSealer {
    fn seal(&self, secret: &[u8]) -> keystead_core::Result<Vec<u8>> {
        let mut blob = self.policy.as_bytes().to_vec();
        blob.push(0x1f);
        blob.extend_from_slice(secret);
        Ok(blob)
    }

    fn unseal(&self, blob: &[u8]) -> keystead_core::Result<Zeroizing<Vec<u8>>> {
        let sep = blob
            .iter()
            .position(|b| *b == 0x1f)
            .ok_or_else(|| Error::Sealer("malformed blob".into()))?;
        if blob[..sep] != *self.policy.as_bytes() {
            return Err(Error::Sealer("policy mismatch".into()));
        }
        Ok(Zeroizing::new(blob[sep + 1..].to_vec()))
    }

    fn policy_digest(&self) -> String {
        self.policy.clone()
    }
}

/// Records every key handed over at each phase transition.
#[derive(Default)]
struct FakeHandoff {
    restricted: Mutex<Vec<Vec<u8>>>,
    full: Mutex<Vec<Vec<u8>>>,
}

impl StorageHandoff for FakeHandoff {
    fn enter_restricted(&self, key: &[u8]) -> keystead_core::Result<()> {
        self.restricted.lock().unwrap().push(key.to_vec());
        Ok(())
    }

    fn pivot_full(&self, key: &[u8]) -> keystead_core::Result<()> {
        self.full.lock().unwrap().push(key.to_vec());
        Ok(())
    }
}

impl FakeHandoff {
    fn restricted_key(&self) -> Vec<u8> {
        self.restricted.lock().unwrap().last().cloned().unwrap()
    }

    fn full_key(&self) -> Vec<u8> {
        self.full.lock().unwrap().last().cloned().unwrap()
    }
}

fn provisioned(
    data_dir: &Path,
    sealer: Option<Box<dyn HardwareSealer>>,
) -> (DualVolumeOrchestrator, Zeroizing<String>) {
    let orch = DualVolumeOrchestrator::with_params(data_dir, sealer, fast_params()).unwrap();
    let phrase = orch.provision(PASSWORD).unwrap();
    (orch, phrase)
}

fn write_volume_file(orch: &DualVolumeOrchestrator, kind: VolumeKind, name: &str, data: &[u8]) {
    std::fs::write(orch.volumes().dir(kind).join(name), data).unwrap();
    orch.volume_changed(kind).unwrap();
}

#[test]
fn hardware_boot_restricted_then_unlock_full() {
    let dir = tempdir().unwrap();
    let (orch, _) = provisioned(dir.path(), Some(Box::new(FakeSealer::new("pcr-a"))));
    let handoff = FakeHandoff::default();

    match orch.boot(&handoff).unwrap() {
        BootOutcome::Restricted { alerts } => assert!(alerts.is_empty()),
        other => panic!("expected restricted boot, got {other:?}"),
    }
    assert!(orch.handle(VolumeKind::PreAuth).mounted);
    assert!(!orch.handle(VolumeKind::PostAuth).mounted);
    assert!(orch.key_manager().is_locked());

    let alerts = orch.unlock(PASSWORD, &handoff).unwrap();
    assert!(alerts.is_empty());
    assert!(orch.handle(VolumeKind::PostAuth).mounted);
    assert!(!orch.key_manager().is_locked());

    // The two phases run on unrelated keys.
    assert_ne!(handoff.restricted_key(), handoff.full_key());

    orch.lock();
    assert!(orch.key_manager().is_locked());
    assert!(!orch.handle(VolumeKind::PostAuth).mounted);
    // Pre-auth stays serviceable after lock when hardware released it.
    assert!(orch.handle(VolumeKind::PreAuth).mounted);
}

#[test]
fn tpmless_boot_mounts_nothing_until_unlock() {
    let dir = tempdir().unwrap();
    let (orch, _) = provisioned(dir.path(), None);
    let handoff = FakeHandoff::default();

    match orch.boot(&handoff).unwrap() {
        BootOutcome::AwaitingAdmin { alerts } => assert!(alerts.is_empty()),
        other => panic!("expected awaiting-admin boot, got {other:?}"),
    }
    assert!(!orch.handle(VolumeKind::PreAuth).mounted);
    assert!(handoff.restricted.lock().unwrap().is_empty());

    orch.unlock(PASSWORD, &handoff).unwrap();
    assert!(orch.handle(VolumeKind::PreAuth).mounted);
    assert!(orch.handle(VolumeKind::PostAuth).mounted);
    assert_eq!(handoff.restricted.lock().unwrap().len(), 1);

    // Without a sealer both volumes are gated by the credential.
    orch.lock();
    assert!(!orch.handle(VolumeKind::PreAuth).mounted);
    assert!(!orch.handle(VolumeKind::PostAuth).mounted);
}

#[test]
fn recovery_phrase_unlocks_and_is_recorded_on_the_handle() {
    let dir = tempdir().unwrap();
    let (orch, phrase) = provisioned(dir.path(), Some(Box::new(FakeSealer::new("pcr-a"))));
    let handoff = FakeHandoff::default();
    orch.boot(&handoff).unwrap();

    orch.unlock_with_recovery(&phrase, &handoff).unwrap();
    assert_eq!(
        orch.handle(VolumeKind::PostAuth).unlocked_via,
        Some(keystead_core::CredentialPath::Recovery)
    );
}

#[test]
fn boot_on_foreign_policy_demands_reseal() {
    let dir = tempdir().unwrap();
    {
        let (_orch, _) = provisioned(dir.path(), Some(Box::new(FakeSealer::new("pcr-a"))));
    }
    // Same data, different hardware policy.
    let orch = DualVolumeOrchestrator::with_params(
        dir.path(),
        Some(Box::new(FakeSealer::new("pcr-b"))),
        fast_params(),
    )
    .unwrap();
    let handoff = FakeHandoff::default();
    match orch.boot(&handoff) {
        Err(Error::Sealer(_)) => {}
        other => panic!("expected sealer error, got {other:?}"),
    }

    // After the admin unlocks, the secret can be re-bound and boot recovers.
    orch.key_manager().unlock(PASSWORD).unwrap();
    orch.reseal_preauth().unwrap();
    orch.lock();
    assert!(matches!(
        orch.boot(&handoff).unwrap(),
        BootOutcome::Restricted { .. }
    ));
}

#[test]
fn tampered_volume_raises_boot_alert() {
    let dir = tempdir().unwrap();
    let (orch, _) = provisioned(dir.path(), Some(Box::new(FakeSealer::new("pcr-a"))));
    write_volume_file(&orch, VolumeKind::PostAuth, "blob.bin", b"ciphertext");
    drop(orch);

    // Out-of-band mutation, no change notification.
    let orch = DualVolumeOrchestrator::with_params(
        dir.path(),
        Some(Box::new(FakeSealer::new("pcr-a"))),
        fast_params(),
    )
    .unwrap();
    std::fs::write(
        orch.volumes().dir(VolumeKind::PostAuth).join("blob.bin"),
        b"tampered",
    )
    .unwrap();

    let handoff = FakeHandoff::default();
    match orch.boot(&handoff).unwrap() {
        BootOutcome::Restricted { alerts } => {
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].volume, VolumeKind::PostAuth);
        }
        other => panic!("expected restricted boot, got {other:?}"),
    }
}

#[test]
fn export_then_import_restores_volumes_and_credentials() {
    let src_dir = tempdir().unwrap();
    let (src, phrase) = provisioned(src_dir.path(), Some(Box::new(FakeSealer::new("pcr-a"))));
    let handoff = FakeHandoff::default();
    src.boot(&handoff).unwrap();
    src.unlock(PASSWORD, &handoff).unwrap();
    write_volume_file(&src, VolumeKind::PreAuth, "index.bin", b"preauth ciphertext");
    write_volume_file(&src, VolumeKind::PostAuth, "data.bin", b"postauth ciphertext");

    let store = ControlStore::open(
        src.volumes().dir(VolumeKind::PostAuth).join("control.db"),
    )
    .unwrap();
    store.set_auth_state(br#"{"admins":1}"#).unwrap();
    src.volume_changed(VolumeKind::PostAuth).unwrap();

    let bundle = src_dir.path().join("device.keystead");
    let manifest = ExportService::export(&src, Some(&store), &bundle).unwrap();
    assert_eq!(manifest.volumes.len(), 2);
    drop(store);

    // Restore onto fresh hardware with a different sealing policy.
    let dst_dir = tempdir().unwrap();
    let dst = ExportService::import(
        &bundle,
        PASSWORD,
        dst_dir.path(),
        Some(Box::new(FakeSealer::new("pcr-z"))),
        fast_params(),
    )
    .unwrap();
    assert!(dst.key_manager().is_locked());

    let dst_handoff = FakeHandoff::default();
    assert!(matches!(
        dst.boot(&dst_handoff).unwrap(),
        BootOutcome::Restricted { alerts } if alerts.is_empty()
    ));
    dst.unlock(PASSWORD, &dst_handoff).unwrap();

    // Same volume secrets on both sides.
    assert_eq!(handoff.restricted_key(), dst_handoff.restricted_key());
    assert_eq!(handoff.full_key(), dst_handoff.full_key());

    assert_eq!(
        std::fs::read(dst.volumes().dir(VolumeKind::PostAuth).join("data.bin")).unwrap(),
        b"postauth ciphertext"
    );
    let restored = ControlStore::open(
        dst.volumes().dir(VolumeKind::PostAuth).join("control.db"),
    )
    .unwrap();
    restored.verify().unwrap();
    assert_eq!(
        restored.auth_state().unwrap(),
        Some(br#"{"admins":1}"#.to_vec())
    );

    // The recovery phrase travelled with the bundle.
    dst.lock();
    dst.unlock_with_recovery(&phrase, &dst_handoff).unwrap();
}

#[test]
fn tampered_bundle_is_rejected_and_destination_untouched() {
    let src_dir = tempdir().unwrap();
    let (src, _) = provisioned(src_dir.path(), None);
    let handoff = FakeHandoff::default();
    src.boot(&handoff).unwrap();
    src.unlock(PASSWORD, &handoff).unwrap();
    write_volume_file(&src, VolumeKind::PostAuth, "data.bin", b"payload");

    let bundle = src_dir.path().join("device.keystead");
    ExportService::export(&src, None, &bundle).unwrap();

    let mut bytes = std::fs::read(&bundle).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&bundle, &bytes).unwrap();

    let dst_dir = tempdir().unwrap();
    match ExportService::import(&bundle, PASSWORD, dst_dir.path(), None, fast_params()) {
        Err(Error::InvalidCredential) => {}
        Err(other) => panic!("expected InvalidCredential, got {other:?}"),
        Ok(_) => panic!("import must reject a tampered bundle"),
    }
    assert!(!dst_dir.path().join("volumes").exists());
    assert!(!dst_dir.path().join("keyset-password.dat").exists());
}

#[test]
fn import_with_wrong_password_fails_cleanly() {
    let src_dir = tempdir().unwrap();
    let (src, _) = provisioned(src_dir.path(), None);
    let handoff = FakeHandoff::default();
    src.boot(&handoff).unwrap();
    src.unlock(PASSWORD, &handoff).unwrap();

    let bundle = src_dir.path().join("device.keystead");
    ExportService::export(&src, None, &bundle).unwrap();

    let dst_dir = tempdir().unwrap();
    match ExportService::import(&bundle, "wrong", dst_dir.path(), None, fast_params()) {
        Err(Error::InvalidCredential) => {}
        Err(other) => panic!("expected InvalidCredential, got {other:?}"),
        Ok(_) => panic!("import must reject a wrong password"),
    }
    assert!(!dst_dir.path().join("volumes").exists());
}

#[test]
fn interrupted_import_completes_on_next_open() {
    let dir = tempdir().unwrap();
    {
        let (orch, _) = provisioned(dir.path(), None);
        let handoff = FakeHandoff::default();
        orch.boot(&handoff).unwrap();
        orch.unlock(PASSWORD, &handoff).unwrap();
        write_volume_file(&orch, VolumeKind::PostAuth, "data.bin", b"payload");
        orch.lock();
    }

    // Park the provisioned state as a fully committed but unapplied import,
    // as if the process died right after the commit rename.
    let pending = dir.path().join(IMPORT_PENDING_DIR);
    std::fs::create_dir_all(&pending).unwrap();
    std::fs::rename(dir.path().join("volumes"), pending.join("volumes")).unwrap();
    for file in [PASSWORD_RECORD_FILE, RECOVERY_RECORD_FILE, PREAUTH_WRAPPED_FILE] {
        std::fs::rename(dir.path().join(file), pending.join(file)).unwrap();
    }
    std::fs::remove_file(dir.path().join("integrity.json")).unwrap();

    let orch = DualVolumeOrchestrator::with_params(dir.path(), None, fast_params()).unwrap();
    assert!(!pending.exists());
    assert!(orch.key_manager().is_initialized());

    let handoff = FakeHandoff::default();
    orch.boot(&handoff).unwrap();
    orch.unlock(PASSWORD, &handoff).unwrap();
    assert_eq!(
        std::fs::read(orch.volumes().dir(VolumeKind::PostAuth).join("data.bin")).unwrap(),
        b"payload"
    );
}

#[test]
fn export_requires_an_unlocked_key_set() {
    let dir = tempdir().unwrap();
    let (orch, _) = provisioned(dir.path(), None);
    let bundle = dir.path().join("device.keystead");
    match ExportService::export(&orch, None, &bundle) {
        Err(Error::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
}

#[test]
fn export_refuses_a_tampered_volume() {
    let dir = tempdir().unwrap();
    let (orch, _) = provisioned(dir.path(), None);
    let handoff = FakeHandoff::default();
    orch.boot(&handoff).unwrap();
    orch.unlock(PASSWORD, &handoff).unwrap();
    write_volume_file(&orch, VolumeKind::PreAuth, "index.bin", b"v1");

    // Mutation without a change notification.
    std::fs::write(
        orch.volumes().dir(VolumeKind::PreAuth).join("index.bin"),
        b"v2",
    )
    .unwrap();

    let bundle = dir.path().join("device.keystead");
    match ExportService::export(&orch, None, &bundle) {
        Err(Error::IntegrityMismatch { volume, .. }) => assert_eq!(volume, "preauth"),
        other => panic!("expected IntegrityMismatch, got {other:?}"),
    }
}

#[test]
fn rewrap_changes_password_across_restart() {
    let dir = tempdir().unwrap();
    let (orch, _) = provisioned(dir.path(), None);
    let handoff = FakeHandoff::default();
    orch.boot(&handoff).unwrap();
    orch.unlock(PASSWORD, &handoff).unwrap();
    orch.key_manager().rewrap_unlocked("rotated-password").unwrap();
    orch.lock();
    drop(orch);

    let orch = DualVolumeOrchestrator::with_params(dir.path(), None, fast_params()).unwrap();
    let handoff = FakeHandoff::default();
    orch.boot(&handoff).unwrap();
    match orch.unlock(PASSWORD, &handoff) {
        Err(Error::InvalidCredential) => {}
        other => panic!("old password must fail, got {other:?}"),
    }
    orch.unlock("rotated-password", &handoff).unwrap();
}
