//! Key lifecycle and dual-volume encryption core for a self-hosted device.
//!
//! The crate owns four concerns:
//!
//! - **Key lifecycle** ([`KeyManager`]): a master volume secret wrapped
//!   independently under an admin password and a recovery phrase, unlocked
//!   into zeroed-on-lock memory.
//! - **Dual-volume orchestration** ([`DualVolumeOrchestrator`]): a pre-auth
//!   volume released by a hardware sealer at boot and a post-auth volume
//!   released by the admin credential, with a storage-subsystem handoff at
//!   each phase transition.
//! - **Control store** ([`ControlStore`]): the small SQLite database of
//!   device control state, with a monotonic revision and content checksum
//!   maintained transactionally.
//! - **Export/import** ([`ExportService`]) and **integrity checkpoints**
//!   ([`IntegrityChecker`]): signed encrypted bundles that restore
//!   all-or-nothing, and tamper detection at boot, unlock and pre-export.
//!
//! Encryption of bulk volume data is the storage subsystem's job; this
//! crate hands it keys and never sees plaintext contents.

pub mod control_store;
pub mod crypto;
pub mod error;
pub mod export;
pub mod integrity;
pub mod key_manager;
pub mod keyset;
pub mod orchestrator;
pub mod paths;
pub mod sealer;
pub mod volume;

pub use control_store::{AppRow, ControlStore, EventRow, Meta};
pub use crypto::KdfParams;
pub use error::{Error, Result};
pub use export::{ExportManifest, ExportService};
pub use integrity::{Checkpoint, IntegrityAlert, IntegrityChecker};
pub use key_manager::{CredentialPath, KeyManager};
pub use orchestrator::{BootOutcome, DualVolumeOrchestrator, StorageHandoff};
pub use sealer::HardwareSealer;
pub use volume::{VolumeHandle, VolumeKind, VolumeSet};
