//! On-disk volume layout and mount bookkeeping.
//!
//! The core never looks inside a volume: each one is a directory of opaque
//! ciphertext maintained by the storage subsystem. What the core tracks is
//! which volume is logically mounted, which credential path unlocked it, and
//! the last verified integrity hash.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key_manager::CredentialPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeKind {
    PreAuth,
    PostAuth,
}

impl VolumeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeKind::PreAuth => "preauth",
            VolumeKind::PostAuth => "postauth",
        }
    }
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub kind: VolumeKind,
    pub mounted: bool,
    pub unlocked_via: Option<CredentialPath>,
    pub last_verified_hash: Option<String>,
}

impl VolumeHandle {
    pub fn unmounted(kind: VolumeKind) -> Self {
        Self {
            kind,
            mounted: false,
            unlocked_via: None,
            last_verified_hash: None,
        }
    }
}

/// The two volume directories under one root.
#[derive(Debug, Clone)]
pub struct VolumeSet {
    root: PathBuf,
}

impl VolumeSet {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, kind: VolumeKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for kind in [VolumeKind::PreAuth, VolumeKind::PostAuth] {
            fs::create_dir_all(self.dir(kind))?;
        }
        Ok(())
    }
}
