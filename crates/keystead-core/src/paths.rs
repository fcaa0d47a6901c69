//! Well-known filesystem locations.

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{Error, Result};

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "keystead", "keystead")
        .ok_or(Error::InvalidState("no home directory available"))
}

/// Root for key-set records, the sealed pre-auth secret, integrity state
/// and the volume directories.
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn volumes_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("volumes"))
}

pub fn exports_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("exports"))
}

pub fn control_store_path() -> Result<PathBuf> {
    Ok(volumes_dir()?.join("postauth").join("control.db"))
}
