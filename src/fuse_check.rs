//! FUSE availability checks.
//!
//! Mounting fails late and cryptically when the fuse kernel module or the
//! fusermount helper is missing; check up front so the operator gets an
//! actionable message before any worker threads start.

use std::path::{Path, PathBuf};

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The fuse device node is absent.
    #[error(
        "/dev/fuse is missing. Load the kernel module (`modprobe fuse`) or \
         install the fuse3 package."
    )]
    DeviceMissing,

    /// No fusermount helper was found.
    #[error(
        "neither `fusermount3` nor `fusermount` was found in PATH. Install \
         the fuse3 package."
    )]
    HelperMissing,
}

/// Verify that FUSE is installed and usable.
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !Path::new("/dev/fuse").exists() {
        return Err(FuseCheckError::DeviceMissing);
    }
    if find_in_path("fusermount3").is_none() && find_in_path("fusermount").is_none() {
        return Err(FuseCheckError::HelperMissing);
    }
    Ok(())
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
