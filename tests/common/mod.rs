#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::ffi::OsStr;
use std::path::PathBuf;

use hastefs::fs::ops::FsCore;
use hastefs::options::Options;
use tempfile::TempDir;

/// A core instance over a fresh backing directory.
pub struct Fixture {
    pub backing: TempDir,
    pub core: FsCore,
}

impl Fixture {
    /// Absolute path of `rel` inside the backing directory.
    pub fn backing_file(&self, rel: &str) -> PathBuf {
        self.backing.path().join(rel)
    }
}

pub fn fixture(options: Options) -> Fixture {
    let backing = tempfile::tempdir().unwrap();
    let core = FsCore::new(backing.path().to_path_buf(), options).unwrap();
    Fixture { backing, core }
}

pub fn os(s: &str) -> &OsStr {
    OsStr::new(s)
}
