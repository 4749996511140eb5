//! Lock-free bidirectional inode/path mapping.
//!
//! fuser addresses files by inode number while the ordering engine and the
//! backing filesystem work on mount-relative paths. [`InodeBridge`] keeps
//! both directions in `scc::HashMap`s. Insertion order: forward map first,
//! then backward map, so any observer that discovers an inode via the
//! backward map can immediately resolve its path.
//!
//! Mappings live until process exit. A path the kernel has seen once keeps
//! its inode even after unlink, so a worker holding the path never observes
//! it vanish; rename repoints the moved entry and leaves descendants to be
//! re-resolved by later lookups.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// The inode number fuser reserves for the mount root. Maps to the empty
/// relative path.
pub const ROOT_INO: u64 = 1;

/// Bidirectional mapping between kernel inode numbers and relative paths.
pub struct InodeBridge {
    /// ino -> relative path
    fwd: scc::HashMap<u64, OsString>,
    /// relative path -> ino
    bwd: scc::HashMap<OsString, u64>,
    next: AtomicU64,
}

impl InodeBridge {
    #[must_use]
    pub fn new() -> Self {
        let bridge = Self {
            fwd: scc::HashMap::new(),
            bwd: scc::HashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        bridge.insert(ROOT_INO, OsString::new());
        bridge
    }

    fn insert(&self, ino: u64, path: OsString) {
        let _ = self.fwd.insert(ino, path.clone());
        let _ = self.bwd.insert(path, ino);
    }

    /// Relative path for `ino`, if the kernel ever received this inode.
    #[must_use]
    pub fn path_of(&self, ino: u64) -> Option<OsString> {
        self.fwd.read(&ino, |_, path| path.clone())
    }

    /// Inode for `path`, allocating one on first observation.
    pub fn ino_of(&self, path: &OsStr) -> u64 {
        if let Some(ino) = self.bwd.read(path, |_, &ino| ino) {
            return ino;
        }
        let candidate = self.next.fetch_add(1, Ordering::Relaxed);
        let ino = *self
            .bwd
            .entry(path.to_os_string())
            .or_insert(candidate)
            .get();
        if ino == candidate {
            let _ = self.fwd.insert(ino, path.to_os_string());
        }
        ino
    }

    /// Path of `name` under the directory mapped to `parent`.
    #[must_use]
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<OsString> {
        let parent_path = self.path_of(parent)?;
        let mut path = PathBuf::from(parent_path);
        path.push(name);
        Some(path.into_os_string())
    }

    /// Repoint `from`'s inode at `to` after a rename. An overwritten
    /// target's old mapping is dropped; the moved entry keeps its inode.
    pub fn rename(&self, from: &OsStr, to: &OsStr) {
        let Some((_, ino)) = self.bwd.remove(from) else {
            return;
        };
        if let Some((_, stale)) = self.bwd.remove(to) {
            self.fwd.remove(&stale);
        }
        self.fwd.remove(&ino);
        self.insert(ino, to.to_os_string());
    }
}

impl Default for InodeBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn root_maps_to_the_empty_path() {
        let bridge = InodeBridge::new();
        assert_eq!(bridge.path_of(ROOT_INO), Some(OsString::new()));
        assert_eq!(bridge.ino_of(os("")), ROOT_INO);
    }

    #[test]
    fn ino_of_is_stable_per_path() {
        let bridge = InodeBridge::new();
        let a = bridge.ino_of(os("a/b"));
        assert_eq!(bridge.ino_of(os("a/b")), a);
        assert_ne!(bridge.ino_of(os("a/c")), a);
        assert_eq!(bridge.path_of(a), Some(OsString::from("a/b")));
    }

    #[test]
    fn child_path_joins_under_the_parent() {
        let bridge = InodeBridge::new();
        assert_eq!(
            bridge.child_path(ROOT_INO, os("f")),
            Some(OsString::from("f"))
        );
        let dir = bridge.ino_of(os("d"));
        assert_eq!(
            bridge.child_path(dir, os("f")),
            Some(OsString::from("d/f"))
        );
        assert_eq!(bridge.child_path(999, os("f")), None);
    }

    #[test]
    fn rename_moves_the_inode_and_drops_the_overwritten_target() {
        let bridge = InodeBridge::new();
        let src = bridge.ino_of(os("src"));
        let dst = bridge.ino_of(os("dst"));
        bridge.rename(os("src"), os("dst"));
        assert_eq!(bridge.ino_of(os("dst")), src);
        assert_eq!(bridge.path_of(src), Some(OsString::from("dst")));
        assert_eq!(bridge.path_of(dst), None);
    }
}
