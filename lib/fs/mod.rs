//! The passthrough filesystem.
//!
//! [`ops::FsCore`] implements the path-level operations against the backing
//! directory, wrapped in the ordering protocol; [`fuser::HasteFuse`] adapts
//! fuser's inode-addressed callbacks onto it via [`bridge::InodeBridge`].

/// Inode↔path mapping for the FUSE boundary.
pub mod bridge;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`ops::FsCore`].
pub mod fuser;
/// Path-level passthrough operations.
pub mod ops;

use std::ffi::OsString;

/// What kind of object a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(value: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt as _;
        if value.is_dir() {
            Self::Directory
        } else if value.is_symlink() {
            Self::Symlink
        } else if value.is_fifo() {
            Self::Fifo
        } else if value.is_socket() {
            Self::Socket
        } else if value.is_char_device() {
            Self::CharDevice
        } else if value.is_block_device() {
            Self::BlockDevice
        } else {
            Self::File
        }
    }
}

/// One entry of a directory snapshot.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}
