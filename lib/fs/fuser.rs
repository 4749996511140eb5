//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`FsCore`](super::ops::FsCore).
//!
//! fuser addresses everything by inode number; the adapter resolves inodes
//! to mount-relative paths through the [`InodeBridge`](super::bridge::InodeBridge)
//! and calls the path-level core. Synchronous callbacks block the dispatch
//! thread until their barrier clears and their syscall returns; deferred
//! callbacks reply success as soon as the core has queued the work.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{MountOption, TimeOrNow};
use nix::errno::Errno;
use nix::sys::stat::FileStat;
use tracing::{debug, instrument};

use super::EntryKind;
use super::bridge::{InodeBridge, ROOT_INO};
use super::ops::{FsCore, TimeRef, XattrReply};

/// How long the kernel may cache entries and attributes. Kept short because
/// deferred metadata updates land behind the reply that reported them.
const TTL: Duration = Duration::from_secs(1);

/// Trait abstracting the `.error(errno)` method common to all fuser reply
/// types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyData,
    fuser::ReplyOpen,
    fuser::ReplyWrite,
    fuser::ReplyCreate,
    fuser::ReplyEmpty,
    fuser::ReplyStatfs,
    fuser::ReplyXattr,
    fuser::ReplyDirectory,
);

/// Extension trait on `Result<T, Errno>` centralizing the errno-reply path,
/// so each callback only expresses its success shape.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, Errno> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(value) => on_ok(value, reply),
            Err(errno) => {
                debug!(%errno, "replying error");
                reply.error(errno as i32);
            }
        }
    }
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn kind_of_mode(mode: u32) -> fuser::FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => fuser::FileType::Directory,
        libc::S_IFLNK => fuser::FileType::Symlink,
        libc::S_IFIFO => fuser::FileType::NamedPipe,
        libc::S_IFSOCK => fuser::FileType::Socket,
        libc::S_IFCHR => fuser::FileType::CharDevice,
        libc::S_IFBLK => fuser::FileType::BlockDevice,
        _ => fuser::FileType::RegularFile,
    }
}

fn stat_to_attr(stat: &FileStat, ino: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: system_time(stat.st_atime, stat.st_atime_nsec),
        mtime: system_time(stat.st_mtime, stat.st_mtime_nsec),
        ctime: system_time(stat.st_ctime, stat.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: kind_of_mode(stat.st_mode),
        perm: (stat.st_mode & 0o7777) as u16,
        nlink: stat.st_nlink as u32,
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
        flags: 0,
    }
}

impl From<EntryKind> for fuser::FileType {
    fn from(value: EntryKind) -> Self {
        match value {
            EntryKind::File => Self::RegularFile,
            EntryKind::Directory => Self::Directory,
            EntryKind::Symlink => Self::Symlink,
            EntryKind::Fifo => Self::NamedPipe,
            EntryKind::Socket => Self::Socket,
            EntryKind::CharDevice => Self::CharDevice,
            EntryKind::BlockDevice => Self::BlockDevice,
        }
    }
}

fn time_ref(value: TimeOrNow) -> TimeRef {
    match value {
        TimeOrNow::SpecificTime(at) => TimeRef::Time(at),
        TimeOrNow::Now => TimeRef::Now,
    }
}

/// The fuser-facing filesystem.
pub struct HasteFuse {
    core: Arc<FsCore>,
    bridge: InodeBridge,
}

impl HasteFuse {
    #[must_use]
    pub fn new(core: Arc<FsCore>) -> Self {
        Self {
            core,
            bridge: InodeBridge::new(),
        }
    }

    fn rel_of(&self, ino: u64) -> Result<OsString, Errno> {
        self.bridge.path_of(ino).ok_or(Errno::ESTALE)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<OsString, Errno> {
        self.bridge.child_path(parent, name).ok_or(Errno::ESTALE)
    }

    /// Barriered stat of `rel` as a fuser attr, allocating an inode on
    /// first sight.
    fn entry_attr(&self, rel: &OsStr) -> Result<fuser::FileAttr, Errno> {
        let stat = self.core.getattr(rel)?;
        Ok(stat_to_attr(&stat, self.bridge.ino_of(rel)))
    }

    /// Inode of `rel`'s parent directory, for the `..` entry.
    fn parent_ino(&self, rel: &OsStr) -> u64 {
        match Path::new(rel).parent() {
            Some(parent) => self.bridge.ino_of(parent.as_os_str()),
            None => ROOT_INO,
        }
    }

    #[expect(
        clippy::too_many_arguments,
        reason = "mirrors the fuser setattr callback"
    )]
    fn apply_setattr(
        &self,
        rel: &OsStr,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<fuser::FileAttr, Errno> {
        if let Some(mode) = mode {
            self.core.chmod(rel, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.core.chown(rel, uid, gid)?;
        }
        if let Some(size) = size {
            match fh {
                Some(fh) => self.core.truncate_handle(fh, size as i64)?,
                None => self.core.truncate(rel, size as i64)?,
            }
        }
        if atime.is_some() || mtime.is_some() {
            self.core
                .utimens(rel, atime.map(time_ref), mtime.map(time_ref))?;
        }

        // The updates may still be queued: answer with the current stat
        // patched with the requested values. The next barriered getattr
        // observes the real outcome. Fall back to a barriered stat when the
        // file itself is still being created.
        let stat = match self.core.peek(rel) {
            Ok(stat) => stat,
            Err(_) => self.core.getattr(rel)?,
        };
        let mut attr = stat_to_attr(&stat, self.bridge.ino_of(rel));
        if let Some(mode) = mode {
            attr.perm = (mode & 0o7777) as u16;
        }
        if let Some(uid) = uid {
            attr.uid = uid;
        }
        if let Some(gid) = gid {
            attr.gid = gid;
        }
        if let Some(size) = size {
            attr.size = size;
        }
        if let Some(TimeOrNow::SpecificTime(at)) = atime {
            attr.atime = at;
        }
        if let Some(TimeOrNow::SpecificTime(at)) = mtime {
            attr.mtime = at;
        }
        Ok(attr)
    }

    /// Attr for a create reply. The open may still be queued, so a missing
    /// file is reported as the empty regular file it is about to become.
    fn create_attr(&self, rel: &OsStr, mode: u32, uid: u32, gid: u32) -> fuser::FileAttr {
        let ino = self.bridge.ino_of(rel);
        match self.core.peek(rel) {
            Ok(stat) => stat_to_attr(&stat, ino),
            Err(_) => {
                let now = SystemTime::now();
                fuser::FileAttr {
                    ino,
                    size: 0,
                    blocks: 0,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    crtime: now,
                    kind: fuser::FileType::RegularFile,
                    perm: (mode & 0o7777) as u16,
                    nlink: 1,
                    uid,
                    gid,
                    rdev: 0,
                    blksize: 4096,
                    flags: 0,
                }
            }
        }
    }
}

impl fuser::Filesystem for HasteFuse {
    #[instrument(name = "HasteFuse::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.child_of(parent, name)
            .and_then(|rel| self.entry_attr(&rel))
            .fuse_reply(reply, |attr, reply| reply.entry(&TTL, &attr, 0));
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.rel_of(ino)
            .and_then(|rel| match fh {
                Some(fh) => self.core.getattr_handle(&rel, fh),
                None => self.core.getattr(&rel),
            })
            .map(|stat| stat_to_attr(&stat, ino))
            .fuse_reply(reply, |attr, reply| reply.attr(&TTL, &attr));
    }

    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.apply_setattr(&rel, mode, uid, gid, size, atime, mtime, fh))
            .fuse_reply(reply, |attr, reply| reply.attr(&TTL, &attr));
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        use std::os::unix::ffi::OsStrExt as _;
        self.rel_of(ino)
            .and_then(|rel| self.core.readlink(&rel))
            .fuse_reply(reply, |target, reply| reply.data(target.as_bytes()));
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.child_of(parent, name)
            .and_then(|rel| {
                self.core.mknod(&rel, mode & !umask, u64::from(rdev))?;
                self.entry_attr(&rel)
            })
            .fuse_reply(reply, |attr, reply| reply.entry(&TTL, &attr, 0));
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.child_of(parent, name)
            .and_then(|rel| {
                self.core.mkdir(&rel, mode & !umask)?;
                self.entry_attr(&rel)
            })
            .fuse_reply(reply, |attr, reply| reply.entry(&TTL, &attr, 0));
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child_of(parent, name)
            .and_then(|rel| self.core.unlink(&rel))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child_of(parent, name)
            .and_then(|rel| self.core.rmdir(&rel))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        self.child_of(parent, link_name)
            .and_then(|rel| {
                self.core.symlink(target.as_os_str(), &rel)?;
                self.entry_attr(&rel)
            })
            .fuse_reply(reply, |attr, reply| reply.entry(&TTL, &attr, 0));
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let renamed = self.child_of(parent, name).and_then(|from| {
            let to = self.child_of(newparent, newname)?;
            self.core.rename(&from, &to, flags)?;
            self.bridge.rename(&from, &to);
            Ok(())
        });
        renamed.fuse_reply(reply, |(), reply| reply.ok());
    }

    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let linked = self.rel_of(ino).and_then(|from| {
            let to = self.child_of(newparent, newname)?;
            self.core.link(&from, &to)?;
            // The link may still be queued; the source carries the same
            // inode, so answer from it without waiting.
            let stat = match self.core.peek(&from) {
                Ok(stat) => stat,
                Err(_) => self.core.getattr(&from)?,
            };
            Ok(stat_to_attr(&stat, self.bridge.ino_of(&to)))
        });
        linked.fuse_reply(reply, |attr, reply| reply.entry(&TTL, &attr, 0));
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        self.rel_of(ino)
            .and_then(|rel| self.core.open(&rel, flags))
            .fuse_reply(reply, |fh, reply| reply.opened(fh, 0));
    }

    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let mode = mode & !umask;
        let uid = req.uid();
        let gid = req.gid();
        self.child_of(parent, name)
            .and_then(|rel| {
                let fh = self.core.create(&rel, mode, flags)?;
                Ok((self.create_attr(&rel, mode, uid, gid), fh))
            })
            .fuse_reply(reply, |(attr, fh), reply| {
                reply.created(&TTL, &attr, 0, fh, 0);
            });
    }

    #[instrument(name = "HasteFuse::read", skip(self, _req, _flags, _lock_owner, reply))]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.read(&rel, fh, offset, size))
            .fuse_reply(reply, |data, reply| reply.data(&data));
    }

    #[instrument(
        name = "HasteFuse::write",
        skip(self, _req, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.write(&rel, fh, offset, data))
            .fuse_reply(reply, |written, reply| reply.written(written));
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.flush(&rel, fh))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.release(&rel, fh))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.fsync(&rel, fh, datasync))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.opendir(&rel))
            .fuse_reply(reply, |dh, reply| reply.opened(dh, 0));
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let listing = self
            .rel_of(ino)
            .and_then(|rel| Ok((self.core.dir_entries(fh)?, rel)));
        let (entries, rel) = match listing {
            Ok(found) => found,
            Err(errno) => return reply.error(errno as i32),
        };

        // Offsets 0 and 1 are the synthetic dot entries; snapshot entries
        // start at 2.
        for index in offset..entries.len() as i64 + 2 {
            let full = match index {
                0 => reply.add(ino, 1, fuser::FileType::Directory, "."),
                1 => reply.add(self.parent_ino(&rel), 2, fuser::FileType::Directory, ".."),
                _ => {
                    let entry = &entries[(index - 2) as usize];
                    let child_ino = match self.bridge.child_path(ino, &entry.name) {
                        Some(child) => self.bridge.ino_of(&child),
                        None => ino,
                    };
                    reply.add(child_ino, index + 1, entry.kind.into(), &entry.name)
                }
            };
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.core.releasedir(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        self.rel_of(ino)
            .and_then(|rel| self.core.statfs(&rel))
            .fuse_reply(reply, |vfs, reply| {
                reply.statfs(
                    vfs.blocks(),
                    vfs.blocks_free(),
                    vfs.blocks_available(),
                    vfs.files(),
                    vfs.files_free(),
                    vfs.block_size() as u32,
                    vfs.name_max() as u32,
                    vfs.fragment_size() as u32,
                );
            });
    }

    fn setxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.setxattr(&rel, name, value, flags))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.getxattr(&rel, name, size))
            .fuse_reply(reply, |found, reply| match found {
                XattrReply::Size(needed) => reply.size(needed),
                XattrReply::Data(data) => reply.data(&data),
            });
    }

    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.listxattr(&rel, size))
            .fuse_reply(reply, |found, reply| match found {
                XattrReply::Size(needed) => reply.size(needed),
                XattrReply::Data(data) => reply.data(&data),
            });
    }

    fn removexattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.removexattr(&rel, name))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        self.rel_of(ino)
            .and_then(|rel| self.core.access(&rel, mask))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn fallocate(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.rel_of(ino)
            .and_then(|rel| self.core.fallocate(&rel, fh, offset, length, mode))
            .fuse_reply(reply, |(), reply| reply.ok());
    }
}

/// Mount the filesystem and block until the session ends.
///
/// The caller is responsible for draining the core afterwards so that every
/// deferred operation completes before exit.
pub fn mount(core: Arc<FsCore>, mountpoint: &Path, allow_other: bool) -> std::io::Result<()> {
    let mut options = vec![MountOption::FSName("hastefs".to_owned()), MountOption::RW];
    if allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }
    fuser::mount2(HasteFuse::new(core), mountpoint, &options)
}
