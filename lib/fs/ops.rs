//! Path-level passthrough operations.
//!
//! Each operation mirrors a host syscall issued against the backing
//! directory, wrapped in the ordering protocol: reads take a barrier on
//! their path before touching the backing filesystem, mutations are stamped
//! with an event ID and either run inline or are queued on the worker pool
//! per the [`Options`] record. Paths are mount-relative byte strings used
//! verbatim as ordering keys.

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{self, FileStat, Mode, SFlag};
use nix::sys::statvfs::{Statvfs, statvfs};
use nix::unistd::{self, AccessFlags};
use parking_lot::Mutex;
use tracing::debug;

use crate::closer::DeferredCloser;
use crate::dispatch::Dispatcher;
use crate::fs::{DirEntry, EntryKind};
use crate::handle::{HandleId, HandleTable};
use crate::options::Options;
use crate::order::OrderEngine;

/// A timestamp update: an explicit time, or "whatever now is when the
/// syscall runs".
#[derive(Debug, Clone, Copy)]
pub enum TimeRef {
    Time(std::time::SystemTime),
    Now,
}

/// Reply to a size-probing xattr read.
#[derive(Debug)]
pub enum XattrReply {
    /// The caller asked for the required buffer size.
    Size(u32),
    /// The attribute bytes.
    Data(Vec<u8>),
}

fn io_errno(error: &std::io::Error) -> Errno {
    Errno::from_raw(error.raw_os_error().unwrap_or(libc::EIO))
}

fn cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn check(ret: libc::c_int) -> Result<(), Errno> {
    if ret < 0 { Err(Errno::last()) } else { Ok(()) }
}

fn check_len(ret: isize) -> Result<usize, Errno> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as usize)
    }
}

fn fstat_fd(fd: RawFd) -> Result<FileStat, Errno> {
    let mut out = std::mem::MaybeUninit::<libc::stat>::uninit();
    check(unsafe { libc::fstat(fd, out.as_mut_ptr()) })?;
    // SAFETY: fstat filled the buffer on success.
    Ok(unsafe { out.assume_init() })
}

fn dup_fd(fd: RawFd) -> Result<OwnedFd, Errno> {
    let duplicate = unsafe { libc::dup(fd) };
    if duplicate < 0 {
        return Err(Errno::last());
    }
    // SAFETY: freshly duplicated descriptor, owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}

fn close_fd(fd: OwnedFd) -> Result<(), Errno> {
    use std::os::fd::IntoRawFd as _;
    check(unsafe { libc::close(fd.into_raw_fd()) })
}

fn timespec_of(time: Option<TimeRef>) -> libc::timespec {
    let omit = libc::timespec {
        tv_sec: 0,
        tv_nsec: libc::UTIME_OMIT,
    };
    match time {
        None => omit,
        Some(TimeRef::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeRef::Time(at)) => {
            let since = at
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            libc::timespec {
                tv_sec: since.as_secs() as libc::time_t,
                tv_nsec: since.subsec_nanos() as libc::c_long,
            }
        }
    }
}

/// The passthrough filesystem over one backing directory.
pub struct FsCore {
    root: PathBuf,
    options: Options,
    engine: Arc<OrderEngine>,
    dispatcher: Dispatcher,
    handles: Arc<HandleTable>,
    closer: DeferredCloser,
    /// Directory snapshots keyed by directory handle.
    dirs: Mutex<HashMap<u64, Arc<Vec<DirEntry>>>>,
    next_dir: AtomicU64,
}

impl FsCore {
    pub fn new(root: PathBuf, options: Options) -> std::io::Result<Self> {
        let engine = Arc::new(OrderEngine::new(options.restrictive_dirs));
        let dispatcher = Dispatcher::new(Arc::clone(&engine), options.worker_threads)?;
        Ok(Self {
            root,
            options,
            engine,
            dispatcher,
            handles: Arc::new(HandleTable::new()),
            closer: DeferredCloser::new(),
            dirs: Mutex::new(HashMap::new()),
            next_dir: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    fn full(&self, rel: &OsStr) -> PathBuf {
        self.root.join(Path::new(rel))
    }

    // ---- reads: barrier, then the host syscall ----

    pub fn getattr(&self, rel: &OsStr) -> Result<FileStat, Errno> {
        self.engine.barrier(rel);
        stat::lstat(&self.full(rel))
    }

    pub fn getattr_handle(&self, rel: &OsStr, handle: HandleId) -> Result<FileStat, Errno> {
        self.engine.barrier(rel);
        fstat_fd(self.handles.slot(handle).fd())
    }

    /// stat with no ordering. Used to synthesize immediate replies for
    /// metadata updates that are still queued.
    pub fn peek(&self, rel: &OsStr) -> Result<FileStat, Errno> {
        stat::lstat(&self.full(rel))
    }

    pub fn access(&self, rel: &OsStr, mask: i32) -> Result<(), Errno> {
        if self.options.very_eager_access {
            return Ok(());
        }
        // At least let the pending writes land.
        self.engine.barrier(rel);
        if self.options.eager_access {
            return Ok(());
        }
        unistd::access(&self.full(rel), AccessFlags::from_bits_truncate(mask))
    }

    pub fn readlink(&self, rel: &OsStr) -> Result<OsString, Errno> {
        self.engine.barrier(rel);
        std::fs::read_link(self.full(rel))
            .map(PathBuf::into_os_string)
            .map_err(|error| io_errno(&error))
    }

    pub fn statfs(&self, rel: &OsStr) -> Result<Statvfs, Errno> {
        self.engine.barrier(rel);
        statvfs(&self.full(rel))
    }

    pub fn read(
        &self,
        rel: &OsStr,
        handle: HandleId,
        offset: i64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        self.engine.barrier(rel);
        let fd = self.handles.slot(handle).fd();
        let mut buffer = vec![0_u8; size as usize];
        let count = check_len(unsafe {
            libc::pread(fd, buffer.as_mut_ptr().cast(), buffer.len(), offset)
        })?;
        buffer.truncate(count);
        Ok(buffer)
    }

    // ---- directory reads ----

    /// Snapshot the directory's entries and hand back a directory handle.
    /// The barrier widens to the whole filesystem when `restrictive_dirs`
    /// is set, so the listing observes every pending write in the mount.
    pub fn opendir(&self, rel: &OsStr) -> Result<u64, Errno> {
        self.engine.dir_barrier(rel);
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.full(rel)).map_err(|error| io_errno(&error))? {
            let entry = entry.map_err(|error| io_errno(&error))?;
            let kind = entry
                .file_type()
                .map(EntryKind::from)
                .unwrap_or(EntryKind::File);
            entries.push(DirEntry {
                name: entry.file_name(),
                kind,
            });
        }
        let id = self.next_dir.fetch_add(1, Ordering::Relaxed);
        self.dirs.lock().insert(id, Arc::new(entries));
        Ok(id)
    }

    /// The snapshot behind a directory handle.
    pub fn dir_entries(&self, dir: u64) -> Result<Arc<Vec<DirEntry>>, Errno> {
        self.dirs.lock().get(&dir).cloned().ok_or(Errno::EBADF)
    }

    pub fn releasedir(&self, dir: u64) {
        self.dirs.lock().remove(&dir);
    }

    // ---- inline mutations: no barrier, issued on the caller ----

    pub fn mknod(&self, rel: &OsStr, mode: u32, rdev: u64) -> Result<(), Errno> {
        let path = self.full(rel);
        let perm = Mode::from_bits_truncate(mode & !libc::S_IFMT);
        if mode & libc::S_IFMT == libc::S_IFIFO {
            unistd::mkfifo(&path, perm)
        } else {
            stat::mknod(
                &path,
                SFlag::from_bits_truncate(mode & libc::S_IFMT),
                perm,
                rdev as libc::dev_t,
            )
        }
    }

    pub fn mkdir(&self, rel: &OsStr, mode: u32) -> Result<(), Errno> {
        unistd::mkdir(&self.full(rel), Mode::from_bits_truncate(mode))
    }

    /// Pending writes to the path are not cancelled; they land on whatever
    /// the name resolves to afterwards.
    /// TODO: drop a path's queued writes on unlink instead of letting them
    /// land after the name is gone.
    pub fn unlink(&self, rel: &OsStr) -> Result<(), Errno> {
        unistd::unlink(&self.full(rel))
    }

    pub fn rmdir(&self, rel: &OsStr) -> Result<(), Errno> {
        std::fs::remove_dir(self.full(rel)).map_err(|error| io_errno(&error))
    }

    pub fn symlink(&self, target: &OsStr, rel: &OsStr) -> Result<(), Errno> {
        std::os::unix::fs::symlink(Path::new(target), self.full(rel))
            .map_err(|error| io_errno(&error))
    }

    /// Rename holds the source exclusively: every pending write to it lands
    /// first, and nothing new touches it until the rename returns.
    pub fn rename(&self, from: &OsStr, to: &OsStr, flags: u32) -> Result<(), Errno> {
        if flags != 0 {
            return Err(Errno::EINVAL);
        }
        let _held = self.engine.exclusive(from);
        std::fs::rename(self.full(from), self.full(to)).map_err(|error| io_errno(&error))
    }

    pub fn truncate(&self, rel: &OsStr, size: i64) -> Result<(), Errno> {
        unistd::truncate(&self.full(rel), size)
    }

    pub fn truncate_handle(&self, handle: HandleId, size: i64) -> Result<(), Errno> {
        check(unsafe { libc::ftruncate(self.handles.slot(handle).fd(), size) })
    }

    // ---- deferred mutations ----

    pub fn link(&self, from: &OsStr, to: &OsStr) -> Result<(), Errno> {
        let root = self.root.clone();
        self.dispatcher
            .submit_pair(self.options.eager_link, from, to, move |from, to| {
                std::fs::hard_link(root.join(Path::new(from)), root.join(Path::new(to)))
                    .map_err(|error| io_errno(&error))
            })
    }

    pub fn chmod(&self, rel: &OsStr, mode: u32) -> Result<(), Errno> {
        let root = self.root.clone();
        self.dispatcher
            .submit(self.options.eager_chmod, rel, move |rel| {
                use std::os::unix::fs::PermissionsExt as _;
                std::fs::set_permissions(
                    root.join(Path::new(rel)),
                    std::fs::Permissions::from_mode(mode),
                )
                .map_err(|error| io_errno(&error))
            })
    }

    pub fn chown(&self, rel: &OsStr, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
        let root = self.root.clone();
        self.dispatcher
            .submit(self.options.eager_chown, rel, move |rel| {
                let path = cstring(&root.join(Path::new(rel)))?;
                check(unsafe {
                    libc::lchown(
                        path.as_ptr(),
                        uid.unwrap_or(u32::MAX),
                        gid.unwrap_or(u32::MAX),
                    )
                })
            })
    }

    pub fn utimens(
        &self,
        rel: &OsStr,
        atime: Option<TimeRef>,
        mtime: Option<TimeRef>,
    ) -> Result<(), Errno> {
        let root = self.root.clone();
        self.dispatcher
            .submit(self.options.eager_utimens, rel, move |rel| {
                let path = cstring(&root.join(Path::new(rel)))?;
                let times = [timespec_of(atime), timespec_of(mtime)];
                check(unsafe {
                    libc::utimensat(
                        libc::AT_FDCWD,
                        path.as_ptr(),
                        times.as_ptr(),
                        libc::AT_SYMLINK_NOFOLLOW,
                    )
                })
            })
    }

    /// Promise a handle for a new file and queue the open that backs it.
    /// The returned handle is valid immediately; consumers block on the
    /// slot until the open lands.
    pub fn create(&self, rel: &OsStr, mode: u32, flags: i32) -> Result<HandleId, Errno> {
        let handle = self.handles.allocate();
        let slot = self.handles.slot(handle);
        let root = self.root.clone();
        let submitted = self
            .dispatcher
            .submit(self.options.eager_create, rel, move |rel| {
                let fd = nix::fcntl::open(
                    &root.join(Path::new(rel)),
                    OFlag::from_bits_truncate(flags) | OFlag::O_CREAT,
                    Mode::from_bits_truncate(mode),
                )?;
                // SAFETY: freshly opened descriptor, owned by the slot from
                // here on.
                slot.fulfil(unsafe { OwnedFd::from_raw_fd(fd) });
                Ok(())
            });
        match submitted {
            Ok(()) => Ok(handle),
            Err(errno) => {
                self.handles.free(handle);
                Err(errno)
            }
        }
    }

    /// Open an existing file. The open itself is issued on the caller;
    /// only the handle indirection is shared with `create`.
    pub fn open(&self, rel: &OsStr, flags: i32) -> Result<HandleId, Errno> {
        let fd = nix::fcntl::open(
            &self.full(rel),
            OFlag::from_bits_truncate(flags),
            Mode::empty(),
        )?;
        let handle = self.handles.allocate();
        // SAFETY: freshly opened descriptor, owned by the slot from here on.
        self.handles
            .slot(handle)
            .fulfil(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(handle)
    }

    /// Queue a write and hand its payload to the worker through the
    /// handle's pipe. The payload is consumed on the calling thread before
    /// returning, so the kernel's buffer can be reused immediately; the
    /// worker splices it from the pipe into the backing file at `offset`.
    pub fn write(
        &self,
        rel: &OsStr,
        handle: HandleId,
        offset: i64,
        data: &[u8],
    ) -> Result<u32, Errno> {
        let slot = self.handles.slot(handle);
        let size = data.len();

        // All writes on a handle share one FIFO pipe, and each worker
        // splices exactly `size` bytes in event order. The handle's write
        // lock is held across queueing and the pipe fill so payload bytes
        // enter the pipe in the same order their events are drawn, even
        // with concurrent dispatch threads. Queueing comes first inside the
        // critical section: a payload larger than the pipe capacity drains
        // against its own worker instead of deadlocking.
        let _order = slot.lock_writes();
        self.dispatcher.submit(true, rel, {
            let slot = Arc::clone(&slot);
            move |_| {
                let fd = slot.fd();
                let pipe = slot.pipe_read_fd()?;
                let mut file_offset = offset;
                let mut remaining = size;
                while remaining > 0 {
                    let moved = check_len(unsafe {
                        libc::splice(
                            pipe,
                            std::ptr::null_mut(),
                            fd,
                            &mut file_offset,
                            remaining,
                            0,
                        )
                    })?;
                    if moved == 0 {
                        return Err(Errno::EIO);
                    }
                    remaining -= moved;
                }
                Ok(())
            }
        })?;

        // Fill the pipe, exactly `size` bytes. If the worker lags and the
        // pipe fills, this blocks in the kernel: that is the intended
        // backpressure.
        let pipe = slot.pipe_write_fd()?;
        let mut written = 0;
        while written < size {
            written += check_len(unsafe {
                libc::write(pipe, data[written..].as_ptr().cast(), size - written)
            })?;
        }
        Ok(size as u32)
    }

    /// Flush is sent on every close of a duplicated descriptor; the handle
    /// itself stays open, so only a duplicate is closed.
    pub fn flush(&self, rel: &OsStr, handle: HandleId) -> Result<(), Errno> {
        let slot = self.handles.slot(handle);
        if self.options.close_very_late {
            self.closer.push(dup_fd(slot.fd())?);
            return Ok(());
        }
        self.dispatcher
            .submit(self.options.eager_close, rel, move |_| {
                close_fd(dup_fd(slot.fd())?)
            })
    }

    pub fn release(&self, rel: &OsStr, handle: HandleId) -> Result<(), Errno> {
        let slot = self.handles.slot(handle);
        if self.options.close_very_late {
            // Keep the open file alive until teardown through a duplicate.
            // The slot itself is torn down behind the handle's queued
            // writes below, so pending splices still find their descriptor
            // and pipe.
            self.closer.push(dup_fd(slot.fd())?);
        }
        let handles = Arc::clone(&self.handles);
        self.dispatcher
            .submit(self.options.eager_close, rel, move |_| {
                let closed = close_fd(slot.take_fd());
                handles.free(handle);
                closed
            })
    }

    pub fn fsync(&self, rel: &OsStr, handle: HandleId, datasync: bool) -> Result<(), Errno> {
        if self.options.ignore_fsync {
            return Ok(());
        }
        let slot = self.handles.slot(handle);
        self.dispatcher
            .submit(self.options.eager_fsync, rel, move |_| {
                let fd = slot.fd();
                if datasync {
                    check(unsafe { libc::fdatasync(fd) })
                } else {
                    check(unsafe { libc::fsync(fd) })
                }
            })
    }

    pub fn fallocate(
        &self,
        rel: &OsStr,
        handle: HandleId,
        offset: i64,
        length: i64,
        mode: i32,
    ) -> Result<(), Errno> {
        if mode != 0 {
            return Err(Errno::EOPNOTSUPP);
        }
        let slot = self.handles.slot(handle);
        self.dispatcher.submit(true, rel, move |_| {
            let ret = unsafe { libc::posix_fallocate(slot.fd(), offset, length) };
            if ret == 0 {
                Ok(())
            } else {
                Err(Errno::from_raw(ret))
            }
        })
    }

    // ---- xattr family: barrier, then the host syscall ----

    pub fn getxattr(&self, rel: &OsStr, name: &OsStr, size: u32) -> Result<XattrReply, Errno> {
        self.engine.barrier(rel);
        let path = cstring(&self.full(rel))?;
        let name = CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)?;
        if size == 0 {
            let needed = check_len(unsafe {
                libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
            })?;
            return Ok(XattrReply::Size(needed as u32));
        }
        let mut buffer = vec![0_u8; size as usize];
        let len = check_len(unsafe {
            libc::lgetxattr(
                path.as_ptr(),
                name.as_ptr(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
            )
        })?;
        buffer.truncate(len);
        Ok(XattrReply::Data(buffer))
    }

    pub fn listxattr(&self, rel: &OsStr, size: u32) -> Result<XattrReply, Errno> {
        self.engine.barrier(rel);
        let path = cstring(&self.full(rel))?;
        if size == 0 {
            let needed =
                check_len(unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) })?;
            return Ok(XattrReply::Size(needed as u32));
        }
        let mut buffer = vec![0_u8; size as usize];
        let len = check_len(unsafe {
            libc::llistxattr(path.as_ptr(), buffer.as_mut_ptr().cast(), buffer.len())
        })?;
        buffer.truncate(len);
        Ok(XattrReply::Data(buffer))
    }

    pub fn setxattr(
        &self,
        rel: &OsStr,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        self.engine.barrier(rel);
        let path = cstring(&self.full(rel))?;
        let name = CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)?;
        check(unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        })
    }

    pub fn removexattr(&self, rel: &OsStr, name: &OsStr) -> Result<(), Errno> {
        self.engine.barrier(rel);
        let path = cstring(&self.full(rel))?;
        let name = CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)?;
        check(unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) })
    }

    // ---- lifecycle ----

    /// Drain the worker pool and close parked descriptors. Called after the
    /// FUSE session ends; every deferred operation completes before this
    /// returns.
    pub fn shutdown(&self) {
        self.dispatcher.drain();
        let parked = self.closer.len();
        if parked > 0 {
            debug!(parked, "closing descriptors parked for teardown");
        }
        self.closer.close_all();
    }
}
