//! Promised file handles.
//!
//! `create` and `open` hand a handle ID back to the kernel before the
//! backing descriptor necessarily exists. The slot behind the ID is
//! fulfilled by the (possibly deferred) open; every consumer of the handle
//! blocks on the slot until then. Each slot also lazily owns an anonymous
//! pipe used to hand write payloads from the kernel thread to the worker
//! without copying.
//!
//! Slots are never deallocated: freeing a handle pushes its ID onto a free
//! stack for reuse while the slot storage stays put, because queued work may
//! still hold a reference to it.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::unistd;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

/// Index into the handle table, handed to the kernel as `fh`.
pub type HandleId = u64;

#[derive(Debug, Default)]
struct SlotInner {
    /// The backing descriptor. `None` until the promised open fulfils it.
    fd: Option<OwnedFd>,
    /// Transfer pipe, created on first write through this handle.
    pipe: Option<(OwnedFd, OwnedFd)>,
}

/// One entry in the handle table.
#[derive(Debug, Default)]
pub struct HandleSlot {
    inner: Mutex<SlotInner>,
    opened: Condvar,
    /// Serializes write handoff; see [`lock_writes`](Self::lock_writes).
    write_order: Mutex<()>,
}

impl HandleSlot {
    /// Fulfil the promise. Once set, the descriptor stays set until the
    /// handle is freed.
    pub fn fulfil(&self, fd: OwnedFd) {
        let mut inner = self.inner.lock();
        inner.fd = Some(fd);
        self.opened.notify_all();
    }

    /// Block until the descriptor is set, then return the raw value.
    ///
    /// The slot keeps the descriptor open until the handle's release runs,
    /// which is ordered after every operation using it.
    pub fn fd(&self) -> RawFd {
        let mut inner = self.inner.lock();
        loop {
            if let Some(fd) = inner.fd.as_ref() {
                return fd.as_raw_fd();
            }
            self.opened.wait(&mut inner);
        }
    }

    /// Block until the descriptor is set, then take ownership of it,
    /// returning the slot to the unopened state.
    pub fn take_fd(&self) -> OwnedFd {
        let mut inner = self.inner.lock();
        loop {
            if let Some(fd) = inner.fd.take() {
                return fd;
            }
            self.opened.wait(&mut inner);
        }
    }

    /// Read end of the slot's transfer pipe.
    pub fn pipe_read_fd(&self) -> Result<RawFd, Errno> {
        self.pipe_end(false)
    }

    /// Write end of the slot's transfer pipe.
    pub fn pipe_write_fd(&self) -> Result<RawFd, Errno> {
        self.pipe_end(true)
    }

    /// Serialize write handoff for this handle.
    ///
    /// The guard is held while a write's event is drawn and its payload
    /// enters the transfer pipe, so pipe byte order always matches event
    /// order. Workers never take this lock; they only read the pipe.
    pub fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_order.lock()
    }

    fn pipe_end(&self, write_end: bool) -> Result<RawFd, Errno> {
        let mut inner = self.inner.lock();
        if inner.pipe.is_none() {
            inner.pipe = Some(unistd::pipe()?);
        }
        match inner.pipe.as_ref() {
            Some((read, write)) => Ok(if write_end {
                write.as_raw_fd()
            } else {
                read.as_raw_fd()
            }),
            None => Err(Errno::EIO),
        }
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.fd = None;
        inner.pipe = None;
    }
}

/// Append-only table of handle slots plus a free stack of released IDs.
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: RwLock<Vec<Arc<HandleSlot>>>,
    free: Mutex<Vec<HandleId>>,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a handle ID, reusing a freed slot when one is available.
    /// The slot stays in the "not yet opened" state until fulfilled.
    pub fn allocate(&self) -> HandleId {
        if let Some(id) = self.free.lock().pop() {
            return id;
        }
        let mut slots = self.slots.write();
        slots.push(Arc::new(HandleSlot::default()));
        (slots.len() - 1) as HandleId
    }

    /// The slot behind `id`.
    ///
    /// IDs come back from the kernel, which only ever sees values we handed
    /// out; an out-of-range ID is a protocol violation and panics.
    #[must_use]
    pub fn slot(&self, id: HandleId) -> Arc<HandleSlot> {
        Arc::clone(&self.slots.read()[id as usize])
    }

    /// Return `id` to the free stack. The slot is reset to the unopened
    /// state but its storage stays allocated; workers that still hold the
    /// slot see a closed promise, never a dangling reference.
    pub fn free(&self, id: HandleId) {
        self.slot(id).reset();
        self.free.lock().push(id);
    }
}
