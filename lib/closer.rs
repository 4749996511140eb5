//! End-of-run descriptor disposal.
//!
//! With `close_very_late`, release and flush park their descriptors here
//! instead of closing them, trading descriptor-table growth for zero close
//! latency during the batch. The collected descriptors are closed when the
//! mount is torn down. Only sound under the rerun-on-failure contract.

use std::os::fd::OwnedFd;

use parking_lot::Mutex;

/// Descriptors whose close is postponed to process teardown.
#[derive(Debug, Default)]
pub struct DeferredCloser {
    fds: Mutex<Vec<OwnedFd>>,
}

impl DeferredCloser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `fd` until [`close_all`](Self::close_all) or drop.
    pub fn push(&self, fd: OwnedFd) {
        self.fds.lock().push(fd);
    }

    /// Close every parked descriptor now.
    pub fn close_all(&self) {
        self.fds.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.lock().is_empty()
    }
}
