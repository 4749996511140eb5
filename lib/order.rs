//! Per-path operation ordering.
//!
//! Every mutating operation is stamped with an event ID from a global
//! monotonic clock and registered against the state record of the path (or
//! paths) it touches. A reader of a path waits until every event registered
//! before it has completed; a deferred writer waits for its in-flight
//! predecessors on the same path before issuing its syscall, so same-path
//! syscalls retire in submission order.
//!
//! Registration happens on the submitting thread, completion on whichever
//! thread ran the operation. The window between the two is exactly the
//! "illusion of synchronous semantics": the caller has already been told the
//! operation succeeded, and the records here make sure nobody reads the path
//! until that becomes true.
//!
//! The empty path is a distinguished record meaning "the whole filesystem".
//! With `restrictive_dirs`, per-path writes also register there so directory
//! listings order against every pending write in the mount.

use std::collections::{BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

/// Identifier stamped on every submitted operation. Zero means "no event";
/// IDs are never reused.
pub type EventId = u64;

/// Monotonic source of event IDs.
#[derive(Debug)]
struct EventClock {
    next: AtomicU64,
}

impl EventClock {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn tick(&self) -> EventId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct PathHistory {
    /// ID of the most recent operation registered for this path. Only grows.
    last_event: EventId,
    /// Events registered for this path that have not yet completed.
    in_flight: BTreeSet<EventId>,
}

/// State record for one path. Created on first touch, never evicted; the
/// `Arc` around it gives background workers a stable reference across map
/// growth.
#[derive(Debug, Default)]
pub struct PathState {
    history: Mutex<PathHistory>,
    completed: Condvar,
}

impl PathState {
    fn register(&self, event: EventId) {
        let mut history = self.history.lock();
        history.in_flight.insert(event);
        if event > history.last_event {
            history.last_event = event;
        }
    }

    fn complete(&self, event: EventId) {
        let mut history = self.history.lock();
        history.in_flight.remove(&event);
        // Notify while holding the lock: a reader between its membership
        // check and its wait must not miss the wakeup.
        self.completed.notify_all();
    }

    /// Wait until every event registered before this call has completed.
    ///
    /// Waiting for the snapshot of `last_event` is sufficient: any event
    /// registered afterwards has a larger ID and is not part of this
    /// reader's history.
    fn wait_settled(&self) {
        let mut history = self.history.lock();
        let last = history.last_event;
        while history.in_flight.range(..=last).next().is_some() {
            self.completed.wait(&mut history);
        }
    }

    /// Wait until no event older than `event` is in flight.
    fn wait_predecessors(&self, event: EventId) {
        let mut history = self.history.lock();
        while history.in_flight.range(..event).next().is_some() {
            self.completed.wait(&mut history);
        }
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        !self.history.lock().in_flight.is_empty()
    }
}

/// Map from path to its state record.
///
/// Re-touching a known path takes only the shared lock; the exclusive slow
/// path re-checks under the write lock so racing creators agree on a single
/// record. Paths are used verbatim, with no canonicalization.
#[derive(Debug, Default)]
struct PathStateMap {
    paths: RwLock<HashMap<OsString, Arc<PathState>>>,
}

impl PathStateMap {
    fn get_or_insert(&self, path: &OsStr) -> Arc<PathState> {
        if let Some(state) = self.paths.read().get(path) {
            return Arc::clone(state);
        }
        let mut paths = self.paths.write();
        Arc::clone(paths.entry(path.to_os_string()).or_default())
    }

    fn get(&self, path: &OsStr) -> Option<Arc<PathState>> {
        self.paths.read().get(path).map(Arc::clone)
    }
}

/// Guard for one registered mutating operation.
///
/// Registration happens at construction on the submitting thread; dropping
/// the guard marks the event complete on every touched record and wakes
/// waiting readers. The guard is moved into the deferred task, so an
/// operation that fails still completes and releases its waiters.
///
/// When `restrictive_dirs` widens directory barriers, the event is also
/// registered on the whole-filesystem record so listings order against it.
/// That record participates only in reader barriers: writers on different
/// paths do not serialize against each other through it.
#[must_use = "dropping the guard immediately marks the operation complete"]
pub struct WriteGuard {
    event: EventId,
    /// The operation's own paths, in argument order.
    paths: Vec<Arc<PathState>>,
    /// The whole-filesystem record, when widened barriers are on.
    whole: Option<Arc<PathState>>,
}

impl WriteGuard {
    /// Block until every in-flight predecessor on the guarded paths has
    /// completed. Deferred work calls this before issuing its syscall so
    /// that same-path syscalls retire in event order.
    ///
    /// No path lock is held after this returns, so guards for different
    /// paths may wait in any order without deadlocking.
    pub fn wait_turn(&self) {
        for state in &self.paths {
            state.wait_predecessors(self.event);
        }
    }

    /// The event ID this guard was registered under.
    pub fn event(&self) -> EventId {
        self.event
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        for state in &self.paths {
            state.complete(self.event);
        }
        if let Some(whole) = &self.whole {
            whole.complete(self.event);
        }
    }
}

/// The ordering engine: the event clock plus the per-path state map.
pub struct OrderEngine {
    clock: EventClock,
    paths: PathStateMap,
    restrictive_dirs: bool,
}

impl OrderEngine {
    #[must_use]
    pub fn new(restrictive_dirs: bool) -> Self {
        Self {
            clock: EventClock::new(),
            paths: PathStateMap::default(),
            restrictive_dirs,
        }
    }

    /// Draw the next event ID.
    pub fn next_event(&self) -> EventId {
        self.clock.tick()
    }

    /// Register a mutating operation on `path` under `event`.
    ///
    /// With `restrictive_dirs`, a write to a specific path also registers on
    /// the whole-filesystem record so later directory readers order against
    /// it.
    pub fn begin_write(&self, path: &OsStr, event: EventId) -> WriteGuard {
        self.begin_write_on(&[path], event)
    }

    /// Register one operation against two paths (rename- and link-shaped
    /// operations). Records are registered in argument order.
    pub fn begin_write_pair(&self, first: &OsStr, second: &OsStr, event: EventId) -> WriteGuard {
        self.begin_write_on(&[first, second], event)
    }

    fn begin_write_on(&self, paths: &[&OsStr], event: EventId) -> WriteGuard {
        let states: Vec<Arc<PathState>> = paths
            .iter()
            .map(|path| self.paths.get_or_insert(path))
            .collect();
        let whole = (self.restrictive_dirs && paths.iter().any(|path| !path.is_empty()))
            .then(|| self.paths.get_or_insert(OsStr::new("")));
        for state in states.iter().chain(whole.iter()) {
            state.register(event);
        }
        WriteGuard {
            event,
            paths: states,
            whole,
        }
    }

    /// Wait until every write registered for `path` before this call has
    /// completed. A path with no history returns immediately.
    pub fn barrier(&self, path: &OsStr) {
        if let Some(state) = self.paths.get(path) {
            state.wait_settled();
        }
    }

    /// Barrier that additionally excludes later operations for the guard's
    /// lifetime: the guard holds a registered event of its own, so every
    /// operation submitted afterwards queues behind it.
    pub fn exclusive(&self, path: &OsStr) -> WriteGuard {
        let guard = self.begin_write(path, self.next_event());
        guard.wait_turn();
        guard
    }

    /// Barrier for a directory read: widened to the whole filesystem iff
    /// `restrictive_dirs` is set.
    pub fn dir_barrier(&self, path: &OsStr) {
        if self.restrictive_dirs {
            self.barrier(OsStr::new(""));
        } else {
            self.barrier(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn event_ids_are_monotone_and_nonzero() {
        let engine = OrderEngine::new(false);
        let a = engine.next_event();
        let b = engine.next_event();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn barrier_on_fresh_path_returns_immediately() {
        let engine = OrderEngine::new(false);
        engine.barrier(os("/never/touched"));
    }

    #[test]
    fn barrier_waits_for_registered_write() {
        let engine = Arc::new(OrderEngine::new(false));
        let guard = engine.begin_write(os("/a"), engine.next_event());

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.barrier(os("/a")))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        drop(guard);
        reader.join().expect("reader completed");
    }

    #[test]
    fn barrier_ignores_writes_on_other_paths() {
        let engine = OrderEngine::new(false);
        let _guard = engine.begin_write(os("/a"), engine.next_event());
        engine.barrier(os("/b"));
    }

    #[test]
    fn barrier_waits_for_each_pending_predecessor() {
        let engine = Arc::new(OrderEngine::new(false));
        let first = engine.begin_write(os("/a"), engine.next_event());
        let second = engine.begin_write(os("/a"), engine.next_event());

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.barrier(os("/a")))
        };

        thread::sleep(Duration::from_millis(30));
        drop(first);
        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        drop(second);
        reader.join().expect("reader completed");
    }

    #[test]
    fn wait_turn_blocks_until_predecessors_complete() {
        let engine = Arc::new(OrderEngine::new(false));
        let first = engine.begin_write(os("/a"), engine.next_event());
        let second = engine.begin_write(os("/a"), engine.next_event());

        let worker = thread::spawn(move || {
            second.wait_turn();
            second.event()
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!worker.is_finished());

        let first_event = first.event();
        drop(first);
        let second_event = worker.join().expect("worker completed");
        assert!(first_event < second_event);
    }

    #[test]
    fn exclusive_guard_blocks_later_readers_until_dropped() {
        let engine = Arc::new(OrderEngine::new(false));
        let held = engine.exclusive(os("/a"));

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.barrier(os("/a")))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        drop(held);
        reader.join().expect("reader completed");
    }

    #[test]
    fn dir_barrier_widens_to_whole_filesystem_when_restrictive() {
        let engine = Arc::new(OrderEngine::new(true));
        // A write to one path registers on the whole-filesystem record too.
        let guard = engine.begin_write(os("/d/f"), engine.next_event());

        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.dir_barrier(os("/elsewhere")))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        drop(guard);
        reader.join().expect("reader completed");
    }

    #[test]
    fn dir_barrier_stays_per_path_when_not_restrictive() {
        let engine = OrderEngine::new(false);
        let _guard = engine.begin_write(os("/d/f"), engine.next_event());
        engine.dir_barrier(os("/elsewhere"));
    }

    #[test]
    fn pair_guard_completes_both_paths() {
        let engine = OrderEngine::new(false);
        let guard = engine.begin_write_pair(os("/src"), os("/dst"), engine.next_event());
        let src = engine.paths.get_or_insert(os("/src"));
        let dst = engine.paths.get_or_insert(os("/dst"));
        assert!(src.has_pending());
        assert!(dst.has_pending());
        drop(guard);
        assert!(!src.has_pending());
        assert!(!dst.has_pending());
    }
}
