//! The deferral-policy record.
//!
//! Built once at startup and read everywhere. Each `eager_*` switch makes
//! the corresponding operation family return success to the caller
//! immediately and run later on the worker pool.

use serde::{Deserialize, Serialize};

/// Process-wide immutable policy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Defer hard-link creation.
    pub eager_link: bool,
    /// Defer permission changes.
    pub eager_chmod: bool,
    /// Defer timestamp updates.
    pub eager_utimens: bool,
    /// Defer ownership changes.
    pub eager_chown: bool,
    /// Defer the close behind release and flush.
    pub eager_close: bool,
    /// Defer fsync (only reached when `ignore_fsync` is off).
    pub eager_fsync: bool,
    /// Defer the open behind create.
    pub eager_create: bool,
    /// Answer access with success before taking any barrier.
    pub very_eager_access: bool,
    /// Answer access with success after the barrier, skipping the syscall.
    pub eager_access: bool,
    /// Park released descriptors and close them at teardown.
    pub close_very_late: bool,
    /// Treat every directory read as a whole-filesystem barrier.
    pub restrictive_dirs: bool,
    /// Make fsync an immediate no-op.
    pub ignore_fsync: bool,
    /// Number of worker threads executing deferred operations.
    pub worker_threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            eager_link: true,
            eager_chmod: true,
            eager_utimens: true,
            eager_chown: true,
            eager_close: true,
            eager_fsync: true,
            eager_create: true,
            very_eager_access: true,
            eager_access: true,
            close_very_late: true,
            restrictive_dirs: false,
            ignore_fsync: true,
            worker_threads: 16,
        }
    }
}

impl Options {
    /// A fully synchronous policy: every operation runs on the caller and
    /// nothing is deferred. Useful for debugging ordering suspicions.
    #[must_use]
    pub fn synchronous() -> Self {
        Self {
            eager_link: false,
            eager_chmod: false,
            eager_utimens: false,
            eager_chown: false,
            eager_close: false,
            eager_fsync: false,
            eager_create: false,
            very_eager_access: false,
            eager_access: false,
            close_very_late: false,
            restrictive_dirs: false,
            ignore_fsync: false,
            worker_threads: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_defer_everything_but_directory_reads() {
        let options = Options::default();
        assert!(options.eager_link);
        assert!(options.eager_create);
        assert!(options.close_very_late);
        assert!(options.ignore_fsync);
        assert!(!options.restrictive_dirs);
        assert_eq!(options.worker_threads, 16);
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let parsed: Result<Options, _> = toml::from_str("eager_chomd = true");
        assert!(parsed.is_err());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let parsed: Options =
            toml::from_str("restrictive_dirs = true\nworker_threads = 4").expect("parse");
        assert!(parsed.restrictive_dirs);
        assert_eq!(parsed.worker_threads, 4);
        assert!(parsed.eager_chmod);
    }
}
