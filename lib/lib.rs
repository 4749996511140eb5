//! hastefs shared library.
//!
//! A passthrough filesystem that trades durability for throughput: mutating
//! operations are acknowledged as soon as their intent is recorded and run
//! later on a worker pool, while reads of a path wait until that path's
//! pending writes have landed. The intended workload is batch processing
//! where a failed run is recovered by deleting the outputs and rerunning.

/// Descriptors parked until teardown.
pub mod closer;
/// Deferred-operation submission and the worker pool.
pub mod dispatch;
/// The passthrough filesystem core and its FUSE adapter.
pub mod fs;
/// Promised file handles.
pub mod handle;
/// The deferral-policy record.
pub mod options;
/// Per-path operation ordering.
pub mod order;
