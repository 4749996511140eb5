//! Mount a backing directory through the deferred-write passthrough.
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

mod app_config;
mod fuse_check;
mod trc;

use crate::app_config::Config;
use hastefs::fs::ops::FsCore;
use hastefs::options::Options;

#[derive(Parser)]
#[command(
    version,
    about = "A can-do passthrough filesystem: acknowledge writes first, run them later."
)]
struct Args {
    /// Directory whose contents the mount mirrors.
    backing_dir: PathBuf,

    /// Where to mount the filesystem.
    mount_point: PathBuf,

    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a TOML file with the deferral policy."
    )]
    config_path: Option<PathBuf>,

    /// Number of worker threads (overrides the config file).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Treat every directory read as a whole-filesystem barrier.
    #[arg(long)]
    restrictive_dirs: bool,

    /// Run fully synchronously: no deferral anywhere.
    #[arg(long)]
    sync: bool,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,
}

fn effective_options(args: &Args, config: &Config) -> Options {
    let mut options = if args.sync {
        Options::synchronous()
    } else {
        config.options.clone()
    };
    if let Some(workers) = args.workers {
        options.worker_threads = workers;
    }
    if args.restrictive_dirs {
        options.restrictive_dirs = true;
    }
    options
}

/// Main entry point for the application.
#[expect(
    clippy::exit,
    reason = "top-level entry point that reports the failure and terminates"
)]
fn main() {
    let args = Args::parse();

    // Load config first — errors use eprintln since tracing isn't initialized yet.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = trc::init() {
        eprintln!(
            "Failed to initialize logging. Without logging, deferred failures would vanish \
             silently, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    if let Err(e) = fuse_check::ensure_fuse() {
        error!("{e}");
        std::process::exit(1);
    }

    let options = effective_options(&args, &config);
    if options.worker_threads == 0 {
        error!("--workers must be at least 1");
        std::process::exit(1);
    }

    let backing = match std::fs::canonicalize(&args.backing_dir) {
        Ok(path) => path,
        Err(e) => {
            error!(path = %args.backing_dir.display(), "Backing directory is unusable: {e}");
            std::process::exit(1);
        }
    };

    let core = match FsCore::new(backing.clone(), options) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            error!("Failed to start the worker pool: {e}");
            std::process::exit(1);
        }
    };

    info!(
        backing = %backing.display(),
        mount = %args.mount_point.display(),
        "mounting"
    );

    let session = hastefs::fs::fuser::mount(Arc::clone(&core), &args.mount_point, args.allow_other);

    // Drain regardless of how the session ended: queued work must land
    // before exit.
    core.shutdown();

    if let Err(e) = session {
        error!("Mount failed: {e}");
        std::process::exit(1);
    }
    info!("unmounted");
}
