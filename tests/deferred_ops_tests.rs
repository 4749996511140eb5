#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use common::{fixture, os};
use hastefs::options::Options;
use nix::errno::Errno;

#[test]
fn create_then_getattr_sees_the_empty_file() {
    let fx = fixture(Options::default());
    let fh = fx.core.create(os("a"), 0o644, libc::O_WRONLY).unwrap();
    // The open is queued; the barriered stat waits for it.
    let stat = fx.core.getattr(os("a")).unwrap();
    assert_eq!(stat.st_size, 0);
    fx.core.release(os("a"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn adjacent_writes_then_read_returns_the_concatenation() {
    let fx = fixture(Options::default());
    let fh = fx.core.create(os("b"), 0o644, libc::O_RDWR).unwrap();
    let first = vec![0xAB_u8; 4096];
    let second = vec![0xCD_u8; 4096];
    assert_eq!(fx.core.write(os("b"), fh, 0, &first).unwrap(), 4096);
    assert_eq!(fx.core.write(os("b"), fh, 4096, &second).unwrap(), 4096);

    let data = fx.core.read(os("b"), fh, 0, 8192).unwrap();
    assert_eq!(data.len(), 8192);
    assert!(data[..4096].iter().all(|&byte| byte == 0xAB));
    assert!(data[4096..].iter().all(|&byte| byte == 0xCD));

    fx.core.release(os("b"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn chmod_then_getattr_reports_the_new_mode() {
    let fx = fixture(Options::default());
    let fh = fx.core.create(os("c"), 0o644, libc::O_WRONLY).unwrap();
    fx.core.chmod(os("c"), 0o600).unwrap();
    let stat = fx.core.getattr(os("c")).unwrap();
    assert_eq!(stat.st_mode & 0o7777, 0o600);
    fx.core.release(os("c"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn link_then_getattr_reports_the_same_inode() {
    let fx = fixture(Options::default());
    let fh = fx.core.create(os("src"), 0o644, libc::O_WRONLY).unwrap();
    fx.core.link(os("src"), os("dst")).unwrap();
    let src = fx.core.getattr(os("src")).unwrap();
    let dst = fx.core.getattr(os("dst")).unwrap();
    assert_eq!(src.st_ino, dst.st_ino);
    assert_eq!(dst.st_nlink, 2);
    fx.core.release(os("src"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn restrictive_dirs_listing_waits_for_pending_writes() {
    let options = Options {
        restrictive_dirs: true,
        ..Options::default()
    };
    let fx = fixture(options);
    fx.core.mkdir(os("d"), 0o755).unwrap();
    let fh = fx.core.create(os("d/f"), 0o644, libc::O_WRONLY).unwrap();

    // The listing barrier covers the whole filesystem, so the queued create
    // lands before the snapshot is taken.
    let dir = fx.core.opendir(os("d")).unwrap();
    let entries = fx.core.dir_entries(dir).unwrap();
    assert!(entries.iter().any(|entry| entry.name == "f"));
    fx.core.releasedir(dir);

    fx.core.release(os("d/f"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn all_queued_writes_land_by_shutdown() {
    let options = Options {
        worker_threads: 4,
        ..Options::default()
    };
    let fx = fixture(options);
    for index in 0..200 {
        let rel = format!("out-{index}");
        let fh = fx.core.create(os(&rel), 0o644, libc::O_WRONLY).unwrap();
        let payload = format!("payload {index}");
        fx.core.write(os(&rel), fh, 0, payload.as_bytes()).unwrap();
        fx.core.release(os(&rel), fh).unwrap();
    }
    fx.core.shutdown();

    for index in 0..200 {
        let path = fx.backing_file(&format!("out-{index}"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            format!("payload {index}")
        );
    }
}

#[test]
fn rename_with_flags_is_invalid() {
    let fx = fixture(Options::default());
    std::fs::write(fx.backing_file("r"), b"contents").unwrap();
    assert_eq!(fx.core.rename(os("r"), os("s"), 1), Err(Errno::EINVAL));
    // The file did not move.
    assert!(fx.backing_file("r").exists());
    fx.core.shutdown();
}

#[test]
fn rename_waits_for_pending_writes_to_the_source() {
    let fx = fixture(Options::default());
    let fh = fx.core.create(os("moving"), 0o644, libc::O_WRONLY).unwrap();
    fx.core.write(os("moving"), fh, 0, b"payload").unwrap();
    fx.core.rename(os("moving"), os("moved"), 0).unwrap();
    assert_eq!(
        std::fs::read_to_string(fx.backing_file("moved")).unwrap(),
        "payload"
    );
    fx.core.release(os("moved"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn ignore_fsync_short_circuits_before_the_handle() {
    let fx = fixture(Options::default());
    // Handle 999 does not exist; the short-circuit must win.
    assert_eq!(fx.core.fsync(os("x"), 999, false), Ok(()));
    fx.core.shutdown();
}

#[test]
fn very_eager_access_answers_without_a_barrier() {
    let fx = fixture(Options::default());
    assert_eq!(fx.core.access(os("does/not/exist"), libc::R_OK), Ok(()));
    fx.core.shutdown();
}

#[test]
fn synchronous_access_consults_the_backing_filesystem() {
    let fx = fixture(Options::synchronous());
    assert_eq!(
        fx.core.access(os("does/not/exist"), libc::R_OK),
        Err(Errno::ENOENT)
    );
    std::fs::write(fx.backing_file("present"), b"").unwrap();
    assert_eq!(fx.core.access(os("present"), libc::R_OK), Ok(()));
    fx.core.shutdown();
}

#[test]
fn getattr_on_a_fresh_path_does_not_block() {
    let fx = fixture(Options::default());
    assert!(matches!(
        fx.core.getattr(os("never-written")),
        Err(Errno::ENOENT)
    ));
    fx.core.shutdown();
}

#[test]
fn failed_deferred_operation_still_releases_readers() {
    let fx = fixture(Options::default());
    // chmod of a path that does not exist: queued, fails on the worker.
    fx.core.chmod(os("missing"), 0o600).unwrap();
    // The barrier must clear anyway; the reader observes the real outcome.
    assert!(matches!(
        fx.core.getattr(os("missing")),
        Err(Errno::ENOENT)
    ));
    fx.core.shutdown();
}

#[test]
fn chown_to_current_ids_is_accepted() {
    let fx = fixture(Options::default());
    let fh = fx.core.create(os("owned"), 0o644, libc::O_WRONLY).unwrap();
    // Changing nothing (both None) must round-trip through the worker.
    fx.core.chown(os("owned"), None, None).unwrap();
    let stat = fx.core.getattr(os("owned")).unwrap();
    assert_eq!(stat.st_uid, nix::unistd::Uid::current().as_raw());
    fx.core.release(os("owned"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn utimens_applies_explicit_times() {
    use hastefs::fs::ops::TimeRef;
    use std::time::{Duration, UNIX_EPOCH};

    let fx = fixture(Options::default());
    let fh = fx.core.create(os("stamped"), 0o644, libc::O_WRONLY).unwrap();
    let at = UNIX_EPOCH + Duration::from_secs(1_000_000);
    fx.core
        .utimens(os("stamped"), Some(TimeRef::Time(at)), Some(TimeRef::Time(at)))
        .unwrap();
    let stat = fx.core.getattr(os("stamped")).unwrap();
    assert_eq!(stat.st_mtime, 1_000_000);
    assert_eq!(stat.st_atime, 1_000_000);
    fx.core.release(os("stamped"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn unlink_removes_the_backing_file() {
    let fx = fixture(Options::default());
    std::fs::write(fx.backing_file("doomed"), b"x").unwrap();
    fx.core.unlink(os("doomed")).unwrap();
    assert!(!fx.backing_file("doomed").exists());
    fx.core.shutdown();
}

#[test]
fn symlink_and_readlink_round_trip() {
    let fx = fixture(Options::default());
    fx.core.symlink(os("target/elsewhere"), os("alias")).unwrap();
    let target = fx.core.readlink(os("alias")).unwrap();
    assert_eq!(target, "target/elsewhere");
    fx.core.shutdown();
}

#[test]
fn mkdir_then_listing_shows_the_directory() {
    let fx = fixture(Options::default());
    fx.core.mkdir(os("sub"), 0o755).unwrap();
    let dir = fx.core.opendir(os("")).unwrap();
    let entries = fx.core.dir_entries(dir).unwrap();
    assert!(entries.iter().any(|entry| entry.name == "sub"));
    fx.core.releasedir(dir);
    assert!(fx.core.dir_entries(dir).is_err());
    fx.core.shutdown();
}
