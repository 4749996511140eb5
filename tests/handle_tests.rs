#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{fixture, os};
use hastefs::handle::HandleTable;
use hastefs::options::Options;

#[test]
fn read_through_a_promised_handle_waits_for_the_open() {
    let fx = fixture(Options::default());
    let fh = fx.core.create(os("late"), 0o644, libc::O_RDWR).unwrap();
    fx.core.write(os("late"), fh, 0, b"eventually").unwrap();
    // Both the open and the write may still be queued; the read blocks on
    // the path barrier and then on the slot's descriptor.
    let data = fx.core.read(os("late"), fh, 0, 64).unwrap();
    assert_eq!(data, b"eventually");
    fx.core.release(os("late"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn handle_ids_are_reused_after_release() {
    let fx = fixture(Options::default());
    let first = fx.core.create(os("one"), 0o644, libc::O_WRONLY).unwrap();
    fx.core.release(os("one"), first).unwrap();
    // The teardown that frees the ID is queued behind the handle's events;
    // the barrier waits it out so the ID is back on the free stack.
    fx.core.getattr(os("one")).unwrap();
    let second = fx.core.create(os("two"), 0o644, libc::O_WRONLY).unwrap();
    assert_eq!(second, first);
    fx.core.release(os("two"), second).unwrap();
    fx.core.shutdown();
}

#[test]
fn open_existing_file_reads_without_waiting() {
    let fx = fixture(Options::default());
    std::fs::write(fx.backing_file("ready"), b"already here").unwrap();
    let fh = fx.core.open(os("ready"), libc::O_RDONLY).unwrap();
    let data = fx.core.read(os("ready"), fh, 0, 64).unwrap();
    assert_eq!(data, b"already here");
    fx.core.release(os("ready"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn writes_through_an_open_handle_are_ordered_with_reads() {
    let fx = fixture(Options::default());
    std::fs::write(fx.backing_file("grow"), b"").unwrap();
    let fh = fx.core.open(os("grow"), libc::O_RDWR).unwrap();
    for index in 0..8_u8 {
        fx.core
            .write(os("grow"), fh, i64::from(index), &[b'a' + index])
            .unwrap();
    }
    let data = fx.core.read(os("grow"), fh, 0, 64).unwrap();
    assert_eq!(data, b"abcdefgh");
    fx.core.release(os("grow"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn get_descriptor_observes_a_fulfil_issued_later() {
    let table = Arc::new(HandleTable::new());
    let id = table.allocate();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || table.slot(id).fd())
        })
        .collect();

    thread::sleep(Duration::from_millis(30));
    let (read, write) = nix::unistd::pipe().unwrap();
    let raw = {
        use std::os::fd::AsRawFd as _;
        read.as_raw_fd()
    };
    drop(write);
    table.slot(id).fulfil(read);

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), raw);
    }
}

#[test]
fn truncate_through_a_handle_applies_to_the_backing_file() {
    let fx = fixture(Options::default());
    std::fs::write(fx.backing_file("cut"), b"0123456789").unwrap();
    let fh = fx.core.open(os("cut"), libc::O_RDWR).unwrap();
    fx.core.truncate_handle(fh, 4).unwrap();
    let stat = fx.core.getattr(os("cut")).unwrap();
    assert_eq!(stat.st_size, 4);
    fx.core.release(os("cut"), fh).unwrap();
    fx.core.shutdown();
}

#[test]
fn fallocate_with_mode_is_rejected_inline() {
    let fx = fixture(Options::default());
    std::fs::write(fx.backing_file("alloc"), b"").unwrap();
    let fh = fx.core.open(os("alloc"), libc::O_RDWR).unwrap();
    assert!(fx.core.fallocate(os("alloc"), fh, 0, 16, 1).is_err());
    fx.core.fallocate(os("alloc"), fh, 0, 16, 0).unwrap();
    let stat = fx.core.getattr(os("alloc")).unwrap();
    assert_eq!(stat.st_size, 16);
    fx.core.release(os("alloc"), fh).unwrap();
    fx.core.shutdown();
}
