//! End-to-end tests: origin and snapshot targets sharing devices,
//! with copies resolved in a controlled order.
use std::sync::Arc;

use crate::bio::Bio;
use crate::bio::Disposition;
use crate::bio::Target;
use crate::copier::CopyOutcome;
use crate::device::MemoryDevice;
use crate::exception_store::ExceptionStore;
use crate::exception_store::TransientStore;
use crate::fresh_warn;
use crate::registry::Registry;
use crate::result::ErrorKind;
use crate::snapshot::ChunkState;
use crate::snapshot::SnapshotTarget;
use crate::table::SnapshotArgs;
use crate::table::StatusType;
use crate::test_support::init_tracing;
use crate::test_support::GatedStore;
use crate::test_support::is_done;
use crate::test_support::manual_registry;
use crate::test_support::random_device;
use crate::test_support::raw_read;
use crate::test_support::read;
use crate::test_support::sectors_of;
use crate::test_support::wait;
use crate::test_support::wait_for;
use crate::test_support::write;
use crate::Options;

/// Adds a 64-sector random origin called "base", and returns it.
fn add_base(registry: &Registry) -> Arc<MemoryDevice> {
    let base = random_device("base", 64, 1);

    registry.add_device(base.clone());
    base
}

fn add_cow(registry: &Registry, name: &str, size_sectors: u64) -> Arc<MemoryDevice> {
    let cow = Arc::new(MemoryDevice::new(name, size_sectors));

    registry.add_device(cow.clone());
    cow
}

/// Creates a transient snapshot of "base" on `cow` whose commits go
/// through a `GatedStore`.
fn gated_snapshot(
    registry: &Registry,
    cow: &str,
    chunk_sectors: &str,
) -> (SnapshotTarget, Arc<GatedStore>) {
    let args = SnapshotArgs::parse(&["base", cow, "N", chunk_sectors]).expect("valid");
    let mut gated = None;
    let target = registry
        .build_snapshot(&args, |cow, geometry| {
            let store = Arc::new(GatedStore::new(TransientStore::new(cow, geometry)));
            gated = Some(store.clone());

            let store: Arc<dyn ExceptionStore> = store;
            store
        })
        .expect("valid");

    (target, gated.expect("store was built"))
}

#[test]
fn test_snapshot_write_copies_chunk() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    let cow = add_cow(&registry, "cow", 64);
    let original = raw_read(&*base, 0, 8);

    let snapshot = registry
        .create_snapshot(&["base", "cow", "N", "8"])
        .expect("valid");
    snapshot.resume().expect("should resume");

    let done = write(&snapshot, 0, sectors_of(0xaa, 1));
    wait_for("copy dispatch", || engine.queued() == 1);

    assert_eq!(snapshot.snapshot().chunk_state(0), ChunkState::Pending);
    // The whole chunk is copied, from origin chunk 0 to COW chunk 0.
    assert_eq!(engine.queued_to("cow"), vec![(0, 0, 8)]);
    assert!(!is_done(&done));

    engine.complete_to("cow");
    wait(&done).expect("write should succeed");

    assert_eq!(snapshot.snapshot().chunk_state(0), ChunkState::Committed(0));
    assert_eq!(engine.copy_count(), 1);

    // The write lands on the copy, over the preserved old contents.
    let copy = raw_read(&*cow, 0, 8);
    assert_eq!(&copy[..512], &sectors_of(0xaa, 1)[..]);
    assert_eq!(&copy[512..], &original[512..]);

    let seen = read(&snapshot, 0, 8).expect("should read");
    assert_eq!(seen, copy);
    assert_eq!(raw_read(&*base, 0, 8), original);
}

#[test]
fn test_concurrent_snapshot_writes_share_copy() {
    let (registry, engine) = manual_registry();
    add_base(&registry);
    let cow = add_cow(&registry, "cow", 64);

    let snapshot = registry
        .create_snapshot(&["base", "cow", "N", "8"])
        .expect("valid");
    snapshot.resume().expect("should resume");

    let first = write(&snapshot, 0, sectors_of(1, 1));
    wait_for("copy dispatch", || engine.queued() == 1);
    let second = write(&snapshot, 4, sectors_of(2, 1));

    assert!(!is_done(&first));
    assert!(!is_done(&second));

    engine.complete_to("cow");
    wait(&first).expect("first write should succeed");
    wait(&second).expect("second write should succeed");
    assert_eq!(engine.copy_count(), 1);

    assert_eq!(raw_read(&*cow, 0, 1), sectors_of(1, 1));
    assert_eq!(raw_read(&*cow, 4, 1), sectors_of(2, 1));
}

#[test]
fn test_many_writers_one_copy() {
    let (registry, engine) = manual_registry();
    add_base(&registry);
    add_cow(&registry, "cow", 64);

    let snapshot = Arc::new(
        registry
            .create_snapshot(&["base", "cow", "N", "8"])
            .expect("valid"),
    );
    snapshot.resume().expect("should resume");

    let writers: Vec<_> = (0..8u64)
        .map(|sector| {
            let snapshot = snapshot.clone();

            std::thread::spawn(move || write(&*snapshot, sector, sectors_of(sector as u8, 1)))
        })
        .collect();
    let completions: Vec<_> = writers
        .into_iter()
        .map(|writer| writer.join().expect("writer must not panic"))
        .collect();

    engine.complete_to("cow");
    for completion in &completions {
        wait(completion).expect("write should succeed");
    }

    assert_eq!(engine.copy_count(), 1);
    assert_eq!(snapshot.snapshot().exception_count(), 1);
    for sector in 0..8u64 {
        assert_eq!(
            read(&*snapshot, sector, 1).expect("should read"),
            sectors_of(sector as u8, 1)
        );
    }
}

#[test]
fn test_out_of_space_invalidates() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    // Too small for a single 8-sector chunk.
    add_cow(&registry, "tiny", 4);

    let snapshot = registry
        .create_snapshot(&["base", "tiny", "N", "8"])
        .expect("valid");
    snapshot.resume().expect("should resume");

    let err = wait(&write(&snapshot, 0, sectors_of(7, 1))).expect_err("no room");
    assert_eq!(err.kind(), ErrorKind::NoSpace);
    assert!(!snapshot.snapshot().is_valid());
    assert_eq!(snapshot.snapshot().event_count(), 1);
    assert_eq!(snapshot.status(StatusType::Info), "Invalid");

    // Reads fall back to the origin; writes fail immediately.
    assert_eq!(
        read(&snapshot, 16, 8).expect("should read"),
        raw_read(&*base, 16, 8)
    );
    let err = wait(&write(&snapshot, 8, sectors_of(7, 1))).expect_err("invalid");
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert_eq!(engine.copy_count(), 0);
    assert_eq!(snapshot.snapshot().event_count(), 1);
}

#[test]
fn test_copy_error_invalidates() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    add_cow(&registry, "cow", 64);

    let snapshot = registry
        .create_snapshot(&["base", "cow", "N", "8"])
        .expect("valid");
    snapshot.resume().expect("should resume");

    let first = write(&snapshot, 0, sectors_of(3, 1));
    wait_for("copy dispatch", || engine.queued() == 1);
    let second = write(&snapshot, 8, sectors_of(4, 1));
    wait_for("copy dispatch", || engine.queued() == 2);

    engine.fail_to(
        "cow",
        CopyOutcome {
            read_error: true,
            write_error: false,
        },
    );
    assert_eq!(
        wait(&first).expect_err("copy failed").kind(),
        ErrorKind::Io
    );
    assert!(!snapshot.snapshot().is_valid());

    // The other copy succeeds, but the snapshot is already dead.
    engine.complete_to("cow");
    assert_eq!(
        wait(&second).expect_err("snapshot invalid").kind(),
        ErrorKind::Invalid
    );

    // A single invalidation, however many chunks were in flight.
    assert_eq!(snapshot.snapshot().event_count(), 1);
    assert_eq!(snapshot.snapshot().exception_count(), 0);
    assert_eq!(snapshot.snapshot().pending_count(), 0);
    assert_eq!(snapshot.snapshot().chunk_state(1), ChunkState::Absent);
    assert_eq!(
        read(&snapshot, 8, 8).expect("should read"),
        raw_read(&*base, 8, 8)
    );
}

#[test]
fn test_commit_error_invalidates() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    add_cow(&registry, "cow", 64);
    let original = raw_read(&*base, 0, 8);

    let origin = registry.create_origin(&["base"]).expect("valid");
    let (snapshot, store) = gated_snapshot(&registry, "cow", "8");
    snapshot.resume().expect("should resume");

    let snapshot_write = write(&snapshot, 0, sectors_of(0xaa, 1));
    wait_for("copy dispatch", || engine.queued() == 1);
    let origin_write = write(&origin, 3, sectors_of(0xee, 1));

    engine.complete_to("cow");
    wait_for("commit", || store.commits_started() == 1);
    assert_eq!(snapshot.snapshot().chunk_state(0), ChunkState::Pending);
    assert!(!is_done(&snapshot_write));
    assert!(!is_done(&origin_write));
    assert_eq!(raw_read(&*base, 0, 8), original);

    store.release(Err(
        fresh_warn!("injected commit failure").with_kind(ErrorKind::Io)
    ));

    // A failed commit is as bad as a failed copy.
    assert_eq!(
        wait(&snapshot_write).expect_err("commit failed").kind(),
        ErrorKind::Io
    );
    wait(&origin_write).expect("origin write should succeed");

    assert!(!snapshot.snapshot().is_valid());
    assert_eq!(snapshot.status(StatusType::Info), "Invalid");
    assert_eq!(snapshot.snapshot().event_count(), 1);
    assert_eq!(snapshot.snapshot().exception_count(), 0);
    assert_eq!(snapshot.snapshot().pending_count(), 0);
    assert_eq!(raw_read(&*base, 3, 1), sectors_of(0xee, 1));
    assert_eq!(engine.copy_count(), 1);
}

#[test]
fn test_slow_commit_does_not_stall_other_chunks() {
    let (registry, engine) = manual_registry();
    assert_eq!(registry.options().exception_threads, 1);
    add_base(&registry);
    add_cow(&registry, "cow", 64);

    let (snapshot, store) = gated_snapshot(&registry, "cow", "8");
    snapshot.resume().expect("should resume");

    let first = write(&snapshot, 0, sectors_of(1, 1));
    engine.complete_to("cow");
    wait_for("first commit", || store.commits_started() == 1);

    // The first commit is stuck, but the next chunk still gets copied
    // and committed.
    let second = write(&snapshot, 8, sectors_of(2, 1));
    wait_for("copy dispatch", || engine.queued() == 1);
    engine.complete_to("cow");
    wait_for("second commit", || store.commits_started() == 2);
    assert!(!is_done(&first));
    assert!(!is_done(&second));

    store.release(Ok(()));
    store.release(Ok(()));
    wait(&first).expect("write should succeed");
    wait(&second).expect("write should succeed");

    assert_eq!(snapshot.snapshot().exception_count(), 2);
    assert!(snapshot.snapshot().is_valid());
}

#[test]
fn test_snapshot_and_origin_writes_share_copy() {
    for snapshot_first in [true, false] {
        let (registry, engine) = manual_registry();
        let base = add_base(&registry);
        add_cow(&registry, "cow", 64);
        let original = raw_read(&*base, 0, 8);

        let origin = registry.create_origin(&["base"]).expect("valid");
        let snapshot = registry
            .create_snapshot(&["base", "cow", "N", "8"])
            .expect("valid");
        snapshot.resume().expect("should resume");

        let (snapshot_write, origin_write) = if snapshot_first {
            let snapshot_write = write(&snapshot, 1, sectors_of(0xaa, 1));
            let origin_write = write(&origin, 5, sectors_of(0xee, 1));
            (snapshot_write, origin_write)
        } else {
            let origin_write = write(&origin, 5, sectors_of(0xee, 1));
            let snapshot_write = write(&snapshot, 1, sectors_of(0xaa, 1));
            (snapshot_write, origin_write)
        };

        wait_for("copy dispatch", || engine.queued() == 1);
        assert_eq!(snapshot.snapshot().pending_count(), 1);
        assert!(!is_done(&snapshot_write));
        assert!(!is_done(&origin_write));
        assert_eq!(raw_read(&*base, 0, 8), original);

        engine.complete_to("cow");
        wait(&snapshot_write).expect("snapshot write should succeed");
        wait(&origin_write).expect("origin write should succeed");

        assert_eq!(engine.copy_count(), 1);
        assert_eq!(snapshot.snapshot().chunk_state(0), ChunkState::Committed(0));

        // The snapshot sees its own write over the pre-write origin.
        let mut expected = original.clone();
        expected[512..1024].copy_from_slice(&sectors_of(0xaa, 1));
        assert_eq!(read(&snapshot, 0, 8).expect("should read"), expected);
        assert_eq!(raw_read(&*base, 5, 1), sectors_of(0xee, 1));
    }
}

#[test]
fn test_empty_writes_pass_through() {
    let (registry, engine) = manual_registry();
    add_base(&registry);
    add_cow(&registry, "cow", 64);

    let origin = registry.create_origin(&["base"]).expect("valid");
    let snapshot = registry
        .create_snapshot(&["base", "cow", "N", "8"])
        .expect("valid");
    snapshot.resume().expect("should resume");

    wait(&write(&snapshot, 0, Vec::new())).expect("empty write should succeed");
    wait(&write(&origin, 8, Vec::new())).expect("empty write should succeed");

    assert_eq!(engine.copy_count(), 0);
    assert_eq!(snapshot.snapshot().pending_count(), 0);
    assert_eq!(snapshot.snapshot().exception_count(), 0);
    assert_eq!(snapshot.snapshot().chunk_state(0), ChunkState::Absent);
    assert_eq!(snapshot.snapshot().chunk_state(1), ChunkState::Absent);
}

#[test]
fn test_origin_write_waits_for_every_snapshot() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    add_cow(&registry, "cow1", 64);
    add_cow(&registry, "cow2", 64);
    let original = raw_read(&*base, 0, 8);

    let origin = registry.create_origin(&["base"]).expect("valid");
    let s1 = registry
        .create_snapshot(&["base", "cow1", "N", "4"])
        .expect("valid");
    let s2 = registry
        .create_snapshot(&["base", "cow2", "N", "8"])
        .expect("valid");
    s1.resume().expect("should resume");
    s2.resume().expect("should resume");
    assert_eq!(origin.max_io_sectors(), Some(4));

    let done = write(&origin, 0, sectors_of(0xee, 1));
    wait_for("copy dispatch", || engine.queued() == 2);
    assert_eq!(engine.queued_to("cow1"), vec![(0, 0, 4)]);
    assert_eq!(engine.queued_to("cow2"), vec![(0, 0, 8)]);

    engine.complete_to("cow1");
    wait_for("first commit", || {
        s1.snapshot().chunk_state(0) == ChunkState::Committed(0)
    });

    // One snapshot is done; the other still holds the write back.
    assert!(!is_done(&done));
    assert_eq!(raw_read(&*base, 0, 8), original);

    engine.complete_to("cow2");
    wait(&done).expect("origin write should succeed");

    assert_eq!(raw_read(&*base, 0, 1), sectors_of(0xee, 1));
    assert_eq!(read(&s1, 0, 4).expect("should read"), &original[..4 * 512]);
    assert_eq!(read(&s2, 0, 8).expect("should read"), original);
    assert_eq!(engine.copy_count(), 2);
}

#[test]
fn test_origin_write_skips_committed_snapshot() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    add_cow(&registry, "cow1", 64);
    add_cow(&registry, "cow2", 64);
    let original = raw_read(&*base, 0, 8);

    let origin = registry.create_origin(&["base"]).expect("valid");
    let s1 = registry
        .create_snapshot(&["base", "cow1", "N", "8"])
        .expect("valid");
    let s2 = registry
        .create_snapshot(&["base", "cow2", "N", "8"])
        .expect("valid");
    s1.resume().expect("should resume");
    s2.resume().expect("should resume");

    // s1 already copied chunk 0 out.
    let first = write(&s1, 2, sectors_of(1, 1));
    engine.complete_to("cow1");
    wait(&first).expect("snapshot write should succeed");

    let done = write(&origin, 0, sectors_of(0xee, 1));
    wait_for("copy dispatch", || engine.queued() == 1);
    assert!(engine.queued_to("cow1").is_empty());
    assert_eq!(engine.queued_to("cow2").len(), 1);
    assert!(!is_done(&done));

    engine.complete_to("cow2");
    wait(&done).expect("origin write should succeed");
    assert_eq!(engine.copy_count(), 2);
    assert_eq!(read(&s2, 0, 8).expect("should read"), original);
}

#[test]
fn test_origin_write_survives_failed_copy() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    add_cow(&registry, "cow1", 64);
    add_cow(&registry, "cow2", 64);
    let original = raw_read(&*base, 0, 8);

    let origin = registry.create_origin(&["base"]).expect("valid");
    let s1 = registry
        .create_snapshot(&["base", "cow1", "N", "8"])
        .expect("valid");
    let s2 = registry
        .create_snapshot(&["base", "cow2", "N", "8"])
        .expect("valid");
    s1.resume().expect("should resume");
    s2.resume().expect("should resume");

    let done = write(&origin, 0, sectors_of(0xee, 1));
    wait_for("copy dispatch", || engine.queued() == 2);

    engine.fail_to(
        "cow2",
        CopyOutcome {
            read_error: false,
            write_error: true,
        },
    );
    wait_for("invalidation", || !s2.snapshot().is_valid());
    assert!(!is_done(&done));

    engine.complete_to("cow1");
    wait(&done).expect("origin write should succeed");

    assert!(s1.snapshot().is_valid());
    assert_eq!(read(&s1, 0, 8).expect("should read"), original);

    // Invalid snapshots no longer hold origin writes back.
    let later = write(&origin, 8, sectors_of(0xdd, 1));
    wait_for("copy dispatch", || engine.queued() == 1);
    assert_eq!(engine.queued_to("cow2").len(), 0);
    engine.complete_to("cow1");
    wait(&later).expect("origin write should succeed");
}

#[test]
fn test_origin_without_snapshots() {
    let (registry, engine) = manual_registry();
    let base = add_base(&registry);
    let origin = registry.create_origin(&["base"]).expect("valid");

    wait(&write(&origin, 3, sectors_of(9, 2))).expect("should write");
    assert_eq!(raw_read(&*base, 3, 2), sectors_of(9, 2));
    assert_eq!(read(&origin, 3, 2).expect("should read"), sectors_of(9, 2));
    assert_eq!(engine.copy_count(), 0);

    // Unresumed snapshots don't hold writes back either.
    add_cow(&registry, "cow", 64);
    let _snapshot = registry
        .create_snapshot(&["base", "cow", "N", "8"])
        .expect("valid");
    wait(&write(&origin, 0, sectors_of(1, 1))).expect("should write");
    assert_eq!(engine.copy_count(), 0);
}

#[test]
fn test_request_bounds() {
    let (registry, engine) = manual_registry();
    add_base(&registry);
    add_cow(&registry, "cow", 64);

    let origin = registry.create_origin(&["base"]).expect("valid");
    let snapshot = registry
        .create_snapshot(&["base", "cow", "N", "8"])
        .expect("valid");

    // Not resumed yet.
    match snapshot.map(Bio::read(0, 1)) {
        Disposition::Failed(_, e) => assert_eq!(e.kind(), ErrorKind::Invalid),
        other => panic!("unexpected disposition {:?}", other),
    }

    snapshot.resume().expect("should resume");

    let bad = [
        // Crosses from chunk 0 into chunk 1.
        Bio::write(6, sectors_of(0, 4)),
        Bio::read(6, 4),
        // Past the end of the origin.
        Bio::read(64, 1),
    ];
    for bio in bad {
        match snapshot.map(bio) {
            Disposition::Failed(_, e) => assert_eq!(e.kind(), ErrorKind::OutOfRange),
            other => panic!("unexpected disposition {:?}", other),
        }
    }

    match origin.map(Bio::write(6, sectors_of(0, 4))) {
        Disposition::Failed(_, e) => assert_eq!(e.kind(), ErrorKind::OutOfRange),
        other => panic!("unexpected disposition {:?}", other),
    }

    // None of this touched the snapshot.
    assert_eq!(engine.copy_count(), 0);
    assert!(snapshot.snapshot().is_valid());
}

#[test]
fn test_status_and_usage_events() {
    let (registry, engine) = manual_registry();
    add_base(&registry);
    add_cow(&registry, "cow", 64);

    let snapshot = registry
        .create_snapshot(&["base", "cow", "N", "8"])
        .expect("valid");
    snapshot.resume().expect("should resume");

    assert_eq!(snapshot.status(StatusType::Table), "base cow N 8");
    assert_eq!(snapshot.status(StatusType::Info), "0/64");

    // Each chunk is 12.5% of the COW device: every commit crosses a
    // 5% step.
    for (chunk, expected_events) in [(0u64, 1u64), (1, 2)] {
        let done = write(&snapshot, chunk * 8, sectors_of(5, 1));
        engine.complete_to("cow");
        wait(&done).expect("write should succeed");
        assert_eq!(snapshot.snapshot().event_count(), expected_events);
    }

    assert_eq!(snapshot.status(StatusType::Info), "16/64");
}

#[test]
fn test_persistent_snapshot_survives_reload() {
    init_tracing();

    let registry = Registry::new(Options::default()).expect("should build");
    let base = add_base(&registry);
    add_cow(&registry, "cow", 128);
    let original = raw_read(&*base, 0, 64);
    let origin = registry.create_origin(&["base"]).expect("valid");

    {
        let snapshot = registry
            .create_snapshot(&["base", "cow", "P", "8"])
            .expect("valid");
        snapshot.resume().expect("should resume");
        assert_eq!(snapshot.status(StatusType::Info), "16/128");

        wait(&write(&origin, 8, sectors_of(0x11, 8))).expect("should write");
        wait(&write(&snapshot, 20, sectors_of(0x22, 2))).expect("should write");
        assert_eq!(snapshot.snapshot().exception_count(), 2);
    }

    let snapshot = registry
        .create_snapshot(&["base", "cow", "P", "8"])
        .expect("valid");
    snapshot.resume().expect("should reload");
    assert_eq!(snapshot.snapshot().exception_count(), 2);
    assert!(matches!(
        snapshot.snapshot().chunk_state(1),
        ChunkState::Committed(_)
    ));

    let mut expected = original.clone();
    expected[20 * 512..22 * 512].copy_from_slice(&sectors_of(0x22, 2));
    assert_eq!(read(&snapshot, 0, 8).expect("should read"), &expected[..8 * 512]);
    assert_eq!(read(&snapshot, 8, 8).expect("should read"), &expected[8 * 512..16 * 512]);
    assert_eq!(read(&snapshot, 16, 8).expect("should read"), &expected[16 * 512..24 * 512]);

    // A failed copy invalidates the store for good.
    base.set_failing(true);
    let result = wait(&write(&origin, 32, sectors_of(0x33, 1)));
    base.set_failing(false);
    assert_eq!(result.expect_err("origin is failing").kind(), ErrorKind::Io);
    assert!(!snapshot.snapshot().is_valid());
    drop(snapshot);

    let reloaded = registry
        .create_snapshot(&["base", "cow", "P", "8"])
        .expect("valid");
    reloaded.resume().expect("should reload");
    assert!(!reloaded.snapshot().is_valid());
    assert_eq!(reloaded.status(StatusType::Info), "Invalid");
}

#[test]
fn test_random_writes_keep_snapshot_consistent() {
    use rand::Rng;
    use rand::SeedableRng;

    init_tracing();

    let registry = Registry::new(Options {
        copy_threads: 4,
        exception_threads: 2,
        ..Default::default()
    })
    .expect("should build");
    let base = add_base(&registry);
    add_cow(&registry, "cow", 256);

    let origin = registry.create_origin(&["base"]).expect("valid");
    let snapshot = registry
        .create_snapshot(&["base", "cow", "P", "4"])
        .expect("valid");
    snapshot.resume().expect("should resume");

    // What the snapshot and the origin should contain.
    let mut snapshot_view = raw_read(&*base, 0, 64);
    let mut origin_view = snapshot_view.clone();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    for _ in 0..200 {
        let sector = rng.gen_range(0..64u64);
        let byte: u8 = rng.gen();
        let range = (sector * 512) as usize..((sector + 1) * 512) as usize;

        if rng.gen_bool(0.5) {
            wait(&write(&origin, sector, sectors_of(byte, 1))).expect("should write");
            origin_view[range].iter_mut().for_each(|b| *b = byte);
        } else {
            wait(&write(&snapshot, sector, sectors_of(byte, 1))).expect("should write");
            snapshot_view[range].iter_mut().for_each(|b| *b = byte);
        }
    }

    assert!(snapshot.snapshot().is_valid());
    assert_eq!(raw_read(&*base, 0, 64), origin_view);
    for chunk in 0..16u64 {
        let range = (chunk * 4 * 512) as usize..((chunk + 1) * 4 * 512) as usize;

        assert_eq!(
            read(&snapshot, chunk * 4, 4).expect("should read"),
            &snapshot_view[range]
        );
    }
}
