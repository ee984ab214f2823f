//! A `PendingException` tracks one chunk whose copy to the COW device
//! is in flight: the snapshot writes that must wait for it, and the
//! origin writes whose release depends (at least partly) on it.
//!
//! A single origin write may need copies in several snapshots.  It
//! waits on an `OriginBarrier`, a join group shared by every pending
//! exception the write depends on: the write is only released once the
//! last of them resolves.
use std::sync::Arc;
use std::sync::Mutex;

use crate::bio::Bio;
use crate::exception::Chunk;
use crate::exception::Exception;
use crate::exception_table::TableEntry;

#[derive(Debug)]
pub(crate) struct PendingException {
    pub exception: Exception,
    // Snapshot writes, already remapped to the COW device, in arrival order.
    pub snapshot_bios: Vec<Bio>,
    pub origin_barriers: Vec<Arc<OriginBarrier>>,
    // Set once the copy task is spawned.
    pub started: bool,
}

impl PendingException {
    pub fn new(exception: Exception) -> PendingException {
        PendingException {
            exception,
            snapshot_bios: Vec::new(),
            origin_barriers: Vec::new(),
            started: false,
        }
    }
}

impl TableEntry for PendingException {
    #[inline(always)]
    fn chunk(&self) -> Chunk {
        self.exception.old_chunk
    }
}

#[derive(Debug)]
struct BarrierState {
    outstanding: usize,
    bio: Option<Bio>,
}

/// Holds an origin write until every pending exception that joined
/// the barrier has arrived.
#[derive(Debug)]
pub(crate) struct OriginBarrier {
    state: Mutex<BarrierState>,
}

impl OriginBarrier {
    /// Returns a barrier for `bio`, with one reference owned by the
    /// caller.  The caller must `arrive` once it's done joining.
    pub fn new(bio: Bio) -> Arc<OriginBarrier> {
        Arc::new(OriginBarrier {
            state: Mutex::new(BarrierState {
                outstanding: 1,
                bio: Some(bio),
            }),
        })
    }

    /// Adds one member to the group.
    pub fn join(&self) {
        let mut state = self.state.lock().expect("poisoned lock");

        assert!(state.outstanding > 0, "joined a released barrier");
        state.outstanding += 1;
    }

    /// Removes one member from the group, and returns the write if
    /// that was the last one.
    pub fn arrive(&self) -> Option<Bio> {
        let mut state = self.state.lock().expect("poisoned lock");

        assert!(state.outstanding > 0, "barrier arrived too many times");
        state.outstanding -= 1;
        if state.outstanding > 0 {
            return None;
        }

        state.bio.take()
    }
}

/// Arrives at every barrier in `barriers`, and returns the origin
/// writes that are now free to go.
pub(crate) fn release_barriers(barriers: Vec<Arc<OriginBarrier>>) -> Vec<Bio> {
    barriers
        .into_iter()
        .filter_map(|barrier| barrier.arrive())
        .collect()
}

#[test]
fn test_barrier_waits_for_everyone() {
    let barrier = OriginBarrier::new(Bio::write(0, vec![1u8; 512]));

    barrier.join();
    barrier.join();

    // The walker is done: two copies are still outstanding.
    assert!(barrier.arrive().is_none());
    assert!(barrier.arrive().is_none());

    let bio = barrier.arrive().expect("last member releases the write");
    assert_eq!(bio.sector(), 0);
}

#[test]
fn test_barrier_without_members() {
    let barrier = OriginBarrier::new(Bio::write(8, vec![0u8; 512]));

    assert_eq!(barrier.arrive().map(|bio| bio.sector()), Some(8));
}

#[test]
fn test_release_barriers() {
    let first = OriginBarrier::new(Bio::write(0, vec![0u8; 512]));
    let second = OriginBarrier::new(Bio::write(16, vec![0u8; 512]));

    first.join();
    second.join();
    second.join();
    assert!(first.arrive().is_none());
    assert!(second.arrive().is_none());

    let released = release_barriers(vec![first.clone(), second.clone()]);
    assert_eq!(released.iter().map(Bio::sector).collect::<Vec<_>>(), vec![0]);

    let released = release_barriers(vec![second]);
    assert_eq!(released.iter().map(Bio::sector).collect::<Vec<_>>(), vec![16]);
}
