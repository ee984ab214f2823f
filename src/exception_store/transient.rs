use std::sync::Arc;
use std::sync::Mutex;

use crate::device::BlockDevice;
use crate::exception::Chunk;
use crate::exception::ChunkGeometry;
use crate::exception::Exception;
use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

use super::CommitDone;
use super::ExceptionStore;
use super::PersistenceMode;
use super::StoreState;

/// A `TransientStore` hands out COW chunks front to back, and forgets
/// everything when dropped.
#[derive(Debug)]
pub struct TransientStore {
    cow: Arc<dyn BlockDevice>,
    geometry: ChunkGeometry,
    // First unallocated sector on `cow`.
    next_free: Mutex<u64>,
}

impl TransientStore {
    pub fn new(cow: Arc<dyn BlockDevice>, geometry: ChunkGeometry) -> TransientStore {
        TransientStore {
            cow,
            geometry,
            next_free: Mutex::new(0),
        }
    }
}

impl ExceptionStore for TransientStore {
    fn mode(&self) -> PersistenceMode {
        PersistenceMode::Transient
    }

    fn read_metadata(&self, _add: &mut dyn FnMut(Exception)) -> Result<StoreState> {
        Ok(StoreState::Valid)
    }

    fn prepare_exception(&self, old_chunk: Chunk) -> Result<Chunk> {
        let mut next_free = self.next_free.lock().expect("poisoned lock");
        let size = self.cow.size_sectors();

        if size < *next_free + self.geometry.chunk_sectors() {
            return Err(fresh_warn!("COW device is full",
                                   cow=%self.cow.name(), old_chunk, next_free=*next_free, size)
            .with_kind(ErrorKind::NoSpace));
        }

        let new_chunk = self.geometry.sector_to_chunk(*next_free);
        *next_free += self.geometry.chunk_sectors();
        Ok(new_chunk)
    }

    fn commit_exception(&self, _exception: Exception, on_done: CommitDone) {
        on_done(Ok(()))
    }

    fn drop_snapshot(&self) {}

    fn fraction_full(&self) -> Option<(u64, u64)> {
        let next_free = *self.next_free.lock().expect("poisoned lock");

        Some((next_free, self.cow.size_sectors()))
    }
}

#[test]
fn test_transient_allocation() {
    use crate::device::MemoryDevice;

    let geometry = ChunkGeometry::new(8).expect("valid");
    let store = TransientStore::new(Arc::new(MemoryDevice::new("cow", 20)), geometry);

    assert_eq!(store.fraction_full(), Some((0, 20)));
    assert_eq!(store.prepare_exception(7).expect("room left"), 0);
    assert_eq!(store.prepare_exception(3).expect("room left"), 1);
    assert_eq!(store.fraction_full(), Some((16, 20)));

    // Only 4 sectors left: not enough for a chunk.
    assert_eq!(
        store.prepare_exception(9).expect_err("full").kind(),
        ErrorKind::NoSpace
    );
    assert_eq!(store.fraction_full(), Some((16, 20)));
}

#[test]
fn test_transient_commit() {
    use crate::device::MemoryDevice;

    let geometry = ChunkGeometry::new(8).expect("valid");
    let store = TransientStore::new(Arc::new(MemoryDevice::new("cow", 64)), geometry);
    let (sender, receiver) = crossbeam_channel::unbounded();

    store.commit_exception(
        Exception {
            old_chunk: 1,
            new_chunk: 0,
        },
        Box::new(move |result| sender.send(result.is_ok()).expect("receiver alive")),
    );

    assert!(receiver.recv().expect("must call back"));
    assert_eq!(
        store.read_metadata(&mut |_| panic!("nothing to load")).expect("valid"),
        StoreState::Valid
    );
}
