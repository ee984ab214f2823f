//! An `ExceptionTable` indexes exceptions (committed or pending) by
//! their origin chunk.  Tables are sized once, when the snapshot is
//! created, and never rehashed: the bucket for a chunk is the chunk
//! number truncated to the bucket mask.
use crate::exception::Chunk;
use crate::exception::ChunkGeometry;
use crate::exception::Exception;

/// Default bound, in bytes, on the bucket array of a complete table.
pub const DEFAULT_HASH_TABLE_MEMORY_BUDGET: usize = 2 << 20;

/// Pending tables never have fewer buckets than this.
const MIN_PENDING_BUCKETS: usize = 64;

/// Anything that is keyed on its origin chunk can live in a table.
pub(crate) trait TableEntry {
    fn chunk(&self) -> Chunk;
}

impl TableEntry for Exception {
    #[inline(always)]
    fn chunk(&self) -> Chunk {
        self.old_chunk
    }
}

#[derive(Debug)]
pub(crate) struct ExceptionTable<T> {
    mask: u64,
    buckets: Box<[Vec<T>]>,
    len: usize,
}

impl<T: TableEntry> ExceptionTable<T> {
    /// Returns an empty table with `num_buckets` buckets, which must
    /// be a power of two.
    pub fn new(num_buckets: usize) -> ExceptionTable<T> {
        assert!(
            num_buckets.is_power_of_two(),
            "bucket count must be a power of two"
        );

        ExceptionTable {
            mask: (num_buckets - 1) as u64,
            buckets: (0..num_buckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    #[inline(always)]
    fn bucket_index(&self, chunk: Chunk) -> usize {
        (chunk & self.mask) as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `entry`.  The caller must make sure there isn't already
    /// an entry for the same chunk.
    pub fn insert(&mut self, entry: T) {
        let index = self.bucket_index(entry.chunk());

        debug_assert!(self.buckets[index]
            .iter()
            .all(|other| other.chunk() != entry.chunk()));
        self.buckets[index].push(entry);
        self.len += 1;
    }

    pub fn lookup(&self, chunk: Chunk) -> Option<&T> {
        self.buckets[self.bucket_index(chunk)]
            .iter()
            .find(|entry| entry.chunk() == chunk)
    }

    pub fn lookup_mut(&mut self, chunk: Chunk) -> Option<&mut T> {
        let index = self.bucket_index(chunk);

        self.buckets[index]
            .iter_mut()
            .find(|entry| entry.chunk() == chunk)
    }

    /// Removes and returns the entry for `chunk`, if any.
    pub fn remove(&mut self, chunk: Chunk) -> Option<T> {
        let index = self.bucket_index(chunk);
        let bucket = &mut self.buckets[index];
        let position = bucket.iter().position(|entry| entry.chunk() == chunk)?;

        self.len -= 1;
        Some(bucket.swap_remove(position))
    }

    #[cfg(any(test, feature = "validate_tables"))]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buckets.iter().flat_map(|bucket| bucket.iter())
    }

    /// Removes every entry from the table.
    pub fn drain(&mut self) -> Vec<T> {
        let mut ret = Vec::with_capacity(self.len);

        for bucket in self.buckets.iter_mut() {
            ret.append(bucket);
        }

        self.len = 0;
        ret
    }

    /// Returns whether every entry sits in the bucket its chunk hashes to.
    #[cfg(any(test, feature = "validate_tables"))]
    pub fn is_well_formed(&self) -> bool {
        let placed = self.buckets.iter().enumerate().all(|(index, bucket)| {
            bucket
                .iter()
                .all(|entry| self.bucket_index(entry.chunk()) == index)
        });

        placed && self.iter().count() == self.len
    }
}

/// Returns the bucket counts for the complete and pending tables of a
/// snapshot over an origin of `origin_sectors`, with a COW device of
/// `cow_sectors`.
///
/// The complete table gets one bucket per chunk that could ever be
/// remapped, capped so the bucket array fits in `memory_budget` bytes,
/// and rounded down to a power of two.  The pending table gets an
/// eighth of that, but at least `MIN_PENDING_BUCKETS`.
pub(crate) fn table_sizes(
    origin_sectors: u64,
    cow_sectors: u64,
    geometry: ChunkGeometry,
    memory_budget: usize,
) -> (usize, usize) {
    let max_buckets = (memory_budget / std::mem::size_of::<Vec<Exception>>()).max(1) as u64;
    let wanted = (origin_sectors.min(cow_sectors) >> geometry.chunk_shift()).min(max_buckets);

    let complete = round_down_pow2(wanted) as usize;
    let pending = (complete >> 3).max(MIN_PENDING_BUCKETS);

    (complete, pending)
}

fn round_down_pow2(value: u64) -> u64 {
    if value == 0 {
        return 1;
    }

    1 << (63 - value.leading_zeros())
}

#[test]
fn test_insert_lookup_remove() {
    let mut table = ExceptionTable::new(4);

    for old_chunk in 0..10 {
        table.insert(Exception {
            old_chunk,
            new_chunk: old_chunk + 100,
        });
    }

    assert_eq!(table.len(), 10);
    assert!(table.is_well_formed());
    assert_eq!(table.lookup(5).map(|e| e.new_chunk), Some(105));
    assert_eq!(table.lookup(10), None);

    // Chunks 1, 5 and 9 share a bucket; removing one must leave the others.
    assert_eq!(table.remove(5).map(|e| e.new_chunk), Some(105));
    assert_eq!(table.remove(5), None);
    assert_eq!(table.lookup(1).map(|e| e.new_chunk), Some(101));
    assert_eq!(table.lookup(9).map(|e| e.new_chunk), Some(109));
    assert_eq!(table.len(), 9);
    assert!(table.is_well_formed());

    let drained = table.drain();
    assert_eq!(drained.len(), 9);
    assert!(table.is_empty());
    assert_eq!(table.lookup(1), None);
}

#[test]
fn test_lookup_mut() {
    let mut table = ExceptionTable::new(1);

    table.insert(Exception {
        old_chunk: 3,
        new_chunk: 4,
    });
    table.lookup_mut(3).expect("must exist").new_chunk = 7;

    assert_eq!(table.lookup(3).map(|e| e.new_chunk), Some(7));
}

#[test]
fn test_table_sizes() {
    let geometry = ChunkGeometry::new(8).expect("valid");

    // 1000 chunks on the smaller device -> 512 buckets.
    assert_eq!(
        table_sizes(8000, 1 << 30, geometry, DEFAULT_HASH_TABLE_MEMORY_BUDGET),
        (512, 64)
    );

    // Huge devices are capped by the memory budget.
    let (complete, pending) = table_sizes(1 << 40, 1 << 40, geometry, 1 << 20);
    assert!(complete.is_power_of_two());
    assert!(complete * std::mem::size_of::<Vec<Exception>>() <= 1 << 20);
    assert_eq!(pending, complete >> 3);

    // Tiny devices still get a usable table.
    assert_eq!(table_sizes(4, 4, geometry, 1 << 20), (1, 64));
}
