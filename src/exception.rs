//! Chunks are the unit of remapping: a snapshot's address space is
//! cut into power-of-two, aligned runs of 512-byte sectors, and each
//! chunk is either still shared with the origin, or was copied out to
//! the COW device (an `Exception`).
use serde::Deserialize;
use serde::Serialize;

use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

/// Chunk number, in units of the snapshot's chunk size.
pub type Chunk = u64;

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// Chunks must fit in 32 bits worth of bytes: the persistent header
/// stores the chunk size as a `u32`, and chunk buffers are allocated
/// whole.
pub const MAX_CHUNK_SECTORS: u64 = u32::MAX as u64 >> SECTOR_SHIFT;

/// An `Exception` records that logical chunk `old_chunk` now lives at
/// chunk `new_chunk` of the COW device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Exception {
    pub old_chunk: Chunk,
    pub new_chunk: Chunk,
}

/// The chunk size of a snapshot, with the derived mask and shift.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkGeometry {
    chunk_sectors: u64,
    chunk_mask: u64,
    chunk_shift: u32,
}

impl ChunkGeometry {
    /// Returns the geometry for chunks of `chunk_sectors` sectors,
    /// which must be a power of two no greater than `MAX_CHUNK_SECTORS`.
    pub fn new(chunk_sectors: u64) -> Result<ChunkGeometry> {
        if !chunk_sectors.is_power_of_two() {
            return Err(
                fresh_warn!("Chunk size is not a power of 2", chunk_sectors)
                    .with_kind(ErrorKind::Config),
            );
        }

        if chunk_sectors > MAX_CHUNK_SECTORS {
            return Err(fresh_warn!(
                "chunk size is too large",
                chunk_sectors,
                max = MAX_CHUNK_SECTORS
            )
            .with_kind(ErrorKind::Config));
        }

        Ok(ChunkGeometry {
            chunk_sectors,
            chunk_mask: chunk_sectors - 1,
            chunk_shift: chunk_sectors.trailing_zeros(),
        })
    }

    #[inline(always)]
    pub fn chunk_sectors(&self) -> u64 {
        self.chunk_sectors
    }

    #[inline(always)]
    pub fn chunk_mask(&self) -> u64 {
        self.chunk_mask
    }

    #[inline(always)]
    pub fn chunk_shift(&self) -> u32 {
        self.chunk_shift
    }

    #[inline(always)]
    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_sectors << SECTOR_SHIFT
    }

    #[inline(always)]
    pub fn sector_to_chunk(&self, sector: u64) -> Chunk {
        sector >> self.chunk_shift
    }

    #[inline(always)]
    pub fn chunk_to_sector(&self, chunk: Chunk) -> u64 {
        chunk << self.chunk_shift
    }

    #[inline(always)]
    pub fn offset_in_chunk(&self, sector: u64) -> u64 {
        sector & self.chunk_mask
    }

    /// Returns whether `[sector, sector + count)` fits in a single chunk.
    pub fn within_one_chunk(&self, sector: u64, count: u64) -> bool {
        count <= self.chunk_sectors - self.offset_in_chunk(sector)
    }
}

#[test]
fn test_geometry() {
    let geometry = ChunkGeometry::new(8).expect("8 is a power of two");

    assert_eq!(geometry.chunk_mask(), 7);
    assert_eq!(geometry.chunk_shift(), 3);
    assert_eq!(geometry.chunk_bytes(), 4096);
    assert_eq!(geometry.sector_to_chunk(17), 2);
    assert_eq!(geometry.chunk_to_sector(2), 16);
    assert_eq!(geometry.offset_in_chunk(17), 1);

    assert!(geometry.within_one_chunk(16, 8));
    assert!(geometry.within_one_chunk(20, 4));
    assert!(!geometry.within_one_chunk(20, 5));
}

#[test]
fn test_geometry_rejects_non_power_of_two() {
    for bad in [0u64, 3, 12, 100] {
        let err = ChunkGeometry::new(bad).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    assert!(ChunkGeometry::new(1).is_ok());
}

#[test]
fn test_geometry_rejects_huge_chunks() {
    // 2^60 sectors would wrap `chunk_bytes` to 0.
    for bad in [1u64 << 23, 1 << 32, 1 << 60] {
        let err = ChunkGeometry::new(bad).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    let largest = ChunkGeometry::new(1 << 22).expect("fits in 32 bits");
    assert_eq!(largest.chunk_bytes(), 1 << 31);
}
