//! The persistent store keeps its exceptions on the COW device:
//!
//! - chunk 0 holds a header: magic, valid flag, version, chunk size;
//! - metadata areas come next, each one chunk of `{old, new}` pairs,
//!   and a run of `exceptions_per_area` data chunks follows each area;
//! - an area's list ends at the first record with `new_chunk == 0`
//!   (chunk 0 is the header, so it is never a valid destination).
//!
//! Areas are only written whole, and each commit rewrites the current
//! area synchronously before reporting success.
use std::convert::TryInto;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::instrument;

use crate::chain_error;
use crate::chain_warn;
use crate::device::BlockDevice;
use crate::drop_result;
use crate::exception::Chunk;
use crate::exception::ChunkGeometry;
use crate::exception::Exception;
use crate::fresh_error;
use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

use super::CommitDone;
use super::ExceptionStore;
use super::PersistenceMode;
use super::StoreState;

/// "SnAp", little-endian.
const SNAP_MAGIC: u32 = 0x7041_6e53;

const SNAPSHOT_DISK_VERSION: u32 = 1;

/// The header occupies the first chunk.
const NUM_SNAPSHOT_HDR_CHUNKS: u64 = 1;

/// Each record is two little-endian u64s.
const DISK_EXCEPTION_SIZE: usize = 16;

#[derive(Debug)]
struct PersistentState {
    valid: bool,
    // Next chunk to hand out; never a metadata chunk.
    next_free: Chunk,
    current_area: u64,
    // Number of records in `area`.
    current_committed: usize,
    // In-memory copy of the current metadata area.
    area: Vec<u8>,
}

#[derive(Debug)]
pub struct PersistentStore {
    cow: Arc<dyn BlockDevice>,
    geometry: ChunkGeometry,
    exceptions_per_area: u64,
    state: Mutex<PersistentState>,
}

fn decode_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4 bytes"))
}

fn decode_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8 bytes"))
}

fn read_record(area: &[u8], index: usize) -> Exception {
    let offset = index * DISK_EXCEPTION_SIZE;

    Exception {
        old_chunk: decode_u64(area, offset),
        new_chunk: decode_u64(area, offset + 8),
    }
}

fn write_record(area: &mut [u8], index: usize, exception: Exception) {
    let offset = index * DISK_EXCEPTION_SIZE;

    area[offset..offset + 8].copy_from_slice(&exception.old_chunk.to_le_bytes());
    area[offset + 8..offset + 16].copy_from_slice(&exception.new_chunk.to_le_bytes());
}

impl PersistentStore {
    pub fn new(cow: Arc<dyn BlockDevice>, geometry: ChunkGeometry) -> PersistentStore {
        let exceptions_per_area = geometry.chunk_bytes() / DISK_EXCEPTION_SIZE as u64;
        let area_bytes = geometry.chunk_bytes() as usize;

        PersistentStore {
            cow,
            geometry,
            exceptions_per_area,
            state: Mutex::new(PersistentState {
                valid: true,
                next_free: NUM_SNAPSHOT_HDR_CHUNKS + 1,
                current_area: 0,
                current_committed: 0,
                area: vec![0u8; area_bytes],
            }),
        }
    }

    /// Returns the chunk that holds metadata area `area`.
    fn area_location(&self, area: u64) -> Chunk {
        NUM_SNAPSHOT_HDR_CHUNKS + (self.exceptions_per_area + 1) * area
    }

    /// Returns whether chunk `chunk` lies entirely on the COW device.
    fn chunk_fits(&self, chunk: Chunk) -> bool {
        (chunk + 1) * self.geometry.chunk_sectors() <= self.cow.size_sectors()
    }

    /// Bumps `next_free` past the metadata chunk it may point at.
    fn skip_metadata(&self, next_free: &mut Chunk) {
        let stride = self.exceptions_per_area + 1;

        if *next_free % stride == NUM_SNAPSHOT_HDR_CHUNKS {
            *next_free += 1;
        }
    }

    fn read_chunk(&self, chunk: Chunk, buf: &mut [u8]) -> Result<()> {
        self.cow
            .read_at(self.geometry.chunk_to_sector(chunk), buf)
            .map_err(|e| chain_warn!(e, "failed to read snapshot metadata", chunk))
    }

    fn write_chunk(&self, chunk: Chunk, buf: &[u8]) -> Result<()> {
        self.cow
            .write_at(self.geometry.chunk_to_sector(chunk), buf)
            .map_err(|e| chain_warn!(e, "failed to write snapshot metadata", chunk))
    }

    fn write_header(&self, valid: bool) -> Result<()> {
        let mut header = vec![0u8; self.geometry.chunk_bytes() as usize];

        header[0..4].copy_from_slice(&SNAP_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(valid as u32).to_le_bytes());
        header[8..12].copy_from_slice(&SNAPSHOT_DISK_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&(self.geometry.chunk_sectors() as u32).to_le_bytes());
        self.write_chunk(0, &header)
    }

    /// Writes a header and an empty first area on a blank device.
    fn format(&self, state: &mut PersistentState) -> Result<()> {
        self.write_header(true)?;

        state.area.iter_mut().for_each(|b| *b = 0);
        self.write_chunk(self.area_location(0), &state.area)?;

        state.valid = true;
        state.current_area = 0;
        state.current_committed = 0;
        state.next_free = self.area_location(0) + 1;
        Ok(())
    }

    /// Appends `exception` to the current area, and persists the area.
    fn commit_locked(&self, state: &mut PersistentState, exception: Exception) -> Result<()> {
        let index = state.current_committed;

        write_record(&mut state.area, index, exception);
        state.current_committed += 1;
        self.write_chunk(self.area_location(state.current_area), &state.area)?;

        if state.current_committed as u64 == self.exceptions_per_area {
            state.current_area += 1;
            state.current_committed = 0;
            state.area.iter_mut().for_each(|b| *b = 0);

            // When the device ends before the next area, there is no
            // room for its data chunks either.
            let location = self.area_location(state.current_area);
            if self.chunk_fits(location) {
                self.write_chunk(location, &state.area)?;
            }
        }

        Ok(())
    }
}

impl ExceptionStore for PersistentStore {
    fn mode(&self) -> PersistenceMode {
        PersistenceMode::Persistent
    }

    #[instrument(skip(self, add), fields(cow=%self.cow.name()))]
    fn read_metadata(&self, add: &mut dyn FnMut(Exception)) -> Result<StoreState> {
        let chunk_bytes = self.geometry.chunk_bytes() as usize;
        let mut state = self.state.lock().expect("poisoned lock");
        let mut header = vec![0u8; chunk_bytes];

        self.read_chunk(0, &mut header)?;

        let magic = decode_u32(&header, 0);
        let valid = decode_u32(&header, 4);
        let version = decode_u32(&header, 8);
        let chunk_size = decode_u32(&header, 12);

        if magic == 0 {
            tracing::info!("formatting new persistent snapshot store");
            self.format(&mut state)?;
            return Ok(StoreState::Valid);
        }

        if magic != SNAP_MAGIC {
            return Err(
                fresh_warn!("invalid or corrupt snapshot header", magic)
                    .with_kind(ErrorKind::Config),
            );
        }

        if version != SNAPSHOT_DISK_VERSION {
            return Err(
                fresh_warn!("unsupported snapshot metadata version", version)
                    .with_kind(ErrorKind::Config),
            );
        }

        if chunk_size as u64 != self.geometry.chunk_sectors() {
            return Err(fresh_warn!("chunk size does not match snapshot metadata",
                                   chunk_size, expected=self.geometry.chunk_sectors())
            .with_kind(ErrorKind::Config));
        }

        if valid == 0 {
            state.valid = false;
            return Ok(StoreState::Invalid);
        }

        let mut next_free = self.area_location(0) + 1;
        let mut area = 0;
        let mut loaded = 0usize;

        loop {
            let location = self.area_location(area);
            let mut buf = vec![0u8; chunk_bytes];

            if !self.chunk_fits(location) {
                // Only happens when the last area filled up the device.
                state.area = buf;
                state.current_area = area;
                state.current_committed = 0;
                break;
            }

            self.read_chunk(location, &mut buf)?;

            let mut count = 0;
            for index in 0..self.exceptions_per_area as usize {
                let exception = read_record(&buf, index);
                if exception.new_chunk == 0 {
                    break;
                }

                add(exception);
                next_free = next_free.max(exception.new_chunk + 1);
                count += 1;
            }

            loaded += count;
            if (count as u64) < self.exceptions_per_area {
                state.area = buf;
                state.current_area = area;
                state.current_committed = count;
                break;
            }

            area += 1;
        }

        next_free = next_free.max(self.area_location(state.current_area) + 1);
        self.skip_metadata(&mut next_free);

        state.valid = true;
        state.next_free = next_free;
        tracing::debug!(loaded, next_free, area = state.current_area, "loaded snapshot metadata");
        Ok(StoreState::Valid)
    }

    fn prepare_exception(&self, old_chunk: Chunk) -> Result<Chunk> {
        let mut state = self.state.lock().expect("poisoned lock");

        if !self.chunk_fits(state.next_free) {
            return Err(fresh_warn!("COW device is full",
                                   cow=%self.cow.name(), old_chunk, next_free=state.next_free)
            .with_kind(ErrorKind::NoSpace));
        }

        let new_chunk = state.next_free;
        state.next_free += 1;
        self.skip_metadata(&mut state.next_free);
        Ok(new_chunk)
    }

    fn commit_exception(&self, exception: Exception, on_done: CommitDone) {
        let result = {
            let mut state = self.state.lock().expect("poisoned lock");

            if !state.valid {
                Err(fresh_error!("commit on an invalidated snapshot store", ?exception)
                    .with_kind(ErrorKind::Invalid))
            } else {
                let ret = self.commit_locked(&mut state, exception);

                if ret.is_err() {
                    state.valid = false;
                }

                ret.map_err(|e| chain_error!(e, "failed to commit exception", ?exception))
            }
        };

        on_done(result)
    }

    fn drop_snapshot(&self) {
        self.state.lock().expect("poisoned lock").valid = false;
        drop_result!(self.write_header(false),
                     e => chain_error!(e, "failed to mark snapshot store invalid", cow=%self.cow.name()));
    }

    fn fraction_full(&self) -> Option<(u64, u64)> {
        let next_free = self.state.lock().expect("poisoned lock").next_free;

        Some((
            self.geometry.chunk_to_sector(next_free),
            self.cow.size_sectors(),
        ))
    }
}

#[cfg(test)]
fn commit_sync(store: &PersistentStore, exception: Exception) -> Result<()> {
    let (sender, receiver) = crossbeam_channel::bounded(1);

    store.commit_exception(
        exception,
        Box::new(move |result| sender.send(result).expect("receiver alive")),
    );
    receiver.recv().expect("commit must call back")
}

#[test]
fn test_format_and_allocate() {
    use crate::device::MemoryDevice;

    // 512-byte chunks: 32 records per area.
    let geometry = ChunkGeometry::new(1).expect("valid");
    let cow: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("cow", 100));
    let store = PersistentStore::new(cow.clone(), geometry);

    assert_eq!(
        store.read_metadata(&mut |_| panic!("blank store")).expect("should format"),
        StoreState::Valid
    );

    let mut header = [0u8; 16];
    cow.read_at(0, &mut header).expect("in range");
    assert_eq!(decode_u32(&header, 0), SNAP_MAGIC);
    assert_eq!(decode_u32(&header, 4), 1);
    assert_eq!(decode_u32(&header, 8), SNAPSHOT_DISK_VERSION);
    assert_eq!(decode_u32(&header, 12), 1);

    // Data chunks 2..=33 follow area 0 at chunk 1; area 1 is at 34.
    for i in 0..32 {
        assert_eq!(store.prepare_exception(i).expect("room left"), i + 2);
    }
    assert_eq!(store.prepare_exception(32).expect("room left"), 35);
    assert_eq!(store.fraction_full(), Some((36, 100)));
}

#[test]
fn test_reload_exceptions() {
    use crate::device::MemoryDevice;

    let geometry = ChunkGeometry::new(1).expect("valid");
    let cow: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("cow", 100));
    let store = PersistentStore::new(cow.clone(), geometry);
    store.read_metadata(&mut |_| ()).expect("should format");

    // Fill area 0 and spill one record into area 1.
    let mut committed = Vec::new();
    for old_chunk in 0..33 {
        let new_chunk = store.prepare_exception(old_chunk).expect("room left");
        let exception = Exception {
            old_chunk,
            new_chunk,
        };

        commit_sync(&store, exception).expect("should commit");
        committed.push(exception);
    }

    let reloaded = PersistentStore::new(cow, geometry);
    let mut seen = Vec::new();
    assert_eq!(
        reloaded
            .read_metadata(&mut |exception| seen.push(exception))
            .expect("should load"),
        StoreState::Valid
    );
    assert_eq!(seen, committed);

    // Allocation resumes after the last data chunk.
    assert_eq!(reloaded.prepare_exception(40).expect("room left"), 36);
}

#[test]
fn test_drop_snapshot_persists() {
    use crate::device::MemoryDevice;

    let geometry = ChunkGeometry::new(2).expect("valid");
    let cow: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("cow", 64));
    let store = PersistentStore::new(cow.clone(), geometry);
    store.read_metadata(&mut |_| ()).expect("should format");

    store.drop_snapshot();
    assert_eq!(
        commit_sync(
            &store,
            Exception {
                old_chunk: 0,
                new_chunk: 2
            }
        )
        .expect_err("invalid store")
        .kind(),
        ErrorKind::Invalid
    );

    let reloaded = PersistentStore::new(cow, geometry);
    assert_eq!(
        reloaded.read_metadata(&mut |_| ()).expect("should load"),
        StoreState::Invalid
    );
}

#[test]
fn test_bad_header() {
    use crate::device::MemoryDevice;

    let geometry = ChunkGeometry::new(1).expect("valid");
    let cow: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("cow", 16));
    cow.write_at(0, &[0xffu8; 512]).expect("in range");

    let store = PersistentStore::new(cow.clone(), geometry);
    assert_eq!(
        store.read_metadata(&mut |_| ()).expect_err("bad magic").kind(),
        ErrorKind::Config
    );

    // A valid header for 1-sector chunks doesn't load with 2-sector chunks.
    PersistentStore::new(cow.clone(), geometry)
        .write_header(true)
        .expect("should write");
    let mismatched = PersistentStore::new(cow, ChunkGeometry::new(2).expect("valid"));
    assert_eq!(
        mismatched.read_metadata(&mut |_| ()).expect_err("bad chunk size").kind(),
        ErrorKind::Config
    );
}

#[test]
fn test_out_of_space() {
    use crate::device::MemoryDevice;

    let geometry = ChunkGeometry::new(1).expect("valid");
    let store = PersistentStore::new(Arc::new(MemoryDevice::new("cow", 4)), geometry);
    store.read_metadata(&mut |_| ()).expect("should format");

    assert_eq!(store.prepare_exception(0).expect("room left"), 2);
    assert_eq!(store.prepare_exception(1).expect("room left"), 3);
    assert_eq!(
        store.prepare_exception(2).expect_err("full").kind(),
        ErrorKind::NoSpace
    );
}
