//! A `Snapshot` is a writable, point-in-time view of an origin device.
//! Chunks start out shared with the origin; a chunk is copied out to
//! the COW device the first time either side writes to it, and the
//! snapshot then remaps every access to that chunk to the copy.
//!
//! Each chunk being copied has a `PendingException`, and one tokio task
//! that drives it: wait for the copy, wait for the exception store to
//! commit the remapping, then release (or fail) everything that was
//! waiting on the chunk.
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::instrument;

use crate::bio::Bio;
use crate::bio::Disposition;
use crate::bio::Target;
use crate::chain_error;
use crate::chain_warn;
use crate::copier::CopyEngine;
use crate::copier::Region;
use crate::device::BlockDevice;
use crate::exception::Chunk;
use crate::exception::ChunkGeometry;
use crate::exception::Exception;
use crate::exception_store::ExceptionStore;
use crate::exception_store::PersistenceMode;
use crate::exception_store::StoreState;
use crate::exception_table::table_sizes;
use crate::exception_table::ExceptionTable;
use crate::executor::spawn_on;
use crate::fresh_error;
use crate::fresh_warn;
use crate::origin::OriginTable;
use crate::pending::release_barriers;
use crate::pending::OriginBarrier;
use crate::pending::PendingException;
use crate::result::Error;
use crate::result::ErrorKind;
use crate::result::Result;
use crate::table::StatusType;

#[cfg(any(test, feature = "validate_tables"))]
mod invariants;

/// Raise an event whenever usage grows by this many percentage points.
const WAKE_UP_PERCENT: u64 = 5;

/// Where a snapshot chunk currently lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkState {
    /// Still shared with the origin.
    Absent,
    /// Being copied out.
    Pending,
    /// Remapped to this chunk of the COW device.
    Committed(Chunk),
}

#[derive(Debug)]
struct SnapshotState {
    // Cleared for good on the first unrecoverable error.
    valid: bool,
    // Set once `resume` has read the store's metadata.
    loaded: bool,
    complete: ExceptionTable<Exception>,
    pending: ExceptionTable<PendingException>,
}

#[derive(Debug)]
pub struct Snapshot {
    origin: Arc<dyn BlockDevice>,
    cow: Arc<dyn BlockDevice>,
    geometry: ChunkGeometry,
    store: Arc<dyn ExceptionStore>,
    copier: Arc<dyn CopyEngine>,
    runtime: Handle,
    state: RwLock<SnapshotState>,
    // Usage, in percent, when we last raised an event for it.
    last_percent: AtomicU64,
    events: AtomicU64,
}

impl Snapshot {
    /// Returns a snapshot of `origin` that stores its copies on `cow`.
    /// The snapshot is inactive until `resume`d.
    #[instrument(skip(origin, cow, store, copier, runtime), fields(origin=%origin.name(), cow=%cow.name()))]
    pub(crate) fn new(
        origin: Arc<dyn BlockDevice>,
        cow: Arc<dyn BlockDevice>,
        geometry: ChunkGeometry,
        store: Arc<dyn ExceptionStore>,
        copier: Arc<dyn CopyEngine>,
        runtime: Handle,
        hash_table_memory_budget: usize,
    ) -> Result<Snapshot> {
        let block_size = cow.physical_block_size() as u64;

        if block_size == 0 || geometry.chunk_bytes() % block_size != 0 {
            return Err(fresh_warn!("chunk size is not a multiple of the COW device's block size",
                                   chunk_sectors=geometry.chunk_sectors(), block_size)
            .with_kind(ErrorKind::Config));
        }

        let (complete_buckets, pending_buckets) = table_sizes(
            origin.size_sectors(),
            cow.size_sectors(),
            geometry,
            hash_table_memory_budget,
        );
        tracing::debug!(complete_buckets, pending_buckets, "sized exception tables");

        Ok(Snapshot {
            origin,
            cow,
            geometry,
            store,
            copier,
            runtime,
            state: RwLock::new(SnapshotState {
                valid: true,
                loaded: false,
                complete: ExceptionTable::new(complete_buckets),
                pending: ExceptionTable::new(pending_buckets),
            }),
            last_percent: AtomicU64::new(0),
            events: AtomicU64::new(0),
        })
    }

    pub fn origin(&self) -> &Arc<dyn BlockDevice> {
        &self.origin
    }

    pub fn cow(&self) -> &Arc<dyn BlockDevice> {
        &self.cow
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    pub fn mode(&self) -> PersistenceMode {
        self.store.mode()
    }

    pub fn is_valid(&self) -> bool {
        self.state.read().expect("poisoned lock").valid
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().expect("poisoned lock").loaded
    }

    /// Number of committed exceptions.
    pub fn exception_count(&self) -> usize {
        self.state.read().expect("poisoned lock").complete.len()
    }

    /// Number of chunks currently being copied.
    pub fn pending_count(&self) -> usize {
        self.state.read().expect("poisoned lock").pending.len()
    }

    /// Number of events (usage thresholds, invalidation) raised so far.
    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn chunk_state(&self, chunk: Chunk) -> ChunkState {
        let state = self.state.read().expect("poisoned lock");

        if let Some(exception) = state.complete.lookup(chunk) {
            return ChunkState::Committed(exception.new_chunk);
        }

        if state.pending.lookup(chunk).is_some() {
            return ChunkState::Pending;
        }

        ChunkState::Absent
    }

    /// Loads committed exceptions from the store, and activates the
    /// snapshot.  Only the first successful call does anything.
    #[instrument(skip(self), fields(origin=%self.origin.name(), cow=%self.cow.name()))]
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.write().expect("poisoned lock");

        if state.loaded {
            return Ok(());
        }

        let complete = &mut state.complete;
        let store_state = self
            .store
            .read_metadata(&mut |exception| complete.insert(exception))
            .map_err(|e| chain_warn!(e, "failed to read snapshot metadata"))?;

        if store_state == StoreState::Invalid {
            tracing::warn!("snapshot store is marked invalid");
            state.valid = false;
        }

        state.loaded = true;
        tracing::info!(exceptions = state.complete.len(), valid = state.valid, "snapshot resumed");
        self.check_invariants(&state);
        Ok(())
    }

    /// Returns `sector` of chunk `new_chunk` on the COW device.
    fn cow_sector(&self, new_chunk: Chunk, sector: u64) -> u64 {
        self.geometry.chunk_to_sector(new_chunk) + self.geometry.offset_in_chunk(sector)
    }

    /// Requests must fit in the origin, and in a single chunk.
    fn check_range(&self, bio: &Bio) -> Result<()> {
        let sector = bio.sector();
        let count = bio.len_sectors();
        let end = sector.checked_add(count);

        if end.map_or(true, |end| end > self.origin.size_sectors()) {
            return Err(fresh_warn!("request beyond the end of the snapshot",
                                   sector, count, size=self.origin.size_sectors())
            .with_kind(ErrorKind::OutOfRange));
        }

        if !self.geometry.within_one_chunk(sector, count) {
            return Err(fresh_warn!("request crosses a chunk boundary",
                                   sector, count, chunk_sectors=self.geometry.chunk_sectors())
            .with_kind(ErrorKind::OutOfRange));
        }

        Ok(())
    }

    /// Dispatches a request addressed to the snapshot device.
    pub fn map(self: &Arc<Self>, bio: Bio) -> Disposition {
        if let Err(e) = self.check_range(&bio) {
            return Disposition::Failed(bio, e);
        }

        if bio.is_write() {
            self.map_write(bio)
        } else {
            self.map_read(bio)
        }
    }

    fn map_read(&self, mut bio: Bio) -> Disposition {
        let state = self.state.read().expect("poisoned lock");
        let sector = bio.sector();

        if !state.loaded {
            return Disposition::Failed(bio, not_resumed());
        }

        // Invalid snapshots fall back to the origin.
        if state.valid {
            if let Some(exception) = state.complete.lookup(self.geometry.sector_to_chunk(sector)) {
                bio.remap(self.cow.clone(), self.cow_sector(exception.new_chunk, sector));
                return Disposition::Remapped(bio);
            }
        }

        bio.remap(self.origin.clone(), sector);
        Disposition::Remapped(bio)
    }

    fn map_write(self: &Arc<Self>, mut bio: Bio) -> Disposition {
        let mut state = self.state.write().expect("poisoned lock");
        let sector = bio.sector();
        let chunk = self.geometry.sector_to_chunk(sector);

        if !state.loaded {
            return Disposition::Failed(bio, not_resumed());
        }

        if !state.valid {
            return Disposition::Failed(
                bio,
                fresh_warn!("write to an invalid snapshot", sector).with_kind(ErrorKind::Invalid),
            );
        }

        if let Some(exception) = state.complete.lookup(chunk) {
            bio.remap(self.cow.clone(), self.cow_sector(exception.new_chunk, sector));
            return Disposition::Remapped(bio);
        }

        // An empty write has no data to redirect.
        if bio.len_sectors() == 0 {
            bio.remap(self.origin.clone(), sector);
            return Disposition::Remapped(bio);
        }

        let pending = match self.find_or_create_pending(&mut state, chunk) {
            Ok(pending) => pending,
            Err(e) => {
                self.invalidate_locked(&mut state, &e);
                return Disposition::Failed(bio, e);
            }
        };

        bio.remap(self.cow.clone(), self.cow_sector(pending.exception.new_chunk, sector));
        pending.snapshot_bios.push(bio);
        if !pending.started {
            pending.started = true;
            self.start_copy(pending.exception);
        }

        self.check_invariants(&state);
        Disposition::Submitted
    }

    /// Makes the origin write behind `barrier`, to a chunk that
    /// contains `sector`, wait until that chunk is copied out.
    ///
    /// Failing to set up the copy invalidates the snapshot, which then
    /// stops holding origin writes back.
    pub(crate) fn origin_write(self: &Arc<Self>, sector: u64, barrier: &Arc<OriginBarrier>) {
        let mut state = self.state.write().expect("poisoned lock");
        let chunk = self.geometry.sector_to_chunk(sector);

        if !state.loaded || !state.valid {
            return;
        }

        if state.complete.lookup(chunk).is_some() {
            return;
        }

        let pending = match self.find_or_create_pending(&mut state, chunk) {
            Ok(pending) => pending,
            Err(e) => {
                self.invalidate_locked(&mut state, &e);
                return;
            }
        };

        barrier.join();
        pending.origin_barriers.push(barrier.clone());
        if !pending.started {
            pending.started = true;
            self.start_copy(pending.exception);
        }

        self.check_invariants(&state);
    }

    fn find_or_create_pending<'a>(
        &self,
        state: &'a mut SnapshotState,
        chunk: Chunk,
    ) -> Result<&'a mut PendingException> {
        if state.pending.lookup(chunk).is_none() {
            let new_chunk = self
                .store
                .prepare_exception(chunk)
                .map_err(|e| chain_error!(e, "failed to allocate an exception", chunk))?;
            let exception = Exception {
                old_chunk: chunk,
                new_chunk,
            };

            tracing::debug!(?exception, "new pending exception");
            state.pending.insert(PendingException::new(exception));
        }

        Ok(state
            .pending
            .lookup_mut(chunk)
            .expect("pending exception must exist"))
    }

    /// Marks the snapshot invalid for good.  Only the first call has
    /// any effect.
    fn invalidate_locked(&self, state: &mut SnapshotState, cause: &Error) {
        if !state.valid {
            return;
        }

        state.valid = false;
        self.store.drop_snapshot();
        tracing::error!(origin=%self.origin.name(), cow=%self.cow.name(),
                        root_id=%cause.initial_id(), kind=?cause.kind(),
                        "invalidating snapshot");
        self.raise_event();
    }

    fn raise_event(&self) {
        let count = self.events.fetch_add(1, Ordering::Relaxed) + 1;

        tracing::info!(origin=%self.origin.name(), cow=%self.cow.name(), count, "snapshot event");
    }

    /// Raises an event if usage went up by at least `WAKE_UP_PERCENT`
    /// since the last report.
    fn maybe_report_usage(&self) {
        let (used, total) = match self.store.fraction_full() {
            Some((used, total)) if total > 0 => (used, total),
            _ => return,
        };

        let percent = used.saturating_mul(100) / total;
        let last = self.last_percent.load(Ordering::Relaxed);
        if percent < last + WAKE_UP_PERCENT {
            return;
        }

        let rounded = percent - percent % WAKE_UP_PERCENT;
        if self
            .last_percent
            .compare_exchange(last, rounded, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(used, total, percent, "snapshot usage crossed a threshold");
            self.raise_event();
        }
    }

    fn start_copy(self: &Arc<Self>, exception: Exception) {
        let snapshot = self.clone();

        spawn_on(&self.runtime, async move {
            let result = match snapshot.copy_chunk(exception).await {
                Ok(()) => snapshot.commit(exception).await,
                Err(e) => Err(e),
            };

            // Releasing the queued requests performs their I/O.
            let completed = tokio::task::spawn_blocking(move || {
                snapshot.pending_complete(exception, result)
            })
            .await;
            if let Err(e) = completed {
                let _ = fresh_error!("failed to complete pending exception", ?exception, %e);
            }
        });
    }

    /// Copies the old contents of the chunk to its new home.
    async fn copy_chunk(&self, exception: Exception) -> Result<()> {
        let start = self.geometry.chunk_to_sector(exception.old_chunk);
        // The last chunk may extend past the end of the origin.
        let count = self
            .geometry
            .chunk_sectors()
            .min(self.origin.size_sectors().saturating_sub(start));
        let from = Region {
            device: self.origin.clone(),
            sector: start,
            count,
        };
        let to = Region {
            device: self.cow.clone(),
            sector: self.geometry.chunk_to_sector(exception.new_chunk),
            count,
        };
        let (sender, receiver) = oneshot::channel();

        tracing::debug!(?exception, count, "copying chunk");
        self.copier.copy(
            from,
            to,
            Box::new(move |outcome| {
                let _ = sender.send(outcome);
            }),
        );

        let outcome = receiver.await.map_err(|_| {
            fresh_error!("copy engine dropped a copy", ?exception).with_kind(ErrorKind::Io)
        })?;

        if !outcome.is_ok() {
            return Err(fresh_error!("failed to copy chunk",
                                    ?exception, read_error=outcome.read_error, write_error=outcome.write_error)
            .with_kind(ErrorKind::Io));
        }

        Ok(())
    }

    /// Asks the store to persist a copied exception.
    async fn commit(&self, exception: Exception) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        let store = self.store.clone();

        // Persistent stores write metadata synchronously.
        tokio::task::spawn_blocking(move || {
            store.commit_exception(
                exception,
                Box::new(move |result| {
                    let _ = sender.send(result);
                }),
            )
        });

        let result = receiver.await.map_err(|_| {
            fresh_error!("exception store dropped a commit", ?exception).with_kind(ErrorKind::Io)
        })?;

        result.map_err(|e| chain_warn!(e, "failed to commit exception", ?exception))
    }

    /// Resolves the pending exception for `exception`, and releases
    /// every request that waited on it.
    fn pending_complete(&self, exception: Exception, result: Result<()>) {
        let (pending, failure) = {
            let mut state = self.state.write().expect("poisoned lock");
            let pending = state.pending.remove(exception.old_chunk);
            let failure = match result {
                Ok(()) if state.valid => {
                    state.complete.insert(exception);
                    None
                }
                Ok(()) => Some(
                    fresh_warn!("snapshot was invalidated during the copy", ?exception)
                        .with_kind(ErrorKind::Invalid),
                ),
                Err(e) => {
                    self.invalidate_locked(&mut state, &e);
                    Some(e)
                }
            };

            self.check_invariants(&state);
            (pending, failure)
        };

        let pending = match pending {
            Some(pending) => pending,
            None => {
                let _ = fresh_error!("completed an unknown pending exception", ?exception);
                return;
            }
        };

        match &failure {
            None => {
                tracing::debug!(?exception, "exception committed");
                self.maybe_report_usage();
            }
            Some(error) => {
                tracing::debug!(?exception, root_id=%error.initial_id(), "pending exception failed")
            }
        }

        for bio in pending.snapshot_bios {
            match &failure {
                None => bio.submit(),
                Some(error) => bio.endio(Err(error.clone())),
            }
        }

        for bio in release_barriers(pending.origin_barriers) {
            bio.submit();
        }
    }

    pub fn status(&self, status_type: StatusType) -> String {
        match status_type {
            StatusType::Info => {
                if !self.is_valid() {
                    return "Invalid".to_string();
                }

                match self.store.fraction_full() {
                    Some((used, total)) => format!("{}/{}", used, total),
                    None => "Unknown".to_string(),
                }
            }
            StatusType::Table => format!(
                "{} {} {} {}",
                self.origin.name(),
                self.cow.name(),
                self.store.mode().as_char(),
                self.geometry.chunk_sectors()
            ),
        }
    }

    #[cfg(not(any(test, feature = "validate_tables")))]
    #[inline(always)]
    fn check_invariants(&self, _state: &SnapshotState) {}
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(_) => return,
        };

        state.complete.drain();
        if state.pending.is_empty() {
            return;
        }

        // Only happens when the runtime went away under in-flight
        // copies.  Nothing will resolve them now.
        tracing::warn!(origin=%self.origin.name(), cow=%self.cow.name(),
                       pending=state.pending.len(), "tearing down snapshot with pending exceptions");
        for pending in state.pending.drain() {
            let error = fresh_warn!("snapshot torn down during copy", exception=?pending.exception)
                .with_kind(ErrorKind::Invalid);

            for bio in pending.snapshot_bios {
                bio.endio(Err(error.clone()));
            }

            for bio in release_barriers(pending.origin_barriers) {
                bio.submit();
            }
        }
    }
}

fn not_resumed() -> Error {
    fresh_warn!("snapshot is not resumed").with_kind(ErrorKind::Invalid)
}

/// The control-plane handle for a snapshot target.  Dropping it
/// detaches the snapshot from its origin.
#[derive(Debug)]
pub struct SnapshotTarget {
    snapshot: Arc<Snapshot>,
    origins: Arc<OriginTable>,
}

impl SnapshotTarget {
    pub(crate) fn new(snapshot: Arc<Snapshot>, origins: Arc<OriginTable>) -> SnapshotTarget {
        origins.register(snapshot.clone());
        SnapshotTarget { snapshot, origins }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }
}

impl Target for SnapshotTarget {
    fn map(&self, bio: Bio) -> Disposition {
        self.snapshot.map(bio)
    }

    fn status(&self, status_type: StatusType) -> String {
        self.snapshot.status(status_type)
    }

    fn resume(&self) -> Result<()> {
        self.snapshot.resume()
    }
}

impl Drop for SnapshotTarget {
    fn drop(&mut self) {
        self.origins.unregister(&self.snapshot);
    }
}
