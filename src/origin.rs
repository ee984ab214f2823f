//! The origin side: every write to an origin device must first make
//! each snapshot of that device copy out the chunk being overwritten.
//!
//! `OriginTable` maps origin device names to the snapshots that share
//! them.  Origin writes walk the table under its read lock; snapshots
//! only take the write lock to attach or detach.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use crate::bio::Bio;
use crate::bio::Disposition;
use crate::bio::Target;
use crate::device::BlockDevice;
use crate::exception::ChunkGeometry;
use crate::fresh_warn;
use crate::pending::OriginBarrier;
use crate::result::ErrorKind;
use crate::snapshot::Snapshot;
use crate::table::StatusType;

#[derive(Debug, Default)]
pub(crate) struct OriginTable {
    // Origin device name -> snapshots of that device.
    origins: RwLock<HashMap<String, Vec<Arc<Snapshot>>>>,
}

/// Returns the smallest chunk geometry in `snapshots`.
fn smallest_geometry(snapshots: &[Arc<Snapshot>]) -> Option<ChunkGeometry> {
    snapshots
        .iter()
        .map(|snapshot| snapshot.geometry())
        .min_by_key(|geometry| geometry.chunk_sectors())
}

impl OriginTable {
    /// Attaches `snapshot` to its origin, creating the origin's entry
    /// if needed.
    pub fn register(&self, snapshot: Arc<Snapshot>) {
        let name = snapshot.origin().name().to_string();
        let mut origins = self.origins.write().expect("poisoned lock");

        tracing::debug!(origin=%name, cow=%snapshot.cow().name(), "registering snapshot");
        origins.entry(name).or_default().push(snapshot);
    }

    /// Detaches `snapshot`, and drops the origin's entry once no
    /// snapshot is left.
    pub fn unregister(&self, snapshot: &Arc<Snapshot>) {
        let name = snapshot.origin().name();
        let mut origins = self.origins.write().expect("poisoned lock");

        if let Some(snapshots) = origins.get_mut(name) {
            snapshots.retain(|other| !Arc::ptr_eq(other, snapshot));
            if snapshots.is_empty() {
                origins.remove(name);
            }
        }

        tracing::debug!(origin=%name, cow=%snapshot.cow().name(), "unregistered snapshot");
    }

    /// Returns the number of snapshots attached to the origin `name`.
    pub fn snapshot_count(&self, name: &str) -> usize {
        self.origins
            .read()
            .expect("poisoned lock")
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Returns the largest request, in sectors, that can be sent to
    /// the origin `name` without straddling a snapshot chunk.
    pub fn max_io_sectors(&self, name: &str) -> Option<u64> {
        let origins = self.origins.read().expect("poisoned lock");

        smallest_geometry(origins.get(name)?).map(|geometry| geometry.chunk_sectors())
    }

    /// Holds `bio`, a write already remapped to the origin `name`,
    /// until every snapshot of that origin has preserved the chunk.
    pub fn origin_write(&self, name: &str, bio: Bio) -> Disposition {
        let origins = self.origins.read().expect("poisoned lock");
        let snapshots = match origins.get(name) {
            Some(snapshots) => snapshots,
            None => return Disposition::Remapped(bio),
        };

        // Nothing is overwritten, so no chunk needs saving.
        if bio.len_sectors() == 0 {
            return Disposition::Remapped(bio);
        }

        if let Some(geometry) = smallest_geometry(snapshots) {
            if !geometry.within_one_chunk(bio.sector(), bio.len_sectors()) {
                let error = fresh_warn!("origin write crosses a chunk boundary",
                                        sector=bio.sector(), count=bio.len_sectors(),
                                        chunk_sectors=geometry.chunk_sectors())
                .with_kind(ErrorKind::OutOfRange);
                return Disposition::Failed(bio, error);
            }
        }

        let sector = bio.sector();
        let barrier = OriginBarrier::new(bio);
        for snapshot in snapshots.iter() {
            snapshot.origin_write(sector, &barrier);
        }

        match barrier.arrive() {
            Some(bio) => Disposition::Remapped(bio),
            None => Disposition::Submitted,
        }
    }
}

/// The target in front of an origin device.
#[derive(Debug)]
pub struct OriginTarget {
    device: Arc<dyn BlockDevice>,
    origins: Arc<OriginTable>,
}

impl OriginTarget {
    pub(crate) fn new(device: Arc<dyn BlockDevice>, origins: Arc<OriginTable>) -> OriginTarget {
        OriginTarget { device, origins }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Returns the smallest chunk size of the origin's snapshots, if
    /// it has any.
    pub fn max_io_sectors(&self) -> Option<u64> {
        self.origins.max_io_sectors(self.device.name())
    }
}

impl Target for OriginTarget {
    fn map(&self, mut bio: Bio) -> Disposition {
        let end = bio.sector().checked_add(bio.len_sectors());

        if end.map_or(true, |end| end > self.device.size_sectors()) {
            let error = fresh_warn!("request beyond the end of the origin",
                                    sector=bio.sector(), count=bio.len_sectors(),
                                    size=self.device.size_sectors())
            .with_kind(ErrorKind::OutOfRange);
            return Disposition::Failed(bio, error);
        }

        let sector = bio.sector();
        bio.remap(self.device.clone(), sector);
        if !bio.is_write() {
            return Disposition::Remapped(bio);
        }

        self.origins.origin_write(self.device.name(), bio)
    }

    fn status(&self, status_type: StatusType) -> String {
        match status_type {
            StatusType::Info => String::new(),
            StatusType::Table => self.device.name().to_string(),
        }
    }
}
