//! Test-only consistency checks for a snapshot's exception tables.
use super::Snapshot;
use super::SnapshotState;

impl Snapshot {
    /// Panics unless:
    ///
    /// - every entry sits in the bucket its chunk hashes to;
    /// - no chunk is both pending and committed;
    /// - committed chunks fit on the COW device.
    pub(super) fn check_invariants(&self, state: &SnapshotState) {
        assert!(state.complete.is_well_formed(), "malformed complete table");
        assert!(state.pending.is_well_formed(), "malformed pending table");

        for pending in state.pending.iter() {
            assert!(
                state.complete.lookup(pending.exception.old_chunk).is_none(),
                "chunk {} is both pending and committed",
                pending.exception.old_chunk
            );
        }

        let cow_chunks = self.geometry.sector_to_chunk(self.cow.size_sectors());
        for exception in state.complete.iter() {
            assert!(
                exception.new_chunk < cow_chunks,
                "exception {:?} points past the COW device",
                exception
            );
        }
    }
}
