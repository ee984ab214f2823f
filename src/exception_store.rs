//! An exception store decides where copied-out chunks land on the COW
//! device, and remembers the resulting exceptions.  Persistent stores
//! keep them in metadata on the COW device itself, so a snapshot
//! survives reactivation; transient stores only keep them in memory.
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;

use crate::device::BlockDevice;
use crate::exception::Chunk;
use crate::exception::ChunkGeometry;
use crate::exception::Exception;
use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

mod persistent;
mod transient;

pub use persistent::PersistentStore;
pub use transient::TransientStore;

/// Called once the commit has been persisted, or has failed.
pub type CommitDone = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    Persistent,
    Transient,
}

impl PersistenceMode {
    /// Parses a `P`/`N` flag (any case), or the full mode name.
    pub fn parse(arg: &str) -> Result<PersistenceMode> {
        match arg.to_ascii_lowercase().as_str() {
            "p" | "persistent" => Ok(PersistenceMode::Persistent),
            "n" | "transient" => Ok(PersistenceMode::Transient),
            _ => Err(fresh_warn!("invalid persistence mode; must be P or N", %arg)
                .with_kind(ErrorKind::Config)),
        }
    }

    /// Returns the flag used in table lines.
    pub fn as_char(&self) -> char {
        match self {
            PersistenceMode::Persistent => 'P',
            PersistenceMode::Transient => 'N',
        }
    }
}

/// What the store found when loading its metadata.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreState {
    Valid,
    /// The snapshot was invalidated before; it stays invalid.
    Invalid,
}

pub trait ExceptionStore: Send + Sync + std::fmt::Debug {
    fn mode(&self) -> PersistenceMode;

    /// Loads previously committed exceptions, passing each to `add`.
    fn read_metadata(&self, add: &mut dyn FnMut(Exception)) -> Result<StoreState>;

    /// Reserves a destination chunk for a copy of `old_chunk`.
    ///
    /// Fails with `ErrorKind::NoSpace` when the COW device is full.
    fn prepare_exception(&self, old_chunk: Chunk) -> Result<Chunk>;

    /// Persists `exception`, whose copy has completed, then calls
    /// `on_done`.  `on_done` is never called with the store's locks
    /// held.
    fn commit_exception(&self, exception: Exception, on_done: CommitDone);

    /// Permanently marks the snapshot as invalid.
    fn drop_snapshot(&self);

    /// Returns `(used, total)` sectors on the COW device, if known.
    fn fraction_full(&self) -> Option<(u64, u64)> {
        None
    }
}

/// Returns a fresh store for `mode` on `cow`.
pub fn create_store(
    mode: PersistenceMode,
    cow: Arc<dyn BlockDevice>,
    geometry: ChunkGeometry,
) -> Arc<dyn ExceptionStore> {
    match mode {
        PersistenceMode::Persistent => Arc::new(PersistentStore::new(cow, geometry)),
        PersistenceMode::Transient => Arc::new(TransientStore::new(cow, geometry)),
    }
}

#[test]
fn test_parse_persistence_mode() {
    assert_eq!(
        PersistenceMode::parse("P").expect("valid"),
        PersistenceMode::Persistent
    );
    assert_eq!(
        PersistenceMode::parse("n").expect("valid"),
        PersistenceMode::Transient
    );
    assert_eq!(
        PersistenceMode::parse("Transient").expect("valid"),
        PersistenceMode::Transient
    );
    assert_eq!(
        PersistenceMode::parse("X").expect_err("invalid").kind(),
        ErrorKind::Config
    );

    assert_eq!(PersistenceMode::Persistent.as_char(), 'P');
    assert_eq!(PersistenceMode::Transient.as_char(), 'N');
}
