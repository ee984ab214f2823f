//! The `Registry` is the process-wide context for snapshot and origin
//! targets: it owns the runtime that drives pending exceptions, the
//! copy engine, the named devices targets refer to, and the table of
//! origins.
//!
//! Targets must be dropped before their registry: dropping the
//! registry shuts the runtime down, and abandons in-flight copies.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::Weak;
use tracing::instrument;

use crate::chain_warn;
use crate::copier::Copier;
use crate::copier::CopyEngine;
use crate::device::BlockDevice;
use crate::device::FileDevice;
use crate::exception::ChunkGeometry;
use crate::exception_store::create_store;
use crate::exception_store::ExceptionStore;
use crate::executor::Executor;
use crate::origin::OriginTable;
use crate::origin::OriginTarget;
use crate::result::ErrorKind;
use crate::result::Result;
use crate::snapshot::Snapshot;
use crate::snapshot::SnapshotTarget;
use crate::table::OriginArgs;
use crate::table::SnapshotArgs;
use crate::Options;

#[derive(Debug)]
pub struct Registry {
    options: Options,
    copier: Arc<dyn CopyEngine>,
    devices: RwLock<HashMap<String, Arc<dyn BlockDevice>>>,
    // Files opened by path stay open only while a target holds them.
    opened: RwLock<HashMap<String, Weak<dyn BlockDevice>>>,
    origins: Arc<OriginTable>,
    // Last, so the runtime goes away after everything that uses it.
    executor: Executor,
}

impl Registry {
    /// Returns a registry that copies chunks with a `Copier`.
    #[instrument]
    pub fn new(options: Options) -> Result<Registry> {
        let copier = Arc::new(Copier::new_with_workers(options.copy_threads));

        Registry::with_copy_engine(options, copier)
    }

    /// Returns a registry that copies chunks with `copier`.
    pub fn with_copy_engine(options: Options, copier: Arc<dyn CopyEngine>) -> Result<Registry> {
        let executor = Executor::new(options.exception_threads)?;

        Ok(Registry {
            options,
            copier,
            devices: Default::default(),
            opened: Default::default(),
            origins: Default::default(),
            executor,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Makes `device` available to targets under its name.
    pub fn add_device(&self, device: Arc<dyn BlockDevice>) {
        let name = device.name().to_string();

        tracing::debug!(%name, size=device.size_sectors(), "adding device");
        self.devices
            .write()
            .expect("poisoned lock")
            .insert(name, device);
    }

    /// Returns the device added as `name`, or opens the file at path
    /// `name`.  Targets on the same path share one handle, which is
    /// closed once the last of them is dropped.
    pub fn open_device(&self, name: &str) -> Result<Arc<dyn BlockDevice>> {
        if let Some(device) = self.devices.read().expect("poisoned lock").get(name) {
            return Ok(device.clone());
        }

        if let Some(device) = self
            .opened
            .read()
            .expect("poisoned lock")
            .get(name)
            .and_then(Weak::upgrade)
        {
            return Ok(device);
        }

        let device = FileDevice::open(Path::new(name))
            .map_err(|e| chain_warn!(e, "failed to open device", %name).with_kind(ErrorKind::Config))?;
        let device: Arc<dyn BlockDevice> = Arc::new(device);

        let mut opened = self.opened.write().expect("poisoned lock");

        opened.retain(|_, handle| handle.strong_count() > 0);
        // Someone may have opened the same path while we were.
        if let Some(existing) = opened.get(name).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        opened.insert(name.to_string(), Arc::downgrade(&device));
        Ok(device)
    }

    /// Returns the number of files opened by path that are still held
    /// by a target.
    pub fn open_file_count(&self) -> usize {
        self.opened
            .read()
            .expect("poisoned lock")
            .values()
            .filter(|handle| handle.strong_count() > 0)
            .count()
    }

    /// Constructs a snapshot target from `<origin> <cow> <P|N> <chunk_sectors>`.
    /// The target is attached to its origin, but must be resumed
    /// before it serves I/O.
    #[instrument(skip(self))]
    pub fn create_snapshot(&self, args: &[&str]) -> Result<SnapshotTarget> {
        let args = SnapshotArgs::parse(args)?;
        let mode = args.mode;

        self.build_snapshot(&args, |cow, geometry| create_store(mode, cow, geometry))
    }

    /// Constructs a snapshot target for `args`, with the exception
    /// store `make_store` returns for the COW device.
    pub(crate) fn build_snapshot(
        &self,
        args: &SnapshotArgs,
        make_store: impl FnOnce(Arc<dyn BlockDevice>, ChunkGeometry) -> Arc<dyn ExceptionStore>,
    ) -> Result<SnapshotTarget> {
        let geometry = ChunkGeometry::new(args.chunk_sectors)?;
        let origin = self.open_device(&args.origin)?;
        let cow = self.open_device(&args.cow)?;
        let store = make_store(cow.clone(), geometry);

        let snapshot = Snapshot::new(
            origin,
            cow,
            geometry,
            store,
            self.copier.clone(),
            self.executor.handle(),
            self.options.hash_table_memory_budget,
        )?;

        Ok(SnapshotTarget::new(Arc::new(snapshot), self.origins.clone()))
    }

    /// Constructs an origin target from `<device>`.
    #[instrument(skip(self))]
    pub fn create_origin(&self, args: &[&str]) -> Result<OriginTarget> {
        let args = OriginArgs::parse(args)?;
        let device = self.open_device(&args.device)?;

        Ok(OriginTarget::new(device, self.origins.clone()))
    }

    /// Returns the number of snapshots attached to the origin `name`.
    pub fn snapshot_count(&self, name: &str) -> usize {
        self.origins.snapshot_count(name)
    }
}

#[test]
fn test_open_device() {
    use crate::device::MemoryDevice;

    let registry = Registry::new(Options::default()).expect("should build");
    registry.add_device(Arc::new(MemoryDevice::new("base", 64)));

    let device = registry.open_device("base").expect("registered");
    assert_eq!(device.size_sectors(), 64);

    assert_eq!(
        registry
            .open_device("/nonexistent/cowsnap/device")
            .expect_err("missing file")
            .kind(),
        ErrorKind::Config
    );

    let file = tempfile::NamedTempFile::new().expect("should create temp file");
    file.as_file().set_len(16 * 512).expect("should resize");
    let path = file.path().to_string_lossy().into_owned();
    let first = registry.open_device(&path).expect("should open");
    let second = registry.open_device(&path).expect("should open");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.size_sectors(), 16);
    assert_eq!(registry.open_file_count(), 1);

    std::mem::drop(first);
    assert_eq!(registry.open_file_count(), 1);
    std::mem::drop(second);
    assert_eq!(registry.open_file_count(), 0);

    // Reopening after the last handle went away works.
    assert!(registry.open_device(&path).is_ok());
}

#[test]
fn test_failed_snapshot_releases_devices() {
    let registry = Registry::new(Options::default()).expect("should build");
    let origin = tempfile::NamedTempFile::new().expect("should create temp file");
    origin.as_file().set_len(64 * 512).expect("should resize");
    let origin_path = origin.path().to_string_lossy().into_owned();

    let err = registry
        .create_snapshot(&[origin_path.as_str(), "/nonexistent/cowsnap/cow", "P", "8"])
        .expect_err("missing cow");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(registry.open_file_count(), 0);

    let cow = tempfile::NamedTempFile::new().expect("should create temp file");
    cow.as_file().set_len(64 * 512).expect("should resize");
    let cow_path = cow.path().to_string_lossy().into_owned();

    {
        let _snapshot = registry
            .create_snapshot(&[origin_path.as_str(), cow_path.as_str(), "P", "8"])
            .expect("valid");
        assert_eq!(registry.open_file_count(), 2);
    }

    assert_eq!(registry.open_file_count(), 0);
}

#[test]
fn test_create_targets() {
    use crate::bio::Target;
    use crate::device::MemoryDevice;
    use crate::table::StatusType;

    let registry = Registry::new(Options::default()).expect("should build");
    registry.add_device(Arc::new(MemoryDevice::new("base", 64)));
    registry.add_device(Arc::new(MemoryDevice::new("cow", 64)));

    let origin = registry.create_origin(&["base"]).expect("valid");
    assert_eq!(origin.max_io_sectors(), None);
    assert_eq!(origin.status(StatusType::Table), "base");

    {
        let snapshot = registry
            .create_snapshot(&["base", "cow", "n", "8"])
            .expect("valid");

        assert_eq!(registry.snapshot_count("base"), 1);
        assert_eq!(origin.max_io_sectors(), Some(8));
        assert_eq!(snapshot.status(StatusType::Table), "base cow N 8");
    }

    // Dropping the target detaches it.
    assert_eq!(registry.snapshot_count("base"), 0);
    assert_eq!(origin.max_io_sectors(), None);
}

#[test]
fn test_reject_bad_snapshot() {
    use crate::device::MemoryDevice;

    let registry = Registry::new(Options::default()).expect("should build");
    registry.add_device(Arc::new(MemoryDevice::new("base", 64)));
    registry.add_device(Arc::new(
        MemoryDevice::new("cow4k", 64).with_physical_block_size(4096),
    ));

    let bad: &[&[&str]] = &[
        &["base", "cow4k", "P"],
        &["base", "cow4k", "P", "12"],
        &["base", "missing", "P", "8"],
        // 4 sectors is less than the COW device's 4 KiB block.
        &["base", "cow4k", "P", "4"],
        // Would overflow the chunk size in bytes.
        &["base", "cow4k", "P", "1152921504606846976"],
    ];

    for args in bad {
        let err = registry.create_snapshot(args).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    assert_eq!(registry.snapshot_count("base"), 0);
    assert!(registry.create_snapshot(&["base", "cow4k", "P", "8"]).is_ok());
}
