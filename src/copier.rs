//! The copier module implements background threads that copy regions
//! from one block device to another, and report back through a
//! completion callback.  The snapshot engine only sees the
//! `CopyEngine` trait; `Copier` is the default implementation.
use derivative::Derivative;
use std::sync::Arc;

use crate::device::BlockDevice;
use crate::exception::SECTOR_SIZE;

/// A contiguous run of `count` sectors on `device`, starting at `sector`.
#[derive(Clone, Debug)]
pub struct Region {
    pub device: Arc<dyn BlockDevice>,
    pub sector: u64,
    pub count: u64,
}

/// Result of a copy: reading the source and writing the destination
/// fail independently.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CopyOutcome {
    pub read_error: bool,
    pub write_error: bool,
}

impl CopyOutcome {
    pub fn is_ok(&self) -> bool {
        !self.read_error && !self.write_error
    }
}

pub type CopyDone = Box<dyn FnOnce(CopyOutcome) + Send + 'static>;

/// A `CopyEngine` copies a region to another asynchronously, and
/// calls `on_done` exactly once, from any thread.
pub trait CopyEngine: Send + Sync + std::fmt::Debug {
    fn copy(&self, from: Region, to: Region, on_done: CopyDone);
}

#[derive(Derivative)]
#[derivative(Debug)]
struct CopyJob {
    from: Region,
    to: Region,
    #[derivative(Debug = "ignore")]
    on_done: CopyDone,
}

/// A `Copier` is only a message-passing handle to background worker
/// threads.
///
/// When all the underlying `Sender`s have been dropped, the threads
/// will be notified, finish the jobs already queued, and exit.
#[derive(Clone, Debug)]
pub struct Copier {
    jobs: crossbeam_channel::Sender<CopyJob>,
}

impl Copier {
    /// Returns a handle for a fresh Copier with a single worker.
    pub fn new() -> Copier {
        Copier::new_with_workers(1)
    }

    /// Returns a handle for a fresh Copier that runs up to
    /// `num_workers` copies concurrently.
    pub fn new_with_workers(num_workers: usize) -> Copier {
        // Jobs are never dropped: a dropped copy would wedge every
        // write waiting on that chunk.
        let (sender, receiver) = crossbeam_channel::unbounded();

        for i in 0..num_workers.max(1) {
            let receiver = receiver.clone();

            std::thread::Builder::new()
                .name(format!("cowsnap-copier-{}", i))
                .spawn(move || handle_requests(receiver))
                .expect("failed to spawn copier thread");
        }

        Copier { jobs: sender }
    }
}

impl Default for Copier {
    fn default() -> Copier {
        Copier::new()
    }
}

impl CopyEngine for Copier {
    fn copy(&self, from: Region, to: Region, on_done: CopyDone) {
        if let Err(crossbeam_channel::SendError(job)) = self.jobs.send(CopyJob { from, to, on_done }) {
            // Only happens once the workers are gone.  Report a read
            // error rather than leaving the caller hanging.
            tracing::error!(from=?job.from, to=?job.to, "copier workers are gone");
            (job.on_done)(CopyOutcome {
                read_error: true,
                write_error: false,
            });
        }
    }
}

/// Synchronously copies `from` into `to`.  The copy stops at the
/// shorter of the two regions.
pub(crate) fn copy_region(from: &Region, to: &Region) -> CopyOutcome {
    let count = from.count.min(to.count);
    let mut buf = vec![0u8; (count * SECTOR_SIZE) as usize];

    if let Err(e) = from.device.read_at(from.sector, &mut buf) {
        tracing::warn!(?e, ?from, "copy failed to read source region");
        return CopyOutcome {
            read_error: true,
            write_error: false,
        };
    }

    if let Err(e) = to.device.write_at(to.sector, &buf) {
        tracing::warn!(?e, ?to, "copy failed to write destination region");
        return CopyOutcome {
            read_error: false,
            write_error: true,
        };
    }

    CopyOutcome::default()
}

/// Process copy jobs, one at a time.
///
/// When the write ends of the channel are all gone, stop pulling work.
fn handle_requests(receiver: crossbeam_channel::Receiver<CopyJob>) {
    // This only fails when the channel is closed.
    while let Ok(job) = receiver.recv() {
        let outcome = copy_region(&job.from, &job.to);

        tracing::trace!(from=?job.from, to=?job.to, ?outcome, "copy done");
        (job.on_done)(outcome);
    }
}

#[cfg(test)]
fn region(device: &Arc<crate::device::MemoryDevice>, sector: u64, count: u64) -> Region {
    Region {
        device: device.clone(),
        sector,
        count,
    }
}

#[test]
fn test_copier_copies() {
    use crate::device::MemoryDevice;

    let source = Arc::new(MemoryDevice::new("source", 16));
    let dest = Arc::new(MemoryDevice::new("dest", 16));
    source.write_at(8, &[5u8; 4096]).expect("in range");

    let (sender, receiver) = crossbeam_channel::unbounded();
    let copier = Copier::new_with_workers(2);
    copier.copy(
        region(&source, 8, 8),
        region(&dest, 0, 8),
        Box::new(move |outcome| sender.send(outcome).expect("receiver alive")),
    );

    assert!(receiver.recv().expect("must complete").is_ok());

    let mut buf = vec![0u8; 4096];
    dest.read_at(0, &mut buf).expect("in range");
    assert!(buf.iter().all(|b| *b == 5));
}

#[test]
fn test_copier_read_error() {
    use crate::device::MemoryDevice;

    let source = Arc::new(MemoryDevice::new("source", 16));
    let dest = Arc::new(MemoryDevice::new("dest", 16));
    source.set_failing(true);

    let (sender, receiver) = crossbeam_channel::unbounded();
    Copier::new().copy(
        region(&source, 0, 8),
        region(&dest, 0, 8),
        Box::new(move |outcome| sender.send(outcome).expect("receiver alive")),
    );

    let outcome = receiver.recv().expect("must complete");
    assert!(outcome.read_error);
    assert!(!outcome.write_error);
}

#[test]
fn test_copy_region_write_error() {
    use crate::device::MemoryDevice;

    let source = Arc::new(MemoryDevice::new("source", 16));
    // Destination is too short for the copy.
    let dest = Arc::new(MemoryDevice::new("dest", 4));

    let outcome = copy_region(&region(&source, 0, 8), &region(&dest, 0, 8));
    assert_eq!(
        outcome,
        CopyOutcome {
            read_error: false,
            write_error: true
        }
    );
}
