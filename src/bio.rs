//! A `Bio` is one block I/O request: a direction, a starting sector,
//! a buffer, and a completion callback.  Targets map bios: they
//! either redirect a bio to a device for the caller to submit, or take
//! ownership and complete it later.
use derivative::Derivative;
use std::sync::Arc;

use crate::device::BlockDevice;
use crate::exception::SECTOR_SIZE;
use crate::fresh_error;
use crate::result::Error;
use crate::result::Result;
use crate::table::StatusType;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// Called exactly once when a bio completes, with the bio itself (so
/// readers can get their data back) and the outcome.
///
/// Queued bios live in tables shared between threads, hence `Sync`.
pub type EndIo = Box<dyn FnOnce(Bio, Result<()>) + Send + Sync + 'static>;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Bio {
    direction: Direction,
    sector: u64,
    // Write payload, or destination buffer for reads.
    #[derivative(Debug = "ignore")]
    data: Vec<u8>,
    // Where `submit` sends the bio; set when a target remaps it.
    device: Option<Arc<dyn BlockDevice>>,
    #[derivative(Debug = "ignore")]
    end_io: Option<EndIo>,
}

impl Bio {
    /// Returns a request to read `sectors` sectors at `sector`.
    pub fn read(sector: u64, sectors: u64) -> Bio {
        Bio {
            direction: Direction::Read,
            sector,
            data: vec![0u8; (sectors * SECTOR_SIZE) as usize],
            device: None,
            end_io: None,
        }
    }

    /// Returns a request to write `data` at `sector`.  `data` should
    /// be a whole number of sectors.
    pub fn write(sector: u64, data: Vec<u8>) -> Bio {
        Bio {
            direction: Direction::Write,
            sector,
            data,
            device: None,
            end_io: None,
        }
    }

    /// Sets the completion callback.
    pub fn on_complete(
        mut self,
        end_io: impl FnOnce(Bio, Result<()>) + Send + Sync + 'static,
    ) -> Bio {
        self.end_io = Some(Box::new(end_io));
        self
    }

    #[inline(always)]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline(always)]
    pub fn is_write(&self) -> bool {
        self.direction == Direction::Write
    }

    #[inline(always)]
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Returns the length of the request, rounded up to whole sectors.
    pub fn len_sectors(&self) -> u64 {
        (self.data.len() as u64 + SECTOR_SIZE - 1) / SECTOR_SIZE
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn device(&self) -> Option<&Arc<dyn BlockDevice>> {
        self.device.as_ref()
    }

    /// Redirects the bio to `sector` on `device`.
    pub fn remap(&mut self, device: Arc<dyn BlockDevice>, sector: u64) {
        self.device = Some(device);
        self.sector = sector;
    }

    /// Performs the I/O on the bio's device, and completes the bio.
    pub fn submit(mut self) {
        let result = match self.device.clone() {
            None => Err(fresh_error!(
                "bio submitted without a device",
                sector = self.sector
            )),
            Some(device) => match self.direction {
                Direction::Read => device.read_at(self.sector, &mut self.data),
                Direction::Write => device.write_at(self.sector, &self.data),
            },
        };

        self.endio(result);
    }

    /// Completes the bio with `result`, without any I/O.
    pub fn endio(mut self, result: Result<()>) {
        if let Some(end_io) = self.end_io.take() {
            end_io(self, result);
        }
    }
}

/// What a target did with a bio it was asked to map.
#[derive(Debug)]
pub enum Disposition {
    /// The bio was redirected; the caller must submit it.
    Remapped(Bio),
    /// The target now owns the bio, and will complete it.
    Submitted,
    /// The bio must be completed with this error.
    Failed(Bio, Error),
}

/// A `Target` sits in front of one or more block devices, and decides
/// where each request goes.
pub trait Target: Send + Sync {
    fn map(&self, bio: Bio) -> Disposition;

    fn status(&self, status_type: StatusType) -> String;

    /// Activates the target; called before the first `map`.
    fn resume(&self) -> Result<()> {
        Ok(())
    }

    /// Maps `bio`, then submits or fails it as directed.
    fn submit(&self, bio: Bio) {
        match self.map(bio) {
            Disposition::Remapped(bio) => bio.submit(),
            Disposition::Submitted => {}
            Disposition::Failed(bio, error) => bio.endio(Err(error)),
        }
    }
}

#[test]
fn test_submit_read_write() {
    use crate::device::MemoryDevice;

    let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 8));
    let (sender, receiver) = crossbeam_channel::unbounded();

    let mut write = Bio::write(0, vec![9u8; 1024]);
    assert_eq!(write.len_sectors(), 2);
    write.remap(device.clone(), 2);
    write.submit();

    let mut read = Bio::read(0, 3).on_complete(move |bio, result| {
        sender
            .send((bio.into_data(), result.is_ok()))
            .expect("receiver alive")
    });
    read.remap(device, 1);
    read.submit();

    let (data, ok) = receiver.recv().expect("must complete");
    assert!(ok);
    assert!(data[..512].iter().all(|b| *b == 0));
    assert!(data[512..].iter().all(|b| *b == 9));
}

#[test]
fn test_submit_without_device() {
    let (sender, receiver) = crossbeam_channel::unbounded();

    Bio::write(0, vec![0u8; 512])
        .on_complete(move |_, result| sender.send(result).expect("receiver alive"))
        .submit();

    assert!(receiver.recv().expect("must complete").is_err());
}
