//! Block devices are addressed in 512-byte sectors.  The engine only
//! needs positional reads and writes, a size, and a name to identify
//! the device by (origins are keyed on it).
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::RwLock;
use tracing::instrument;

use crate::chain_error;
use crate::chain_warn;
use crate::exception::SECTOR_SHIFT;
use crate::exception::SECTOR_SIZE;
use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

pub trait BlockDevice: Send + Sync + std::fmt::Debug {
    /// Identifies the device; two handles with the same name are the
    /// same device.
    fn name(&self) -> &str;

    fn size_sectors(&self) -> u64;

    /// Smallest unit the device can write atomically, in bytes.
    fn physical_block_size(&self) -> u32 {
        SECTOR_SIZE as u32
    }

    /// Fills `buf` with the bytes starting at `sector`.
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` starting at `sector`.
    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<()>;
}

/// Returns the byte offset for `[sector, sector + len)`, or an
/// `OutOfRange` error if that doesn't fit in `size_sectors`.
fn checked_offset(name: &str, size_sectors: u64, sector: u64, len: usize) -> Result<u64> {
    let offset = sector.checked_mul(SECTOR_SIZE).unwrap_or(u64::MAX);
    let end = offset.saturating_add(len as u64);

    if end > size_sectors << SECTOR_SHIFT {
        return Err(
            fresh_warn!("I/O beyond the end of the device", %name, sector, len, size_sectors)
                .with_kind(ErrorKind::OutOfRange),
        );
    }

    Ok(offset)
}

/// A `MemoryDevice` keeps its contents in RAM.  I/O can be made to
/// fail on demand, to exercise error paths.
#[derive(Debug)]
pub struct MemoryDevice {
    name: String,
    physical_block_size: u32,
    contents: RwLock<Vec<u8>>,
    failing: AtomicBool,
}

impl MemoryDevice {
    /// Returns a zero-filled device of `size_sectors` sectors.
    pub fn new(name: impl Into<String>, size_sectors: u64) -> MemoryDevice {
        MemoryDevice {
            name: name.into(),
            physical_block_size: SECTOR_SIZE as u32,
            contents: RwLock::new(vec![0u8; (size_sectors << SECTOR_SHIFT) as usize]),
            failing: AtomicBool::new(false),
        }
    }

    /// Overrides the reported physical block size.
    pub fn with_physical_block_size(mut self, bytes: u32) -> MemoryDevice {
        self.physical_block_size = bytes;
        self
    }

    /// When `failing`, every read and write returns an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    fn check_failing(&self, op: &'static str, sector: u64) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(
                fresh_warn!("injected I/O failure", name=%self.name, op, sector)
                    .with_kind(ErrorKind::Io),
            );
        }

        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_sectors(&self) -> u64 {
        (self.contents.read().expect("poisoned lock").len() as u64) >> SECTOR_SHIFT
    }

    fn physical_block_size(&self) -> u32 {
        self.physical_block_size
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_failing("read", sector)?;

        let contents = self.contents.read().expect("poisoned lock");
        let size_sectors = (contents.len() as u64) >> SECTOR_SHIFT;
        let offset = checked_offset(&self.name, size_sectors, sector, buf.len())? as usize;

        buf.copy_from_slice(&contents[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.check_failing("write", sector)?;

        let mut contents = self.contents.write().expect("poisoned lock");
        let size_sectors = (contents.len() as u64) >> SECTOR_SHIFT;
        let offset = checked_offset(&self.name, size_sectors, sector, buf.len())? as usize;

        contents[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// A `FileDevice` is a regular file or block special file, accessed
/// with positional I/O so handles can be shared across threads.
#[derive(Debug)]
pub struct FileDevice {
    name: String,
    file: File,
    size_sectors: u64,
}

impl FileDevice {
    /// Opens the file at `path` for reading and writing.  The device's
    /// name is the path as given.
    #[instrument]
    pub fn open(path: &Path) -> Result<FileDevice> {
        use std::io::Seek;
        use std::io::SeekFrom;

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| chain_warn!(e, "failed to open device", ?path))?;

        // Seeking to the end works for block special files, unlike
        // the metadata's length.
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| chain_warn!(e, "failed to size device", ?path))?;

        Ok(FileDevice {
            name: path.to_string_lossy().into_owned(),
            file,
            size_sectors: size >> SECTOR_SHIFT,
        })
    }
}

impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let offset = checked_offset(&self.name, self.size_sectors, sector, buf.len())?;

        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| chain_error!(e, "failed to read from device", name=%self.name, sector))
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> Result<()> {
        let offset = checked_offset(&self.name, self.size_sectors, sector, buf.len())?;

        self.file
            .write_all_at(buf, offset)
            .map_err(|e| chain_error!(e, "failed to write to device", name=%self.name, sector))
    }
}

#[test]
fn test_memory_device_roundtrip() {
    let device = MemoryDevice::new("mem", 16);

    assert_eq!(device.size_sectors(), 16);
    device.write_at(3, &[7u8; 1024]).expect("in range");

    let mut buf = [0u8; 1536];
    device.read_at(2, &mut buf).expect("in range");
    assert!(buf[..512].iter().all(|b| *b == 0));
    assert!(buf[512..].iter().all(|b| *b == 7));
}

#[test]
fn test_memory_device_bounds() {
    let device = MemoryDevice::new("mem", 4);
    let mut buf = [0u8; 1024];

    assert!(device.read_at(2, &mut buf).is_ok());
    assert_eq!(
        device.read_at(3, &mut buf).expect_err("past the end").kind(),
        ErrorKind::OutOfRange
    );
    assert_eq!(
        device.write_at(u64::MAX, &buf).expect_err("past the end").kind(),
        ErrorKind::OutOfRange
    );
}

#[test]
fn test_memory_device_failing() {
    let device = MemoryDevice::new("mem", 4);
    let mut buf = [0u8; 512];

    device.set_failing(true);
    assert_eq!(
        device.read_at(0, &mut buf).expect_err("injected").kind(),
        ErrorKind::Io
    );

    device.set_failing(false);
    assert!(device.read_at(0, &mut buf).is_ok());
}

#[test]
fn test_file_device() {
    let file = tempfile::NamedTempFile::new().expect("should create temp file");
    file.as_file().set_len(8 * SECTOR_SIZE).expect("should resize");

    let device = FileDevice::open(file.path()).expect("should open");
    assert_eq!(device.size_sectors(), 8);
    assert_eq!(device.name(), file.path().to_string_lossy());

    device.write_at(7, &[42u8; 512]).expect("in range");
    let mut buf = [0u8; 512];
    device.read_at(7, &mut buf).expect("in range");
    assert!(buf.iter().all(|b| *b == 42));

    assert_eq!(
        device.write_at(8, &buf).expect_err("past the end").kind(),
        ErrorKind::OutOfRange
    );
}
