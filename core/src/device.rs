use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::FsError;

/// Media state reported by a block device.
///
/// The engine checks this on every mount attempt: `not_ready` aborts with
/// `FsError::NotReady`, `write_protected` rejects write-mode access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStatus {
    pub not_ready: bool,
    pub write_protected: bool,
}

/// Sector-addressed storage consumed by the filesystem engine.
///
/// All transfers are whole sectors; `buf.len()` must be a multiple of
/// `sector_size()`. Reads of never-written sectors may return arbitrary
/// bytes - the engine zero-fills anything it relies on. Writes become
/// durable only after `sync()` returns.
pub trait BlockDevice {
    /// Sector size in bytes (512, 1024, 2048 or 4096).
    fn sector_size(&self) -> usize;

    /// Total number of addressable sectors.
    fn sector_count(&self) -> u64;

    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError>;

    fn write(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError>;

    /// Flush device-side caches. Data is durable once this returns.
    fn sync(&mut self) -> Result<(), FsError>;

    /// Erase block size in sectors, for allocation alignment hints.
    fn erase_block_size(&self) -> u32 {
        1
    }

    /// Hint that the sector range `[start, end]` no longer holds live data.
    fn trim(&mut self, _start: u64, _end: u64) -> Result<(), FsError> {
        Ok(())
    }

    fn status(&self) -> MediaStatus {
        MediaStatus::default()
    }
}

/// Block device backed by a file: a disk image or a raw device node.
pub struct FileDevice {
    file: File,
    sector_size: usize,
    sector_count: u64,
    read_only: bool,
}

impl FileDevice {
    /// Open an image file with 512-byte sectors.
    pub fn open(path: &std::path::Path) -> Result<Self, FsError> {
        Self::open_with_sector_size(path, 512)
    }

    pub fn open_with_sector_size(path: &std::path::Path, sector_size: usize) -> Result<Self, FsError> {
        if !sector_size.is_power_of_two() || !(512..=4096).contains(&sector_size) {
            return Err(FsError::InvalidParameter("sector size must be 512..4096 and a power of two"));
        }
        let (file, read_only) = match File::options().read(true).write(true).open(path) {
            Ok(f) => (f, false),
            Err(_) => (File::open(path)?, true),
        };
        let len = file.metadata()?.len();
        Ok(FileDevice {
            file,
            sector_size,
            sector_count: len / sector_size as u64,
            read_only,
        })
    }

    fn seek_to(&mut self, lba: u64) -> Result<(), FsError> {
        self.file
            .seek(SeekFrom::Start(lba * self.sector_size as u64))?;
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        debug_assert_eq!(buf.len() % self.sector_size, 0);
        self.seek_to(lba)?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
        debug_assert_eq!(buf.len() % self.sector_size, 0);
        self.seek_to(lba)?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), FsError> {
        self.file.sync_data()?;
        Ok(())
    }

    fn status(&self) -> MediaStatus {
        MediaStatus {
            not_ready: false,
            write_protected: self.read_only,
        }
    }
}

/// In-memory block device for tests and RAM disks.
pub struct MemDevice {
    data: Vec<u8>,
    sector_size: usize,
    write_protected: bool,
}

impl MemDevice {
    pub fn new(sector_count: u64, sector_size: usize) -> Self {
        MemDevice {
            data: vec![0u8; sector_count as usize * sector_size],
            sector_size,
            write_protected: false,
        }
    }

    pub fn from_bytes(data: Vec<u8>, sector_size: usize) -> Self {
        MemDevice {
            data,
            sector_size,
            write_protected: false,
        }
    }

    pub fn set_write_protected(&mut self, wp: bool) {
        self.write_protected = wp;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, lba: u64, len: usize) -> Result<std::ops::Range<usize>, FsError> {
        let start = lba as usize * self.sector_size;
        let end = start + len;
        if end > self.data.len() {
            return Err(FsError::Disk(format!("access past end of device (lba {lba})")));
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        (self.data.len() / self.sector_size) as u64
    }

    fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        let r = self.range(lba, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn write(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
        if self.write_protected {
            return Err(FsError::WriteProtected);
        }
        let r = self.range(lba, buf.len())?;
        self.data[r].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), FsError> {
        Ok(())
    }

    fn status(&self) -> MediaStatus {
        MediaStatus {
            not_ready: false,
            write_protected: self.write_protected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trip() {
        let mut dev = MemDevice::new(16, 512);
        let sector = vec![0xA5u8; 512];
        dev.write(3, &sector).unwrap();
        let mut back = vec![0u8; 512];
        dev.read(3, &mut back).unwrap();
        assert_eq!(back, sector);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let mut dev = MemDevice::new(4, 512);
        let mut buf = vec![0u8; 512];
        assert!(matches!(dev.read(4, &mut buf), Err(FsError::Disk(_))));
    }

    #[test]
    fn write_protected_device_rejects_writes() {
        let mut dev = MemDevice::new(4, 512);
        dev.set_write_protected(true);
        assert_eq!(dev.write(0, &[0u8; 512]), Err(FsError::WriteProtected));
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 8 * 512]).unwrap();

        let mut dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.sector_count(), 8);
        dev.write(2, &[0x42u8; 512]).unwrap();
        dev.sync().unwrap();

        let mut buf = [0u8; 512];
        dev.read(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
    }
}
