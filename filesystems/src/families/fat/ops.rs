// Path-based FilesystemOps facade over the FAT engine, the surface
// consumed by host-mount glue. Each call opens, operates and closes, so
// the facade itself keeps no per-file state.

use silt_core::{BlockDevice, FsError};

use crate::families::fat::common::timestamps::fat_datetime_to_unix;
use crate::families::fat::dir_ops::FileInfo;
use crate::families::fat::file::OpenMode;
use crate::families::fat::volume::FatVolume;
use crate::families::fat::{AM_RDO, MAX_LFN};
use crate::ops::{DirectoryEntry, FileAttributes, FilesystemInfo, FilesystemOps};

/// FAT-family implementation of `FilesystemOps`.
pub struct FatOps<D: BlockDevice> {
    vol: FatVolume<D>,
}

impl<D: BlockDevice> FatOps<D> {
    pub fn new(vol: FatVolume<D>) -> Self {
        FatOps { vol }
    }

    /// The wrapped volume, for operations beyond the trait surface.
    pub fn volume(&mut self) -> &mut FatVolume<D> {
        &mut self.vol
    }

    pub fn into_volume(self) -> FatVolume<D> {
        self.vol
    }

    fn attrs_of(fi: &FileInfo) -> FileAttributes {
        let modified = match fat_datetime_to_unix(fi.date, fi.time) {
            0 => None,
            t => Some(t),
        };
        FileAttributes {
            size: fi.size,
            is_directory: fi.is_dir(),
            is_read_only: fi.attr & AM_RDO != 0,
            modified,
            raw_attributes: fi.attr,
            inode: fi.inode,
        }
    }
}

impl<D: BlockDevice + Send> FilesystemOps for FatOps<D> {
    fn statfs(&mut self) -> Result<FilesystemInfo, FsError> {
        let stats = self.vol.statvol()?;
        let label = self.vol.getlabel()?;
        Ok(FilesystemInfo {
            total_space: stats.total_clusters as u64 * stats.cluster_size as u64,
            free_space: stats.free_clusters as u64 * stats.cluster_size as u64,
            block_size: stats.cluster_size,
            max_filename_length: MAX_LFN as u32,
            filesystem_type: stats.fat_type.name().to_string(),
            volume_label: if label.is_empty() { None } else { Some(label) },
            volume_serial: Some(stats.volume_serial),
            is_readonly: self.is_readonly(),
        })
    }

    fn stat(&mut self, path: &str) -> Result<FileAttributes, FsError> {
        let fi = self.vol.stat(path)?;
        Ok(Self::attrs_of(&fi))
    }

    fn readdir(&mut self, path: &str) -> Result<Vec<DirectoryEntry>, FsError> {
        let mut dh = self.vol.opendir(path)?;
        let mut entries = Vec::new();
        let result = loop {
            match self.vol.readdir(&mut dh) {
                Ok(Some(fi)) => entries.push(DirectoryEntry {
                    attributes: Self::attrs_of(&fi),
                    name: fi.name,
                }),
                Ok(None) => break Ok(entries),
                Err(e) => break Err(e),
            }
        };
        self.vol.closedir(&mut dh)?;
        result
    }

    fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let mut fh = self.vol.open(path, OpenMode::READ)?;
        let result = (|| {
            self.vol.lseek(&mut fh, offset)?;
            let mut buf = vec![0u8; size as usize];
            let n = self.vol.read(&mut fh, &mut buf)?;
            buf.truncate(n);
            Ok(buf)
        })();
        let closed = self.vol.close(&mut fh);
        result.and_then(|buf| closed.map(|()| buf))
    }

    fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let mut fh = self
            .vol
            .open(path, OpenMode::READ | OpenMode::WRITE | OpenMode::OPEN_ALWAYS)?;
        let result = (|| {
            self.vol.lseek(&mut fh, offset)?;
            self.vol.write(&mut fh, data)
        })();
        let closed = self.vol.close(&mut fh);
        result.and_then(|n| closed.map(|()| n as u32))
    }

    fn create(&mut self, path: &str) -> Result<(), FsError> {
        let mut fh = self.vol.open(path, OpenMode::WRITE | OpenMode::CREATE_NEW)?;
        self.vol.close(&mut fh)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        self.vol.mkdir(path)
    }

    fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        self.vol.unlink(path)
    }

    fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        self.vol.rmdir(path)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        self.vol.rename(from, to)
    }

    fn truncate(&mut self, path: &str, size: u64) -> Result<(), FsError> {
        let mut fh = self.vol.open(path, OpenMode::READ | OpenMode::WRITE)?;
        let result = (|| {
            self.vol.lseek(&mut fh, size)?;
            self.vol.truncate(&mut fh)
        })();
        let closed = self.vol.close(&mut fh);
        result.and(closed)
    }

    fn sync(&mut self) -> Result<(), FsError> {
        self.vol.sync_fs()
    }

    fn filesystem_type(&self) -> &str {
        match self.vol.fat_type() {
            Some(t) => t.name(),
            None => "FAT (unmounted)",
        }
    }
}
