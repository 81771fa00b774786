// Universal filesystem operations trait: a path-based interface over a
// mounted volume, shaped for host-mount glue (FUSE/WinFsp style). All
// operations are synchronous.

use silt_core::FsError;

/// File attributes returned by stat operations.
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub size: u64,
    pub is_directory: bool,
    pub is_read_only: bool,
    /// Unix timestamp of last modification, when the on-disk stamp is
    /// representable.
    pub modified: Option<u64>,
    /// Raw attribute bits of the underlying filesystem.
    pub raw_attributes: u8,
    /// Host-facing inode number.
    pub inode: u64,
}

/// Directory entry returned by readdir operations.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub attributes: FileAttributes,
}

/// Filesystem information for statfs.
#[derive(Debug, Clone)]
pub struct FilesystemInfo {
    pub total_space: u64,
    pub free_space: u64,
    pub block_size: u32,
    pub max_filename_length: u32,
    pub filesystem_type: String,
    pub volume_label: Option<String>,
    pub volume_serial: Option<u32>,
    pub is_readonly: bool,
}

/// Core filesystem operations.
pub trait FilesystemOps: Send {
    /// Get filesystem information.
    fn statfs(&mut self) -> Result<FilesystemInfo, FsError>;

    /// Get file/directory attributes.
    fn stat(&mut self, path: &str) -> Result<FileAttributes, FsError>;

    /// List directory contents.
    fn readdir(&mut self, path: &str) -> Result<Vec<DirectoryEntry>, FsError>;

    /// Read file contents.
    fn read(&mut self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, FsError>;

    /// Write file contents, creating the file if needed.
    fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<u32, FsError>;

    /// Create an empty file; fails if it exists.
    fn create(&mut self, path: &str) -> Result<(), FsError>;

    /// Create a directory.
    fn mkdir(&mut self, path: &str) -> Result<(), FsError>;

    /// Remove a file.
    fn unlink(&mut self, path: &str) -> Result<(), FsError>;

    /// Remove an empty directory.
    fn rmdir(&mut self, path: &str) -> Result<(), FsError>;

    /// Rename a file or directory within the volume.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError>;

    /// Truncate or extend a file to the given size.
    fn truncate(&mut self, path: &str, size: u64) -> Result<(), FsError>;

    /// Flush all pending writes.
    fn sync(&mut self) -> Result<(), FsError>;

    /// Whether write operations are supported on this mount.
    fn is_readonly(&self) -> bool {
        false
    }

    /// Filesystem type name (e.g. "FAT32", "exFAT").
    fn filesystem_type(&self) -> &str;
}
