// Silt filesystem implementations, organized in families. The FAT family
// (FAT12/FAT16/FAT32/exFAT) is the one currently shipped.

pub mod families;

pub mod detection;
pub mod lock;
pub mod ops;
pub mod partitioner;

pub use families::fat::{
    DirHandle, FatOps, FatType, FatVolume, FileHandle, FileInfo, MountOptions, OpenMode,
    VolumeStats,
};

pub use detection::{classify_boot_sector, BootSectorKind};
pub use lock::SharedVolume;
pub use ops::{DirectoryEntry, FileAttributes, FilesystemInfo, FilesystemOps};
