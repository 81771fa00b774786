// Filesystem families organization.
// Silt currently ships one family: FAT (FAT12/FAT16/FAT32/exFAT).

pub mod fat;
