// Partition table parsing: MBR primaries and GPT, enough to locate a FAT
// volume inside a partitioned device. Creation of partition tables is a
// formatter concern and lives outside this crate.

use crate::families::fat::{ld_dword, ld_qword};

/// Offset of the MBR partition table in sector 0.
pub const MBR_TABLE: usize = 446;
/// Size of one MBR partition entry.
pub const SZ_PTE: usize = 16;
/// System-id byte of the first MBR entry; 0xEE marks a GPT protective MBR.
pub const MBR_PTE_SYSTEM: usize = MBR_TABLE + 4;
/// Start-LBA field within an MBR partition entry.
pub const PTE_ST_LBA: usize = 8;

/// Size of one GPT partition table entry.
pub const SZ_GPTE: usize = 128;
// GPT header fields.
pub const GPTH_SIGN: usize = 0;
pub const GPTH_SIZE: usize = 12;
pub const GPTH_BCC: usize = 16;
pub const GPTH_PT_OFS: usize = 72;
pub const GPTH_PT_NUM: usize = 80;
pub const GPTH_PTE_SIZE: usize = 84;

/// Microsoft Basic Data partition type GUID, on-disk byte order.
pub const GUID_MS_BASIC: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

/// Start LBAs of the four MBR primary partitions (0 = unused slot).
pub fn mbr_partition_lbas(bs: &[u8]) -> [u32; 4] {
    let mut lbas = [0u32; 4];
    for (i, lba) in lbas.iter_mut().enumerate() {
        *lba = ld_dword(&bs[MBR_TABLE + i * SZ_PTE + PTE_ST_LBA..]);
    }
    lbas
}

/// Validate a GPT header: signature, version 1.0, size bounds, header
/// CRC (computed with the BCC field zeroed), 128-byte entries, at most
/// 128 of them.
pub fn test_gpt_header(h: &[u8]) -> bool {
    if &h[GPTH_SIGN..GPTH_SIGN + 8] != b"EFI PART" {
        return false;
    }
    if ld_dword(&h[8..]) != 0x0001_0000 {
        return false;
    }
    let hlen = ld_dword(&h[GPTH_SIZE..]) as usize;
    if !(92..=512).contains(&hlen) || hlen > h.len() {
        return false;
    }

    let mut header = h[..hlen].to_vec();
    header[GPTH_BCC..GPTH_BCC + 4].fill(0);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    if hasher.finalize() != ld_dword(&h[GPTH_BCC..]) {
        return false;
    }

    if ld_dword(&h[GPTH_PTE_SIZE..]) as usize != SZ_GPTE {
        return false;
    }
    if ld_dword(&h[GPTH_PT_NUM..]) > 128 {
        return false;
    }
    true
}

/// Does this GPT entry describe a Microsoft Basic Data partition?
pub fn is_ms_basic_data(entry: &[u8]) -> bool {
    entry[..16] == GUID_MS_BASIC
}

/// First LBA of a GPT partition entry.
pub fn gpt_entry_first_lba(entry: &[u8]) -> u64 {
    ld_qword(&entry[32..])
}
