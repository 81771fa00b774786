// Test support: build small FAT and exFAT volume images in memory so the
// engine can be driven end-to-end without touching real media. The
// builders produce just enough on-disk structure to satisfy the mount
// validation; they are not a formatter.
#![allow(dead_code)]

use silt_core::MemDevice;
use silt_filesystems::{FatVolume, MountOptions};

pub const SS: usize = 512;

fn st16(img: &mut [u8], off: usize, v: u16) {
    img[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn st32(img: &mut [u8], off: usize, v: u32) {
    img[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn st64(img: &mut [u8], off: usize, v: u64) {
    img[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Build a blank FAT12/16/32 volume image. The sub-type falls out of the
/// cluster count, exactly as the mount path classifies it.
pub fn build_fat_image(total_sectors: u32, spc: u8, fat32: bool) -> Vec<u8> {
    let n_fats = 2u32;
    let nrsv: u32 = if fat32 { 32 } else { 1 };
    let n_rootdir: u32 = if fat32 { 0 } else { 512 };
    let root_sects = n_rootdir * 32 / SS as u32;

    // Fixed-point iteration for the FAT size.
    let mut fsize = 1u32;
    let nclst = loop {
        let sysect = nrsv + n_fats * fsize + root_sects;
        let nclst = (total_sectors - sysect) / spc as u32;
        let entry_bytes: u64 = if fat32 {
            (nclst as u64 + 2) * 4
        } else if nclst > 0xFF5 {
            (nclst as u64 + 2) * 2
        } else {
            (nclst as u64 + 2) * 3 / 2 + 1
        };
        let need = ((entry_bytes + SS as u64 - 1) / SS as u64) as u32;
        if need <= fsize {
            break nclst;
        }
        fsize = need;
    };

    let mut img = vec![0u8; total_sectors as usize * SS];
    img[0] = 0xEB;
    img[1] = 0xFE;
    img[2] = 0x90;
    img[3..11].copy_from_slice(b"MSDOS5.0");
    st16(&mut img, 11, SS as u16);
    img[13] = spc;
    st16(&mut img, 14, nrsv as u16);
    img[16] = n_fats as u8;
    st16(&mut img, 17, n_rootdir as u16);
    if total_sectors < 0x10000 {
        st16(&mut img, 19, total_sectors as u16);
    } else {
        st32(&mut img, 32, total_sectors);
    }
    img[21] = 0xF8;
    if fat32 {
        st32(&mut img, 36, fsize);
        st16(&mut img, 42, 0); // fs version 0.0
        st32(&mut img, 44, 2); // root cluster
        st16(&mut img, 48, 1); // FSInfo sector
        st16(&mut img, 50, 6); // backup boot sector
        img[66] = 0x29;
        st32(&mut img, 67, 0x1234_5678);
        img[82..90].copy_from_slice(b"FAT32   ");
    } else {
        st16(&mut img, 22, fsize as u16);
        img[38] = 0x29;
        st32(&mut img, 39, 0x1234_5678);
        if nclst <= 0xFF5 {
            img[54..62].copy_from_slice(b"FAT12   ");
        } else {
            img[54..62].copy_from_slice(b"FAT16   ");
        }
    }
    st16(&mut img, 510, 0xAA55);

    if fat32 {
        let fsi = SS;
        st32(&mut img, fsi, 0x4161_5252);
        st32(&mut img, fsi + 484, 0x6141_7272);
        st32(&mut img, fsi + 488, 0xFFFF_FFFF); // free count unknown
        st32(&mut img, fsi + 492, 0xFFFF_FFFF); // next free unknown
        st16(&mut img, fsi + 510, 0xAA55);
        // Backup boot record pair.
        let (front, back) = img.split_at_mut(6 * SS);
        back[..2 * SS].copy_from_slice(&front[..2 * SS]);
    }

    for f in 0..n_fats {
        let base = (nrsv + f * fsize) as usize * SS;
        if fat32 {
            st32(&mut img, base, 0x0FFF_FFF8);
            st32(&mut img, base + 4, 0x0FFF_FFFF);
            st32(&mut img, base + 8, 0x0FFF_FFFF); // root directory chain
        } else if nclst > 0xFF5 {
            img[base..base + 4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
        } else {
            img[base..base + 3].copy_from_slice(&[0xF8, 0xFF, 0xFF]);
        }
    }
    img
}

/// Build a blank exFAT volume image with a one-cluster allocation bitmap
/// and an empty root directory.
pub fn build_exfat_image(total_sectors: u32, spc_shift: u8) -> Vec<u8> {
    let spc = 1u32 << spc_shift;
    let fat_ofs = 24u32;
    let mut fat_len = 1u32;
    let nclst = loop {
        let heap_ofs = fat_ofs + fat_len;
        let nclst = (total_sectors - heap_ofs) / spc;
        let need = ((nclst as u64 + 2) * 4).div_ceil(SS as u64) as u32;
        if need <= fat_len {
            break nclst;
        }
        fat_len = need;
    };
    let heap_ofs = fat_ofs + fat_len;
    let bmp_bytes = (nclst + 7) / 8;
    let bmp_clusters = (bmp_bytes + spc * SS as u32 - 1) / (spc * SS as u32);
    let bitmap_clust = 2u32;
    let root_clust = bitmap_clust + bmp_clusters;

    let mut img = vec![0u8; total_sectors as usize * SS];
    img[0] = 0xEB;
    img[1] = 0x76;
    img[2] = 0x90;
    img[3..11].copy_from_slice(b"EXFAT   ");
    st64(&mut img, 64, 0); // partition offset
    st64(&mut img, 72, total_sectors as u64);
    st32(&mut img, 80, fat_ofs);
    st32(&mut img, 84, fat_len);
    st32(&mut img, 88, heap_ofs);
    st32(&mut img, 92, nclst);
    st32(&mut img, 96, root_clust);
    st32(&mut img, 100, 0x8765_4321); // volume serial
    st16(&mut img, 104, 0x0100); // filesystem version 1.0
    st16(&mut img, 106, 0); // volume flags
    img[108] = 9; // 512-byte sectors
    img[109] = spc_shift;
    img[110] = 1; // one FAT
    img[111] = 0x80;
    st16(&mut img, 510, 0xAA55);

    // FAT: media, reserved, the bitmap chain, the root directory chain.
    let fat = fat_ofs as usize * SS;
    st32(&mut img, fat, 0xFFFF_FFF8);
    st32(&mut img, fat + 4, 0xFFFF_FFFF);
    for i in 0..bmp_clusters {
        let c = bitmap_clust + i;
        let link = if i + 1 == bmp_clusters {
            0xFFFF_FFFF
        } else {
            c + 1
        };
        st32(&mut img, fat + c as usize * 4, link);
    }
    st32(&mut img, fat + root_clust as usize * 4, 0xFFFF_FFFF);

    // Bitmap: clusters 2..=root_clust are in use.
    let bmp = (heap_ofs + (bitmap_clust - 2) * spc) as usize * SS;
    for bit in 0..=(root_clust - 2) {
        img[bmp + bit as usize / 8] |= 1 << (bit % 8);
    }

    // Root directory: the allocation bitmap entry.
    let root = (heap_ofs + (root_clust - 2) * spc) as usize * SS;
    img[root] = 0x81;
    st32(&mut img, root + 20, bitmap_clust);
    st64(&mut img, root + 24, bmp_bytes as u64);

    img
}

/// Wrap an image in a protective-MBR + GPT table with one Microsoft Basic
/// Data partition holding it.
pub fn wrap_in_gpt(volume: &[u8], first_lba: u32) -> Vec<u8> {
    let total = first_lba as usize * SS + volume.len();
    let mut img = vec![0u8; total];

    // Protective MBR.
    img[446 + 4] = 0xEE;
    st32(&mut img, 446 + 8, 1);
    st16(&mut img, 510, 0xAA55);

    // GPT header in sector 1, table from sector 2.
    let h = SS;
    img[h..h + 8].copy_from_slice(b"EFI PART");
    st32(&mut img, h + 8, 0x0001_0000);
    st32(&mut img, h + 12, 92);
    st64(&mut img, h + 72, 2);
    st32(&mut img, h + 80, 128);
    st32(&mut img, h + 84, 128);
    let mut hdr = img[h..h + 92].to_vec();
    hdr[16..20].fill(0);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&hdr);
    let bcc = hasher.finalize();
    st32(&mut img, h + 16, bcc);

    // Partition entry 0: MS Basic Data.
    let e = 2 * SS;
    img[e..e + 16].copy_from_slice(&[
        0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99,
        0xC7,
    ]);
    st64(&mut img, e + 32, first_lba as u64);
    st64(&mut img, e + 40, (first_lba as u64) + (volume.len() / SS) as u64 - 1);

    img[first_lba as usize * SS..].copy_from_slice(volume);
    img
}

/// Wrap an image behind a classic MBR with one primary partition.
pub fn wrap_in_mbr(volume: &[u8], first_lba: u32, system_id: u8) -> Vec<u8> {
    let total = first_lba as usize * SS + volume.len();
    let mut img = vec![0u8; total];
    img[446] = 0x80;
    img[446 + 4] = system_id;
    st32(&mut img, 446 + 8, first_lba);
    st32(&mut img, 446 + 12, (volume.len() / SS) as u32);
    st16(&mut img, 510, 0xAA55);
    img[first_lba as usize * SS..].copy_from_slice(volume);
    img
}

pub fn mount_image(img: Vec<u8>) -> FatVolume<MemDevice> {
    let dev = MemDevice::from_bytes(img, SS);
    let mut vol = FatVolume::new(dev, MountOptions::default()).expect("volume binds");
    vol.mount().expect("image mounts");
    vol
}
