// FAT entry access for FAT12, FAT16, FAT32 and the exFAT FAT.
//
// FAT12 entries are 12-bit packed: an entry can straddle a sector
// boundary, so reads and writes go byte-by-byte through the window.
// FAT32 keeps its upper 4 bits reserved and they are preserved on write.
// On exFAT the FAT only holds fragmented chains; links of a contiguous
// chain are synthesized from the object's allocation status.

use silt_core::{BlockDevice, FsError};

use crate::families::fat::volume::{FatVolume, ObjInfo, STA_CONTIGUOUS, STA_JUST_FRAGMENTED};
use crate::families::fat::{ld_dword, ld_word, st_dword, st_word, FatType};

impl<D: BlockDevice> FatVolume<D> {
    /// Read the FAT link of `clst`.
    ///
    /// Returns 0 for a free cluster, a value `>= n_fatent` for EOC or a
    /// bad cluster, and the successor cluster otherwise. The reserved
    /// stored value 1 and out-of-range cluster numbers are internal
    /// errors.
    pub(crate) fn get_fat(&mut self, obj: &ObjInfo, clst: u32) -> Result<u32, FsError> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::Internal("FAT read out of range"));
        }

        let ss = self.ss as u64;
        let val = match self.fs_type {
            Some(FatType::Fat12) => {
                let mut bc = clst as u64 + clst as u64 / 2;
                self.move_window(self.fatbase + bc / ss)?;
                let mut wc = self.win.buf[(bc % ss) as usize] as u32;
                bc += 1;
                self.move_window(self.fatbase + bc / ss)?;
                wc |= (self.win.buf[(bc % ss) as usize] as u32) << 8;
                if clst & 1 != 0 {
                    wc >> 4
                } else {
                    wc & 0xFFF
                }
            }
            Some(FatType::Fat16) => {
                self.move_window(self.fatbase + clst as u64 / (ss / 2))?;
                let off = (clst as u64 * 2 % ss) as usize;
                ld_word(&self.win.buf[off..]) as u32
            }
            Some(FatType::Fat32) => {
                self.move_window(self.fatbase + clst as u64 / (ss / 4))?;
                let off = (clst as u64 * 4 % ss) as usize;
                ld_dword(&self.win.buf[off..]) & 0x0FFF_FFFF
            }
            Some(FatType::ExFat) => return self.get_fat_ex(obj, clst),
            None => return Err(FsError::Internal("FAT read on unmounted volume")),
        };

        if val == 1 {
            return Err(FsError::Internal("reserved FAT value on read"));
        }
        Ok(val)
    }

    /// exFAT link read, filtered through the object's chain status: a
    /// contiguous chain has no links on the FAT at all.
    fn get_fat_ex(&mut self, obj: &ObjInfo, clst: u32) -> Result<u32, FsError> {
        let ss = self.ss as u64;
        // Anything but the root directory must carry a valid data length.
        if (obj.objsize != 0 && obj.sclust != 0) || obj.stat == 0 {
            let cofs = clst.wrapping_sub(obj.sclust);
            let clen = (((obj.objsize.saturating_sub(1)) / ss) / self.csize as u64) as u32;

            if obj.stat == STA_CONTIGUOUS && cofs <= clen {
                // No data on the FAT: generate the value.
                return Ok(if cofs == clen { 0x7FFF_FFFF } else { clst + 1 });
            }
            if obj.stat == STA_JUST_FRAGMENTED && cofs < obj.n_cont {
                // Still inside the contiguous head fragment.
                return Ok(clst + 1);
            }
            if obj.stat != STA_CONTIGUOUS {
                if obj.n_frag != 0 {
                    // Growing edge not yet written to the FAT.
                    return Ok(0x7FFF_FFFF);
                }
                self.move_window(self.fatbase + clst as u64 / (ss / 4))?;
                let off = (clst as u64 * 4 % ss) as usize;
                return Ok(ld_dword(&self.win.buf[off..]) & 0x7FFF_FFFF);
            }
        }
        Err(FsError::Internal("exFAT chain status out of sync"))
    }

    /// Change the FAT link of `clst` to `val`.
    pub(crate) fn put_fat(&mut self, clst: u32, val: u32) -> Result<(), FsError> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::Internal("FAT write out of range"));
        }

        let ss = self.ss as u64;
        match self.fs_type {
            Some(FatType::Fat12) => {
                let mut bc = clst as u64 + clst as u64 / 2;
                self.move_window(self.fatbase + bc / ss)?;
                let p = (bc % ss) as usize;
                self.win.buf[p] = if clst & 1 != 0 {
                    (self.win.buf[p] & 0x0F) | ((val as u8) << 4)
                } else {
                    val as u8
                };
                self.mark_window_dirty();
                bc += 1;
                self.move_window(self.fatbase + bc / ss)?;
                let p = (bc % ss) as usize;
                self.win.buf[p] = if clst & 1 != 0 {
                    (val >> 4) as u8
                } else {
                    (self.win.buf[p] & 0xF0) | ((val >> 8) as u8 & 0x0F)
                };
                self.mark_window_dirty();
            }
            Some(FatType::Fat16) => {
                self.move_window(self.fatbase + clst as u64 / (ss / 2))?;
                let off = (clst as u64 * 2 % ss) as usize;
                st_word(&mut self.win.buf[off..], val as u16);
                self.mark_window_dirty();
            }
            Some(FatType::Fat32) | Some(FatType::ExFat) => {
                self.move_window(self.fatbase + clst as u64 / (ss / 4))?;
                let off = (clst as u64 * 4 % ss) as usize;
                let v = if self.fs_type == Some(FatType::Fat32) {
                    // Keep the reserved upper 4 bits.
                    (val & 0x0FFF_FFFF) | (ld_dword(&self.win.buf[off..]) & 0xF000_0000)
                } else {
                    val
                };
                st_dword(&mut self.win.buf[off..], v);
                self.mark_window_dirty();
            }
            None => return Err(FsError::Internal("FAT write on unmounted volume")),
        }
        Ok(())
    }
}
