// exFAT allocation bitmap. Bit i (LSB-first within each byte) tracks
// cluster i + 2; the bitmap itself occupies a contiguous cluster run
// starting at `bitbase`.

use silt_core::{BlockDevice, FsError};

use crate::families::fat::volume::FatVolume;

impl<D: BlockDevice> FatVolume<D> {
    /// Find a run of `ncl` contiguous free clusters, scanning circularly
    /// from `clst`. Returns the first cluster of the lowest such run, or
    /// `None` when the volume has no run of that length.
    pub(crate) fn find_bitmap(&mut self, clst: u32, ncl: u32) -> Result<Option<u32>, FsError> {
        let nbits = self.n_fatent - 2;
        let mut val = clst.wrapping_sub(2);
        if val >= nbits {
            val = 0;
        }
        let start = val;
        let mut scl = val;
        let mut ctr = 0u32;
        loop {
            self.move_window(self.bitbase + (val as u64 / 8) / self.ss as u64)?;
            let mut i = (val as usize / 8) % self.ss as usize;
            let mut bm = 1u8 << (val % 8);
            loop {
                loop {
                    let bv = self.win.buf[i] & bm;
                    bm = bm.wrapping_shl(1);
                    val += 1;
                    let mut wrapped = false;
                    if val >= nbits {
                        // Wrap to the start of the bitmap.
                        val = 0;
                        bm = 0;
                        wrapped = true;
                    }
                    if bv == 0 {
                        ctr += 1;
                        if ctr == ncl {
                            return Ok(Some(scl + 2));
                        }
                    } else {
                        scl = val;
                        ctr = 0;
                    }
                    if val == start {
                        return Ok(None); // all clusters scanned
                    }
                    if bm == 0 {
                        if wrapped {
                            i = self.ss as usize; // force window reload
                        }
                        break;
                    }
                }
                bm = 1;
                i += 1;
                if i >= self.ss as usize {
                    break;
                }
            }
        }
    }

    /// Set (`value = true`) or clear a run of `ncl` bits starting at
    /// cluster `clst`. Finding a bit already at the target value means the
    /// bitmap and the FAT view have diverged.
    pub(crate) fn change_bitmap(&mut self, clst: u32, ncl: u32, value: bool) -> Result<(), FsError> {
        let bit = clst as u64 - 2;
        let mut sect = self.bitbase + bit / 8 / self.ss as u64;
        let mut i = (bit as usize / 8) % self.ss as usize;
        let mut bm = 1u8 << (bit % 8);
        let mut remaining = ncl;
        loop {
            self.move_window(sect)?;
            sect += 1;
            loop {
                loop {
                    if value == (self.win.buf[i] & bm != 0) {
                        return Err(FsError::Internal("bitmap bit already at target value"));
                    }
                    self.win.buf[i] ^= bm;
                    self.mark_window_dirty();
                    remaining -= 1;
                    if remaining == 0 {
                        return Ok(());
                    }
                    bm = bm.wrapping_shl(1);
                    if bm == 0 {
                        break;
                    }
                }
                bm = 1;
                i += 1;
                if i >= self.ss as usize {
                    break;
                }
            }
            i = 0;
        }
    }
}
