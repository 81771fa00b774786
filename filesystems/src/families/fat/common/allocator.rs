// Cluster chain allocation: find, link, extend and free chains across the
// FAT variants, keeping the FSInfo hints (free count, last allocated) and
// the exFAT per-object chain status in step.

use log::debug;
use silt_core::{BlockDevice, FsError};

use crate::families::fat::volume::{
    FatVolume, ObjInfo, STA_CONTIGUOUS, STA_JUST_FRAGMENTED, STA_ON_FAT,
};
use crate::families::fat::{FatType, CLUSTER_UNKNOWN};

impl<D: BlockDevice> FatVolume<D> {
    /// exFAT: write the FAT links of the contiguous head fragment of a
    /// chain that fragmented this session.
    pub(crate) fn fill_first_frag(&mut self, obj: &mut ObjInfo) -> Result<(), FsError> {
        if obj.stat == STA_JUST_FRAGMENTED {
            let mut cl = obj.sclust;
            for _ in 0..obj.n_cont {
                self.put_fat(cl, cl + 1)?;
                cl += 1;
            }
            obj.stat = STA_ON_FAT; // FAT chain is now valid
        }
        Ok(())
    }

    /// exFAT: write the FAT links of the growing tail fragment, ending at
    /// `lcl` with the link value `term`.
    pub(crate) fn fill_last_frag(&mut self, obj: &mut ObjInfo, lcl: u32, term: u32) -> Result<(), FsError> {
        while obj.n_frag > 0 {
            let link = if obj.n_frag > 1 {
                lcl - obj.n_frag + 2
            } else {
                term
            };
            self.put_fat(lcl - obj.n_frag + 1, link)?;
            obj.n_frag -= 1;
        }
        Ok(())
    }

    /// Free the chain starting at `clst`. When `pclst` is non-zero the
    /// chain is being truncated and the predecessor gets an EOC mark.
    pub(crate) fn remove_chain(&mut self, obj: &mut ObjInfo, clst: u32, pclst: u32) -> Result<(), FsError> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(FsError::Internal("chain removal out of range"));
        }
        let exfat = self.is_exfat();

        // Mark the previous cluster EOC unless the chain has no FAT links.
        if pclst != 0 && (!exfat || obj.stat != STA_CONTIGUOUS) {
            self.put_fat(pclst, 0xFFFF_FFFF)?;
        }

        let mut cur = clst;
        let mut scl = clst;
        let mut ecl = clst;
        loop {
            let nxt = self.get_fat(obj, cur)?;
            if nxt == 0 {
                break; // already free
            }
            if !exfat {
                self.put_fat(cur, 0)?;
            }
            if self.free_clust < self.n_fatent - 2 {
                self.free_clust += 1;
                if self.fsi_flag & 0x80 == 0 {
                    self.fsi_flag |= 1;
                }
            }
            if ecl + 1 == nxt {
                ecl = nxt;
            } else {
                // End of a contiguous freed run: clear the bitmap and let
                // the device reclaim it in one go.
                if exfat {
                    self.change_bitmap(scl, ecl - scl + 1, false)?;
                }
                if self.opts.trim {
                    let start = self.clust2sect(scl);
                    let end = self.clust2sect(ecl) + self.csize as u64 - 1;
                    self.dev.trim(start, end)?;
                }
                scl = nxt;
                ecl = nxt;
            }
            cur = nxt;
            if cur >= self.n_fatent {
                break;
            }
        }

        if exfat {
            if pclst == 0 {
                // The whole chain is gone.
                obj.stat = STA_ON_FAT;
            } else if obj.stat == STA_ON_FAT {
                // Check whether truncation left the chain contiguous.
                let mut cl = obj.sclust;
                while cl != pclst {
                    let nxt = self.get_fat(obj, cl)?;
                    if nxt < 2 {
                        return Err(FsError::Internal("broken chain during truncate"));
                    }
                    if nxt != cl + 1 {
                        break;
                    }
                    cl += 1;
                }
                if cl == pclst {
                    obj.stat = STA_CONTIGUOUS;
                }
            } else if obj.stat == STA_JUST_FRAGMENTED
                && pclst >= obj.sclust
                && pclst <= obj.sclust + obj.n_cont
            {
                // Fragmented this session but cut back inside the head
                // fragment: contiguous again.
                obj.stat = STA_CONTIGUOUS;
            }
        }
        Ok(())
    }

    /// Stretch the chain whose last cluster is `clst`, or start a new one
    /// when `clst` is 0. Returns the new cluster, or `None` when the
    /// volume is out of space.
    pub(crate) fn create_chain(&mut self, obj: &mut ObjInfo, clst: u32) -> Result<Option<u32>, FsError> {
        let mut scl;
        if clst == 0 {
            scl = self.last_clust;
            if scl == 0 || scl >= self.n_fatent {
                scl = 1;
            }
        } else {
            let cs = self.get_fat(obj, clst)?;
            if cs < 2 {
                return Err(FsError::Internal("stretching a broken chain"));
            }
            if cs < self.n_fatent {
                return Ok(Some(cs)); // already followed by a next cluster
            }
            scl = clst;
        }
        if self.free_clust == 0 {
            return Ok(None);
        }

        let ncl;
        if self.fs_type == Some(FatType::ExFat) {
            ncl = match self.find_bitmap(scl, 1)? {
                Some(c) => c,
                None => return Ok(None),
            };
            self.change_bitmap(ncl, 1, true)?;
            if clst == 0 {
                obj.stat = STA_CONTIGUOUS;
            } else if obj.stat == STA_CONTIGUOUS && ncl != scl + 1 {
                // The chain just fragmented: remember the head length so
                // the FAT can be back-filled later.
                obj.n_cont = scl - obj.sclust;
                obj.stat = STA_JUST_FRAGMENTED;
            }
            if obj.stat != STA_CONTIGUOUS {
                if ncl == clst + 1 {
                    obj.n_frag = if obj.n_frag != 0 { obj.n_frag + 1 } else { 2 };
                } else {
                    if obj.n_frag == 0 {
                        obj.n_frag = 1;
                    }
                    self.fill_last_frag(obj, clst, ncl)?;
                    obj.n_frag = 1;
                }
            }
        } else {
            let mut found = 0u32;
            if scl == clst {
                // Prefer the sequentially next cluster.
                let mut seq = scl + 1;
                if seq >= self.n_fatent {
                    seq = 2;
                }
                let cs = self.get_fat(obj, seq)?;
                if cs == 0 {
                    found = seq;
                } else {
                    let hint = self.last_clust;
                    if hint >= 2 && hint < self.n_fatent {
                        scl = hint;
                    }
                }
            }
            if found == 0 {
                // Scan upward from scl, wrapping once.
                let mut c = scl;
                loop {
                    c += 1;
                    if c >= self.n_fatent {
                        c = 2;
                        if c > scl {
                            return Ok(None); // scanned everything
                        }
                    }
                    let cs = self.get_fat(obj, c)?;
                    if cs == 0 {
                        found = c;
                        break;
                    }
                    if c == scl {
                        return Ok(None);
                    }
                }
            }
            ncl = found;
            self.put_fat(ncl, 0xFFFF_FFFF)?;
            if clst != 0 {
                self.put_fat(clst, ncl)?;
            }
        }

        self.last_clust = ncl;
        if self.free_clust != CLUSTER_UNKNOWN && self.free_clust <= self.n_fatent - 2 {
            self.free_clust -= 1;
        }
        if self.fsi_flag & 0x80 == 0 {
            self.fsi_flag |= 1;
        }
        debug!("allocated cluster {ncl} (prev {clst})");
        Ok(Some(ncl))
    }
}
