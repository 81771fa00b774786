// Path resolution: walk a UTF-8 path from the root (or the current
// directory) down to its final segment, descending only through entries
// that carry the directory attribute.

use silt_core::{BlockDevice, FsError};

use crate::families::fat::common::names::{NS_DOT, NS_LAST, NS_NONAME};
use crate::families::fat::directory::DirCursor;
use crate::families::fat::volume::{FatVolume, ObjInfo};
use crate::families::fat::{AM_DIR, SZ_DIRE};

impl<D: BlockDevice> FatVolume<D> {
    /// Follow `path` and leave the cursor at its last segment.
    ///
    /// `Ok` with `NS_NONAME` set means the path named the anchor directory
    /// itself (empty or "/"). `NoFile` reports a missing final segment,
    /// `NoPath` a missing or non-directory intermediate one.
    pub(crate) fn follow_path(&mut self, dp: &mut DirCursor, path: &str) -> Result<(), FsError> {
        let mut rest = path;

        if !path.starts_with(['/', '\\']) {
            // Relative: anchor at the current directory.
            dp.obj.sclust = self.cdir;
        } else {
            dp.obj.sclust = 0;
        }
        dp.obj.id = self.id;
        dp.obj.n_frag = 0;

        if self.is_exfat() && dp.obj.sclust != 0 {
            // Starting below the root: recover the anchor directory's own
            // allocation state from its entry set.
            dp.obj.c_scl = self.cdc_scl;
            dp.obj.c_size = self.cdc_size;
            dp.obj.c_ofs = self.cdc_ofs;
            self.load_obj_xdir(&dp.obj)?;
            let mut anchor = ObjInfo::default();
            self.init_alloc_info(&mut anchor);
            dp.obj.objsize = anchor.objsize;
            dp.obj.stat = anchor.stat;
        }

        let trimmed = rest.trim_start_matches(['/', '\\']);
        if trimmed.is_empty() {
            // Null path: the anchor directory itself.
            dp.sfn[11] = NS_NONAME;
            return self.dir_sdi(dp, 0);
        }

        loop {
            self.create_name(dp, &mut rest)?;
            let find = self.dir_find(dp);
            let ns = dp.sfn[11];
            match find {
                Err(FsError::NoFile) => {
                    if ns & NS_DOT != 0 {
                        // Dot entries always resolve to the directory at
                        // hand, even where no physical entry exists.
                        if ns & NS_LAST == 0 {
                            continue;
                        }
                        dp.sfn[11] = NS_NONAME;
                        return Ok(());
                    }
                    return if ns & NS_LAST != 0 {
                        Err(FsError::NoFile)
                    } else {
                        Err(FsError::NoPath)
                    };
                }
                Err(e) => return Err(e),
                Ok(()) => {}
            }
            if ns & NS_LAST != 0 {
                return Ok(());
            }
            // Descend only if the matched entry is a directory.
            if dp.obj.attr & AM_DIR == 0 {
                return Err(FsError::NoPath);
            }
            if self.is_exfat() {
                // Remember the containing directory so the child's entry
                // set can be rewritten later.
                dp.obj.c_scl = dp.obj.sclust;
                dp.obj.c_size = (dp.obj.objsize as u32 & 0xFFFF_FF00) | dp.obj.stat as u32;
                dp.obj.c_ofs = dp.blk_ofs;
                let mut obj = ObjInfo::default();
                self.init_alloc_info(&mut obj);
                dp.obj.sclust = obj.sclust;
                dp.obj.objsize = obj.objsize;
                dp.obj.stat = obj.stat;
                dp.obj.n_frag = 0;
            } else {
                let off = (dp.dptr % self.ss) as usize;
                let ent = &self.win.buf[off..off + SZ_DIRE];
                dp.obj.sclust = self.ld_clust_ent(ent);
            }
        }
    }
}
