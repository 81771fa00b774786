// Directory-level operations: enumeration, stat, create/remove/rename,
// attribute and timestamp updates, and the current-directory state.

use log::debug;
use silt_core::{BlockDevice, FsError};

use crate::families::fat::common::names::{NS_DOT, NS_NONAME};
use crate::families::fat::common::share::ShareAccess;
use crate::families::fat::common::upcase;
use crate::families::fat::directory::{DirCursor, DirHandle, BLK_NONE};
use crate::families::fat::volume::{FatVolume, ObjInfo};
use crate::families::fat::*;

/// Information about one directory entry, as returned by `readdir` and
/// `stat`.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// Primary (long) name, UTF-8.
    pub name: String,
    /// 8.3 alternative name; empty on exFAT.
    pub alt_name: String,
    pub size: u64,
    pub attr: u8,
    /// Packed FAT modification date and time.
    pub date: u16,
    pub time: u16,
    /// Synthesized inode: `(entry_sector << 4) | entry_index`. Values 0
    /// and 1 are remapped to 2. Not unique past 128 GiB of directory
    /// space; a documented bound, not a defect.
    pub inode: u64,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.attr & AM_DIR != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attr & AM_RDO != 0
    }
}

impl<D: BlockDevice> FatVolume<D> {
    /// Build a `FileInfo` for the entry the cursor points at.
    pub(crate) fn get_fileinfo(&mut self, dp: &DirCursor) -> Result<FileInfo, FsError> {
        if dp.sect == 0 {
            return Err(FsError::Internal("file info from an exhausted cursor"));
        }
        let raw_inode = (dp.sect << 4) | ((dp.dptr % self.ss) / SZ_DIRE as u32) as u64;
        let inode = if raw_inode < 3 { 2 } else { raw_inode };

        if self.is_exfat() {
            let nc = self.dirbuf[XDIR_NUM_NAME] as usize;
            let mut units = Vec::with_capacity(nc);
            let mut si = SZ_DIRE * 2;
            for _ in 0..nc {
                if si >= max_dir_block(MAX_LFN) {
                    units.clear(); // truncated block: inaccessible name
                    break;
                }
                if si % SZ_DIRE == 0 {
                    si += 2;
                }
                units.push(ld_word(&self.dirbuf[si..]));
                si += 2;
            }
            let name = if units.is_empty() {
                String::from("?")
            } else {
                String::from_utf16_lossy(&units)
            };
            let attr = self.dirbuf[XDIR_ATTR] & AM_MASKX;
            let size = if attr & AM_DIR != 0 {
                0
            } else {
                ld_qword(&self.dirbuf[XDIR_FILE_SIZE..])
            };
            return Ok(FileInfo {
                name,
                alt_name: String::new(),
                size,
                attr,
                time: ld_word(&self.dirbuf[XDIR_MOD_TIME..]),
                date: ld_word(&self.dirbuf[XDIR_MOD_TIME + 2..]),
                inode,
            });
        }

        self.move_window(dp.sect)?;
        let off = (dp.dptr % self.ss) as usize;
        let mut ent = [0u8; SZ_DIRE];
        ent.copy_from_slice(&self.win.buf[off..off + SZ_DIRE]);

        let mut name = String::new();
        if dp.blk_ofs != BLK_NONE {
            let len = self.lfn_len();
            name = String::from_utf16_lossy(&self.lfnbuf[..len]);
        }

        let mut alt = String::new();
        for (si, &raw) in ent[..11].iter().enumerate() {
            let mut b = raw;
            if b == b' ' {
                continue;
            }
            if b == RDDEM {
                b = DDEM;
            }
            if si == 8 {
                alt.push('.');
            }
            alt.push(char::from_u32(upcase::oem_to_unicode(b) as u32).unwrap_or('?'));
        }

        if name.is_empty() {
            // No LFN: the primary name is the SFN with NT case flags.
            let nt = ent[DIR_NTRES];
            name = alt
                .split_once('.')
                .map(|(body, ext)| {
                    let body = if nt & NS_BODY_LOWER != 0 {
                        body.to_ascii_lowercase()
                    } else {
                        body.to_string()
                    };
                    let ext = if nt & NS_EXT_LOWER != 0 {
                        ext.to_ascii_lowercase()
                    } else {
                        ext.to_string()
                    };
                    format!("{body}.{ext}")
                })
                .unwrap_or_else(|| {
                    if nt & NS_BODY_LOWER != 0 {
                        alt.to_ascii_lowercase()
                    } else {
                        alt.clone()
                    }
                });
        }

        Ok(FileInfo {
            name,
            alt_name: alt,
            size: ld_dword(&ent[DIR_FILE_SIZE..]) as u64,
            attr: ent[DIR_ATTR] & AM_MASK,
            time: ld_word(&ent[DIR_MOD_TIME..]),
            date: ld_word(&ent[DIR_MOD_TIME + 2..]),
            inode,
        })
    }

    /// Open a directory for enumeration.
    pub fn opendir(&mut self, path: &str) -> Result<DirHandle, FsError> {
        self.ensure_mounted(false)?;
        let mut dp = DirCursor::default();
        self.follow_path(&mut dp, path)?;
        if dp.sfn[11] & NS_NONAME == 0 {
            if dp.obj.attr & AM_DIR == 0 {
                return Err(FsError::NoPath);
            }
            if self.is_exfat() {
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
                dp.obj.sclust = self.ld_clust_ent(&self.win.buf[off..off + SZ_DIRE]);
            }
        }
        dp.obj.id = self.id;
        self.dir_sdi(&mut dp, 0)?;
        let lockid = if dp.obj.sclust != 0 {
            self.share
                .register(dp.obj.sclust, 0, ShareAccess::Read)?
        } else {
            0 // the root directory is never removed, no lock needed
        };
        Ok(DirHandle { dp, lockid })
    }

    /// Next entry of an open directory; `None` at the end of the table.
    pub fn readdir(&mut self, dh: &mut DirHandle) -> Result<Option<FileInfo>, FsError> {
        self.validate_obj(&dh.dp.obj)?;
        match self.dir_read(&mut dh.dp, false) {
            Ok(()) => {
                let fi = self.get_fileinfo(&dh.dp)?;
                match self.dir_next(&mut dh.dp, false) {
                    Ok(()) | Err(FsError::NoFile) => {}
                    Err(e) => return Err(e),
                }
                Ok(Some(fi))
            }
            Err(FsError::NoFile) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Rewind an open directory to its first entry.
    pub fn rewinddir(&mut self, dh: &mut DirHandle) -> Result<(), FsError> {
        self.validate_obj(&dh.dp.obj)?;
        self.dir_sdi(&mut dh.dp, 0)
    }

    pub fn closedir(&mut self, dh: &mut DirHandle) -> Result<(), FsError> {
        if dh.lockid != 0 {
            let _ = self.share.release(dh.lockid);
            dh.lockid = 0;
        }
        dh.dp.obj.id = 0;
        Ok(())
    }

    /// Information about the object at `path`.
    pub fn stat(&mut self, path: &str) -> Result<FileInfo, FsError> {
        self.ensure_mounted(false)?;
        let mut dp = DirCursor::default();
        self.follow_path(&mut dp, path)?;
        if dp.sfn[11] & NS_NONAME != 0 {
            // The origin directory has no entry of its own.
            return Err(FsError::InvalidName);
        }
        self.get_fileinfo(&dp)
    }

    /// Create a directory.
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        self.ensure_mounted(true)?;
        let mut dp = DirCursor::default();
        match self.follow_path(&mut dp, path) {
            Ok(()) => return Err(FsError::Exists),
            Err(FsError::NoFile) => {}
            Err(e) => return Err(e),
        }
        if dp.sfn[11] & NS_DOT != 0 {
            return Err(FsError::InvalidName);
        }

        let tm = self.now();
        let mut sobj = ObjInfo {
            id: self.id,
            ..ObjInfo::default()
        };
        let dcl = match self.create_chain(&mut sobj, 0)? {
            Some(c) => c,
            None => return Err(FsError::Denied), // no space for the table
        };
        sobj.objsize = self.cluster_bytes();

        let built = (|| -> Result<(), FsError> {
            self.dir_clear(dcl)?;
            if !self.is_exfat() {
                // Seed the dot entries; the window still holds the zeroed
                // top sector of the new cluster.
                let pcl = dp.obj.sclust;
                {
                    let ent = &mut self.win.buf[..SZ_DIRE];
                    ent[..11].fill(b' ');
                    ent[DIR_NAME] = b'.';
                    ent[DIR_ATTR] = AM_DIR;
                    st_dword(&mut ent[DIR_MOD_TIME..], tm);
                }
                self.st_clust_in_win(0, dcl);
                let (first, second) = self.win.buf.split_at_mut(SZ_DIRE);
                second[..SZ_DIRE].copy_from_slice(first);
                second[1] = b'.';
                self.st_clust_in_win(SZ_DIRE, pcl);
                self.mark_window_dirty();
            }
            self.dir_register(&mut dp)?;
            if self.is_exfat() {
                let clsz = self.cluster_bytes();
                st_dword(&mut self.dirbuf[XDIR_MOD_TIME..], tm);
                st_dword(&mut self.dirbuf[XDIR_FST_CLUS..], dcl);
                st_qword(&mut self.dirbuf[XDIR_FILE_SIZE..], clsz);
                st_qword(&mut self.dirbuf[XDIR_VALID_FILE_SIZE..], clsz);
                self.dirbuf[XDIR_GEN_FLAGS] = 3; // contiguous, allocated
                self.dirbuf[XDIR_ATTR] = AM_DIR;
                self.store_xdir(&mut dp)?;
            } else {
                self.move_window(dp.sect)?;
                let off = (dp.dptr % self.ss) as usize;
                {
                    let ent = &mut self.win.buf[off..off + SZ_DIRE];
                    st_dword(&mut ent[DIR_MOD_TIME..], tm);
                    ent[DIR_ATTR] = AM_DIR;
                }
                self.st_clust_in_win(off, dcl);
                self.mark_window_dirty();
            }
            Ok(())
        })();

        match built {
            Ok(()) => self.sync_fs(),
            Err(e) => {
                // Roll the table cluster back so nothing leaks.
                let _ = self.remove_chain(&mut sobj, dcl, 0);
                Err(e)
            }
        }
    }

    fn remove_entry(&mut self, path: &str, want_dir: bool) -> Result<(), FsError> {
        self.ensure_mounted(true)?;
        let mut dp = DirCursor::default();
        self.follow_path(&mut dp, path)?;
        if dp.sfn[11] & (NS_DOT | NS_NONAME) != 0 {
            return Err(FsError::InvalidName);
        }
        self.share
            .check(dp.obj.sclust, dp.dptr, ShareAccess::Delete)?;
        if dp.obj.attr & AM_RDO != 0 {
            return Err(FsError::Denied);
        }
        let is_dir = dp.obj.attr & AM_DIR != 0;
        if want_dir != is_dir {
            return Err(if want_dir {
                FsError::NoPath // rmdir of a plain file
            } else {
                FsError::Denied // unlink of a directory
            });
        }

        let mut obj = ObjInfo {
            id: self.id,
            ..ObjInfo::default()
        };
        if self.is_exfat() {
            self.init_alloc_info(&mut obj);
        } else {
            let off = (dp.dptr % self.ss) as usize;
            obj.sclust = self.ld_clust_ent(&self.win.buf[off..off + SZ_DIRE]);
        }
        let dclst = obj.sclust;

        if is_dir {
            if dclst == self.cdir {
                return Err(FsError::Denied); // the current directory
            }
            // The directory must be empty.
            let mut sdj = DirCursor {
                obj: ObjInfo {
                    id: self.id,
                    sclust: dclst,
                    objsize: obj.objsize,
                    stat: obj.stat,
                    ..ObjInfo::default()
                },
                ..DirCursor::default()
            };
            self.dir_sdi(&mut sdj, 0)?;
            match self.dir_read(&mut sdj, false) {
                Ok(()) => return Err(FsError::Denied),
                Err(FsError::NoFile) => {}
                Err(e) => return Err(e),
            }
        }

        self.dir_remove(&mut dp)?;
        if dclst != 0 {
            self.remove_chain(&mut obj, dclst, 0)?;
        }
        self.sync_fs()
    }

    /// Remove a file.
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        self.remove_entry(path, false)
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        self.remove_entry(path, true)
    }

    /// Rename or move an object within the volume. The destination must
    /// not exist.
    pub fn rename(&mut self, path_old: &str, path_new: &str) -> Result<(), FsError> {
        self.ensure_mounted(true)?;
        let mut djo = DirCursor::default();
        self.follow_path(&mut djo, path_old)?;
        if djo.sfn[11] & (NS_DOT | NS_NONAME) != 0 {
            return Err(FsError::InvalidName);
        }
        self.share
            .check(djo.obj.sclust, djo.dptr, ShareAccess::Delete)?;

        if self.is_exfat() {
            // Keep the old FileDir+Stream pair; dir_register builds fresh
            // name entries for the new name.
            let mut saved = [0u8; 2 * SZ_DIRE];
            saved.copy_from_slice(&self.dirbuf[..2 * SZ_DIRE]);

            let mut djn = DirCursor::default();
            match self.follow_path(&mut djn, path_new) {
                Ok(()) => return Err(FsError::Exists),
                Err(FsError::NoFile) => {}
                Err(e) => return Err(e),
            }
            self.dir_register(&mut djn)?;
            let nf = self.dirbuf[XDIR_NUM_SEC];
            let nn = self.dirbuf[XDIR_NUM_NAME];
            let hn = ld_word(&self.dirbuf[XDIR_NAME_HASH..]);
            self.dirbuf[..2 * SZ_DIRE].copy_from_slice(&saved);
            self.dirbuf[XDIR_NUM_SEC] = nf;
            self.dirbuf[XDIR_NUM_NAME] = nn;
            st_word(&mut self.dirbuf[XDIR_NAME_HASH..], hn);
            if self.dirbuf[XDIR_ATTR] & AM_DIR == 0 {
                self.dirbuf[XDIR_ATTR] |= AM_ARC;
            }
            self.store_xdir(&mut djn)?;
        } else {
            self.move_window(djo.sect)?;
            let off = (djo.dptr % self.ss) as usize;
            let mut saved = [0u8; SZ_DIRE];
            saved.copy_from_slice(&self.win.buf[off..off + SZ_DIRE]);

            let mut djn = DirCursor::default();
            match self.follow_path(&mut djn, path_new) {
                Ok(()) => return Err(FsError::Exists),
                Err(FsError::NoFile) => {}
                Err(e) => return Err(e),
            }
            self.dir_register(&mut djn)?;
            self.move_window(djn.sect)?;
            let off = (djn.dptr % self.ss) as usize;
            let moved_attr;
            {
                let ent = &mut self.win.buf[off..off + SZ_DIRE];
                ent[13..SZ_DIRE].copy_from_slice(&saved[13..SZ_DIRE]);
                ent[DIR_ATTR] = saved[DIR_ATTR];
                if ent[DIR_ATTR] & AM_DIR == 0 {
                    ent[DIR_ATTR] |= AM_ARC;
                }
                moved_attr = ent[DIR_ATTR];
            }
            self.mark_window_dirty();

            if moved_attr & AM_DIR != 0 && djo.obj.sclust != djn.obj.sclust {
                // Moved across directories: repoint the dot-dot entry.
                let ent = &self.win.buf[off..off + SZ_DIRE];
                let dcl = self.ld_clust_ent(ent);
                let sect = self.clust2sect(dcl);
                if sect == 0 {
                    return Err(FsError::Internal("moved directory has no table"));
                }
                self.move_window(sect)?;
                if self.win.buf[SZ_DIRE + 1] == b'.' {
                    let npc = djn.obj.sclust;
                    self.st_clust_in_win(SZ_DIRE, npc);
                    self.mark_window_dirty();
                }
            }
        }

        self.dir_remove(&mut djo)?;
        debug!("renamed {path_old} -> {path_new}");
        self.sync_fs()
    }

    /// Change the RDO/HID/SYS/ARC attribute bits selected by `mask`.
    pub fn chmod(&mut self, path: &str, attr: u8, mask: u8) -> Result<(), FsError> {
        self.ensure_mounted(true)?;
        let mut dp = DirCursor::default();
        self.follow_path(&mut dp, path)?;
        if dp.sfn[11] & (NS_DOT | NS_NONAME) != 0 {
            return Err(FsError::InvalidName);
        }
        let mask = mask & (AM_RDO | AM_HID | AM_SYS | AM_ARC);
        if self.is_exfat() {
            self.dirbuf[XDIR_ATTR] = (attr & mask) | (self.dirbuf[XDIR_ATTR] & !mask);
            self.store_xdir(&mut dp)?;
        } else {
            let off = (dp.dptr % self.ss) as usize;
            let cur = self.win.buf[off + DIR_ATTR];
            self.win.buf[off + DIR_ATTR] = (attr & mask) | (cur & !mask);
            self.mark_window_dirty();
        }
        self.sync_fs()
    }

    /// Set the modification timestamp.
    pub fn utimes(&mut self, path: &str, date: u16, time: u16) -> Result<(), FsError> {
        self.ensure_mounted(true)?;
        let mut dp = DirCursor::default();
        self.follow_path(&mut dp, path)?;
        if dp.sfn[11] & (NS_DOT | NS_NONAME) != 0 {
            return Err(FsError::InvalidName);
        }
        let packed = ((date as u32) << 16) | time as u32;
        if self.is_exfat() {
            st_dword(&mut self.dirbuf[XDIR_MOD_TIME..], packed);
            self.store_xdir(&mut dp)?;
        } else {
            let off = (dp.dptr % self.ss) as usize;
            st_dword(&mut self.win.buf[off + DIR_MOD_TIME..], packed);
            self.mark_window_dirty();
        }
        self.sync_fs()
    }

    /// Change the current directory.
    pub fn chdir(&mut self, path: &str) -> Result<(), FsError> {
        self.ensure_mounted(false)?;
        let mut dp = DirCursor::default();
        self.follow_path(&mut dp, path)?;
        if dp.sfn[11] & NS_NONAME != 0 {
            self.cdir = dp.obj.sclust;
            if self.is_exfat() {
                self.cdc_scl = dp.obj.c_scl;
                self.cdc_size = dp.obj.c_size;
                self.cdc_ofs = dp.obj.c_ofs;
            }
        } else {
            if dp.obj.attr & AM_DIR == 0 {
                return Err(FsError::NoPath);
            }
            if self.is_exfat() {
                self.cdir = ld_dword(&self.dirbuf[XDIR_FST_CLUS..]);
                self.cdc_scl = dp.obj.sclust;
                self.cdc_size = (dp.obj.objsize as u32 & 0xFFFF_FF00) | dp.obj.stat as u32;
                self.cdc_ofs = dp.blk_ofs;
            } else {
                let off = (dp.dptr % self.ss) as usize;
                self.cdir = self.ld_clust_ent(&self.win.buf[off..off + SZ_DIRE]);
            }
        }
        self.cwd = join_cwd(&self.cwd, path);
        Ok(())
    }

    /// Current directory path.
    ///
    /// On FAT volumes the path is reconstructed by climbing the dot-dot
    /// chain; exFAT has no dot entries, so the path tracked across
    /// `chdir` calls is returned instead.
    pub fn getcwd(&mut self) -> Result<String, FsError> {
        self.ensure_mounted(false)?;
        if self.is_exfat() {
            return Ok(self.cwd.clone());
        }

        let mut parts = Vec::new();
        let mut ccl = self.cdir;
        while ccl != 0 {
            // Parent cluster from the dot-dot entry.
            let mut dj = DirCursor {
                obj: ObjInfo {
                    id: self.id,
                    sclust: ccl,
                    ..ObjInfo::default()
                },
                ..DirCursor::default()
            };
            self.dir_sdi(&mut dj, SZ_DIRE as u32)?;
            self.move_window(dj.sect)?;
            let off = (dj.dptr % self.ss) as usize;
            let pcl = self.ld_clust_ent(&self.win.buf[off..off + SZ_DIRE]);

            // Find our entry in the parent.
            let mut pj = DirCursor {
                obj: ObjInfo {
                    id: self.id,
                    sclust: pcl,
                    ..ObjInfo::default()
                },
                ..DirCursor::default()
            };
            self.dir_sdi(&mut pj, 0)?;
            loop {
                match self.dir_read(&mut pj, false) {
                    Ok(()) => {}
                    Err(FsError::NoFile) => {
                        return Err(FsError::Internal("directory unreachable from parent"))
                    }
                    Err(e) => return Err(e),
                }
                let off = (pj.dptr % self.ss) as usize;
                if self.ld_clust_ent(&self.win.buf[off..off + SZ_DIRE]) == ccl {
                    break;
                }
                match self.dir_next(&mut pj, false) {
                    Ok(()) => {}
                    Err(FsError::NoFile) => {
                        return Err(FsError::Internal("directory unreachable from parent"))
                    }
                    Err(e) => return Err(e),
                }
            }
            parts.push(self.get_fileinfo(&pj)?.name);
            ccl = pcl;
        }

        let mut path = String::new();
        for name in parts.iter().rev() {
            path.push('/');
            path.push_str(name);
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }
}

/// Normalize `next` against `base`: absolute paths replace, relative ones
/// append, with `.` and `..` folded away.
fn join_cwd(base: &str, next: &str) -> String {
    let mut segs: Vec<&str> = if next.starts_with(['/', '\\']) {
        Vec::new()
    } else {
        base.split('/').filter(|s| !s.is_empty()).collect()
    };
    for seg in next.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                segs.pop();
            }
            s => segs.push(s),
        }
    }
    let mut out = String::new();
    for s in segs {
        out.push('/');
        out.push_str(s);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
