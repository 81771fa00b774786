// File handles and the read/write/seek/truncate/sync pipeline.
//
// Each handle carries its own sector buffer; whole-sector spans bypass it
// with direct multi-sector transfers, patched against the buffer when it
// overlaps the span and is dirty.

use std::ops::BitOr;

use silt_core::{BlockDevice, FsError};

use crate::families::fat::common::names::NS_NONAME;
use crate::families::fat::common::share::ShareAccess;
use crate::families::fat::directory::DirCursor;
use crate::families::fat::volume::{FatVolume, ObjInfo};
use crate::families::fat::*;

// Handle flag bits. The low bits mirror the open mode; the high two are
// run-time state.
pub(crate) const FA_READ: u8 = 0x01;
pub(crate) const FA_WRITE: u8 = 0x02;
pub(crate) const FA_CREATE_NEW: u8 = 0x04;
pub(crate) const FA_CREATE_ALWAYS: u8 = 0x08;
pub(crate) const FA_OPEN_ALWAYS: u8 = 0x10;
pub(crate) const FA_SEEKEND: u8 = 0x20;
/// File content or size changed; directory entry update pending.
pub(crate) const FA_MODIFIED: u8 = 0x40;
/// The handle's sector buffer holds unwritten data.
pub(crate) const FA_DIRTY: u8 = 0x80;

/// How to open a file. Combine with `|`: `OpenMode::WRITE | OpenMode::CREATE_NEW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(pub(crate) u8);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(FA_READ);
    pub const WRITE: OpenMode = OpenMode(FA_WRITE);
    pub const OPEN_EXISTING: OpenMode = OpenMode(0x00);
    pub const CREATE_NEW: OpenMode = OpenMode(FA_CREATE_NEW);
    pub const CREATE_ALWAYS: OpenMode = OpenMode(FA_CREATE_ALWAYS);
    pub const OPEN_ALWAYS: OpenMode = OpenMode(FA_OPEN_ALWAYS);
    pub const OPEN_APPEND: OpenMode = OpenMode(FA_OPEN_ALWAYS | FA_SEEKEND);

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;
    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// An open file.
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) obj: ObjInfo,
    pub(crate) flag: u8,
    /// Sticky error: once a transfer fails, every later operation on this
    /// handle fails the same way until close.
    pub(crate) err: Option<FsError>,
    pub(crate) fptr: u64,
    pub(crate) clust: u32,
    /// Sector currently held in `buf` (0 = none).
    pub(crate) sect: u64,
    /// Sector and in-sector offset of the 8.3 directory entry (FAT only).
    pub(crate) dir_sect: u64,
    pub(crate) dir_ofs: u32,
    pub(crate) lockid: u32,
    pub(crate) buf: Vec<u8>,
    /// Cluster link map for fast seek: (run length, first cluster) pairs.
    pub(crate) cltbl: Option<Vec<(u32, u32)>>,
}

impl FileHandle {
    fn new(sector_size: usize) -> Self {
        FileHandle {
            obj: ObjInfo::default(),
            flag: 0,
            err: None,
            fptr: 0,
            clust: 0,
            sect: 0,
            dir_sect: 0,
            dir_ofs: 0,
            lockid: 0,
            buf: vec![0u8; sector_size],
            cltbl: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.obj.objsize
    }

    pub fn tell(&self) -> u64 {
        self.fptr
    }

    pub fn at_eof(&self) -> bool {
        self.fptr >= self.obj.objsize
    }

    /// The latched error, if any transfer has failed on this handle.
    pub fn error(&self) -> Option<&FsError> {
        self.err.as_ref()
    }
}

/// Cluster for a file offset, resolved through the link map.
/// 0 means the offset is past the mapped chain.
fn clmt_clust(tbl: &[(u32, u32)], ofs: u64, cluster_bytes: u64) -> u32 {
    let mut cl = (ofs / cluster_bytes) as u32;
    for &(ncl, tcl) in tbl {
        if ncl == 0 {
            return 0;
        }
        if cl < ncl {
            return tcl + cl;
        }
        cl -= ncl;
    }
    0
}

impl<D: BlockDevice> FatVolume<D> {
    /// Handle validity: owning mount, no latched error, live media.
    fn validate_fh(&self, fh: &FileHandle) -> Result<(), FsError> {
        self.validate_obj(&fh.obj)?;
        if let Some(e) = &fh.err {
            return Err(e.clone());
        }
        if self.dev.status().not_ready {
            return Err(FsError::NotReady);
        }
        Ok(())
    }

    /// Latch a transfer error on the handle and return it.
    fn abort(fh: &mut FileHandle, e: FsError) -> FsError {
        if matches!(e, FsError::Disk(_) | FsError::Internal(_)) {
            fh.err = Some(e.clone());
        }
        e
    }

    /// Open or create a file.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, FsError> {
        let mut m = mode.0;
        if m & (FA_READ | FA_WRITE | FA_CREATE_ALWAYS | FA_CREATE_NEW | FA_OPEN_ALWAYS) == 0 {
            return Err(FsError::InvalidParameter("empty open mode"));
        }
        let writing = m & !FA_READ != 0;
        self.ensure_mounted(writing)?;

        let mut dp = DirCursor::default();
        let found = match self.follow_path(&mut dp, path) {
            Ok(()) if dp.sfn[11] & NS_NONAME != 0 => Err(FsError::InvalidName),
            other => other,
        };
        if found.is_ok() {
            self.share.check(
                dp.obj.sclust,
                dp.dptr,
                if writing {
                    ShareAccess::Write
                } else {
                    ShareAccess::Read
                },
            )?;
        }

        let mut fh = FileHandle::new(self.ss as usize);

        if m & (FA_CREATE_ALWAYS | FA_OPEN_ALWAYS | FA_CREATE_NEW) != 0 {
            match found {
                Err(FsError::NoFile) => {
                    if !self.share.has_free_slot() {
                        return Err(FsError::TooManyOpenFiles);
                    }
                    self.dir_register(&mut dp)?;
                    m |= FA_CREATE_ALWAYS; // brand new: fall into the clean-entry path
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    if dp.obj.attr & (AM_RDO | AM_DIR) != 0 {
                        return Err(FsError::Denied);
                    }
                    if m & FA_CREATE_NEW != 0 {
                        return Err(FsError::Exists);
                    }
                }
            }

            if m & FA_CREATE_ALWAYS != 0 {
                // Truncate to an empty, archive-flagged file.
                let tm = self.now();
                if self.is_exfat() {
                    fh.obj.id = self.id;
                    self.init_alloc_info(&mut fh.obj);
                    self.dirbuf[2..SZ_DIRE].fill(0);
                    self.dirbuf[SZ_DIRE + 6..2 * SZ_DIRE].fill(0);
                    self.dirbuf[XDIR_ATTR] = AM_ARC;
                    st_dword(&mut self.dirbuf[XDIR_CRT_TIME..], tm);
                    self.dirbuf[XDIR_GEN_FLAGS] = 1;
                    self.store_xdir(&mut dp)?;
                    if fh.obj.sclust != 0 {
                        let scl = fh.obj.sclust;
                        self.remove_chain(&mut fh.obj, scl, 0)?;
                        fh.obj.sclust = 0;
                    }
                } else {
                    self.move_window(dp.sect)?;
                    let off = (dp.dptr % self.ss) as usize;
                    let cl = self.ld_clust_ent(&self.win.buf[off..off + SZ_DIRE]);
                    {
                        let ent = &mut self.win.buf[off..off + SZ_DIRE];
                        st_dword(&mut ent[DIR_CRT_TIME..], tm);
                        ent[DIR_ATTR] = AM_ARC;
                        st_dword(&mut ent[DIR_FILE_SIZE..], 0);
                    }
                    self.st_clust_in_win(off, 0);
                    self.mark_window_dirty();
                    if cl != 0 {
                        let sc = self.win.sect;
                        self.remove_chain(&mut dp.obj, cl, 0)?;
                        self.move_window(sc)?;
                        // The freed clusters make a fine allocation hint.
                        self.last_clust = cl - 1;
                    }
                }
            }
        } else {
            found?;
            if dp.obj.attr & AM_DIR != 0 {
                return Err(FsError::NoFile);
            }
            if m & FA_WRITE != 0 && dp.obj.attr & AM_RDO != 0 {
                return Err(FsError::Denied);
            }
        }

        if m & FA_CREATE_ALWAYS != 0 {
            m |= FA_MODIFIED;
        }
        fh.dir_sect = self.win.sect;
        fh.dir_ofs = dp.dptr % self.ss;
        fh.lockid = self.share.register(
            dp.obj.sclust,
            dp.dptr,
            if writing {
                ShareAccess::Write
            } else {
                ShareAccess::Read
            },
        )?;

        if self.is_exfat() {
            fh.obj.c_scl = dp.obj.sclust;
            fh.obj.c_size = (dp.obj.objsize as u32 & 0xFFFF_FF00) | dp.obj.stat as u32;
            fh.obj.c_ofs = dp.blk_ofs;
            self.init_alloc_info(&mut fh.obj);
        } else {
            let off = (dp.dptr % self.ss) as usize;
            let ent = &self.win.buf[off..off + SZ_DIRE];
            fh.obj.sclust = self.ld_clust_ent(ent);
            fh.obj.objsize = ld_dword(&ent[DIR_FILE_SIZE..]) as u64;
        }
        fh.obj.id = self.id;
        fh.obj.attr = dp.obj.attr;
        fh.flag = m;
        fh.err = None;
        fh.fptr = 0;
        fh.sect = 0;

        if m & FA_SEEKEND != 0 && fh.obj.objsize > 0 {
            let end = fh.obj.objsize;
            self.lseek(&mut fh, end)?;
        }
        Ok(fh)
    }

    pub(crate) fn st_clust_in_win(&mut self, off: usize, cl: u32) {
        let fat32 = self.fs_type == Some(FatType::Fat32);
        let ent = &mut self.win.buf[off..off + SZ_DIRE];
        st_word(&mut ent[DIR_FST_CLUS_LO..], cl as u16);
        if fat32 {
            st_word(&mut ent[DIR_FST_CLUS_HI..], (cl >> 16) as u16);
        }
    }

    /// Read up to `buff.len()` bytes at the r/w pointer. Short counts
    /// only at end of file.
    pub fn read(&mut self, fh: &mut FileHandle, buff: &mut [u8]) -> Result<usize, FsError> {
        self.validate_fh(fh)?;
        if fh.flag & FA_READ == 0 {
            return Err(FsError::Denied);
        }

        let remain = fh.obj.objsize.saturating_sub(fh.fptr);
        let mut btr = (buff.len() as u64).min(remain) as usize;
        let ss = self.ss as u64;
        let mut rcnt = 0usize;

        while btr > 0 {
            if fh.fptr % ss == 0 {
                let csect = ((fh.fptr / ss) & (self.csize as u64 - 1)) as u32;
                if csect == 0 {
                    let clst = if fh.fptr == 0 {
                        fh.obj.sclust
                    } else if let Some(tbl) = &fh.cltbl {
                        clmt_clust(tbl, fh.fptr, self.cluster_bytes())
                    } else {
                        match self.get_fat(&fh.obj, fh.clust) {
                            Ok(c) => c,
                            Err(e) => return Err(Self::abort(fh, e)),
                        }
                    };
                    if clst < 2 || clst >= self.n_fatent {
                        return Err(Self::abort(fh, FsError::Internal("chain ended inside file")));
                    }
                    fh.clust = clst;
                }
                let sect = self.clust2sect(fh.clust);
                if sect == 0 {
                    return Err(Self::abort(fh, FsError::Internal("cluster out of volume")));
                }
                let sect = sect + csect as u64;

                let cc = (btr as u64 / ss) as u32;
                if cc > 0 {
                    // Whole sectors go straight to the caller's buffer.
                    let cc = cc.min(self.csize - csect);
                    let nbytes = cc as usize * ss as usize;
                    if let Err(e) = self.dev.read(sect, &mut buff[rcnt..rcnt + nbytes]) {
                        return Err(Self::abort(fh, e));
                    }
                    if fh.flag & FA_DIRTY != 0 && fh.sect >= sect && fh.sect < sect + cc as u64 {
                        // The span overlaps the handle's dirty sector.
                        let o = ((fh.sect - sect) * ss) as usize;
                        buff[rcnt + o..rcnt + o + ss as usize].copy_from_slice(&fh.buf);
                    }
                    fh.fptr += nbytes as u64;
                    btr -= nbytes;
                    rcnt += nbytes;
                    continue;
                }
                if fh.sect != sect {
                    if fh.flag & FA_DIRTY != 0 {
                        if let Err(e) = self.dev.write(fh.sect, &fh.buf) {
                            return Err(Self::abort(fh, e));
                        }
                        fh.flag &= !FA_DIRTY;
                    }
                    if let Err(e) = self.dev.read(sect, &mut fh.buf) {
                        return Err(Self::abort(fh, e));
                    }
                }
                fh.sect = sect;
            }

            let off = (fh.fptr % ss) as usize;
            let n = (ss as usize - off).min(btr);
            buff[rcnt..rcnt + n].copy_from_slice(&fh.buf[off..off + n]);
            fh.fptr += n as u64;
            btr -= n;
            rcnt += n;
        }
        Ok(rcnt)
    }

    /// Write `buff` at the r/w pointer, allocating clusters as needed.
    /// Returns the number of bytes written; a short count means the
    /// volume filled up.
    pub fn write(&mut self, fh: &mut FileHandle, buff: &[u8]) -> Result<usize, FsError> {
        self.validate_fh(fh)?;
        if fh.flag & FA_WRITE == 0 {
            return Err(FsError::Denied);
        }
        self.ensure_mounted(true)?;

        let ss = self.ss as u64;
        let mut btw = buff.len();
        if !self.is_exfat() && fh.fptr + btw as u64 > u32::MAX as u64 {
            // FAT caps file size at 4 GiB - 1.
            btw = (u32::MAX as u64 - fh.fptr) as usize;
        }
        if fh.cltbl.is_some() && fh.fptr + btw as u64 > fh.obj.objsize {
            // A link-mapped file cannot grow.
            return Err(FsError::Denied);
        }

        let mut wcnt = 0usize;
        while btw > 0 {
            if fh.fptr % ss == 0 {
                let csect = ((fh.fptr / ss) & (self.csize as u64 - 1)) as u32;
                if csect == 0 {
                    let clst = if fh.fptr == 0 {
                        let scl = fh.obj.sclust;
                        if scl == 0 {
                            match self.create_chain(&mut fh.obj, 0) {
                                Ok(Some(c)) => {
                                    fh.obj.sclust = c;
                                    c
                                }
                                Ok(None) => break, // disk full
                                Err(e) => return Err(Self::abort(fh, e)),
                            }
                        } else {
                            scl
                        }
                    } else {
                        match self.create_chain(&mut fh.obj, fh.clust) {
                            Ok(Some(c)) => c,
                            Ok(None) => break, // disk full
                            Err(e) => return Err(Self::abort(fh, e)),
                        }
                    };
                    fh.clust = clst;
                }
                if fh.flag & FA_DIRTY != 0 {
                    if let Err(e) = self.dev.write(fh.sect, &fh.buf) {
                        return Err(Self::abort(fh, e));
                    }
                    fh.flag &= !FA_DIRTY;
                }
                let sect = self.clust2sect(fh.clust);
                if sect == 0 {
                    return Err(Self::abort(fh, FsError::Internal("cluster out of volume")));
                }
                let sect = sect + csect as u64;

                let cc = (btw as u64 / ss) as u32;
                if cc > 0 {
                    let cc = cc.min(self.csize - csect);
                    let nbytes = cc as usize * ss as usize;
                    if let Err(e) = self.dev.write(sect, &buff[wcnt..wcnt + nbytes]) {
                        return Err(Self::abort(fh, e));
                    }
                    if fh.sect >= sect && fh.sect < sect + cc as u64 {
                        // Refresh the (now stale) handle buffer copy.
                        let o = ((fh.sect - sect) * ss) as usize;
                        fh.buf.copy_from_slice(&buff[wcnt + o..wcnt + o + ss as usize]);
                        fh.flag &= !FA_DIRTY;
                    }
                    fh.fptr += nbytes as u64;
                    if fh.fptr > fh.obj.objsize {
                        fh.obj.objsize = fh.fptr;
                    }
                    btw -= nbytes;
                    wcnt += nbytes;
                    continue;
                }
                if fh.sect != sect && fh.fptr < fh.obj.objsize {
                    // Partial sector inside the file: pre-read. Past the
                    // growing edge there is nothing to preserve.
                    if let Err(e) = self.dev.read(sect, &mut fh.buf) {
                        return Err(Self::abort(fh, e));
                    }
                }
                fh.sect = sect;
            }

            let off = (fh.fptr % ss) as usize;
            let n = (ss as usize - off).min(btw);
            fh.buf[off..off + n].copy_from_slice(&buff[wcnt..wcnt + n]);
            fh.flag |= FA_DIRTY;
            fh.fptr += n as u64;
            if fh.fptr > fh.obj.objsize {
                fh.obj.objsize = fh.fptr;
            }
            btw -= n;
            wcnt += n;
        }
        fh.flag |= FA_MODIFIED;
        Ok(wcnt)
    }

    /// Move the r/w pointer. Read-only handles clamp at the file size;
    /// writable handles extend the file (allocating clusters) when
    /// seeking past the end.
    pub fn lseek(&mut self, fh: &mut FileHandle, ofs: u64) -> Result<(), FsError> {
        self.validate_fh(fh)?;
        let ss = self.ss as u64;

        if let Some(tbl) = &fh.cltbl {
            // Fast seek through the link map; never extends.
            let ofs = ofs.min(fh.obj.objsize);
            fh.fptr = ofs;
            if ofs > 0 {
                let clst = clmt_clust(tbl, ofs - 1, self.cluster_bytes());
                if clst < 2 {
                    return Err(Self::abort(fh, FsError::Internal("offset past link map")));
                }
                fh.clust = clst;
                let mut dsc = self.clust2sect(clst);
                if dsc == 0 {
                    return Err(Self::abort(fh, FsError::Internal("cluster out of volume")));
                }
                dsc += ((ofs - 1) / ss) & (self.csize as u64 - 1);
                if fh.fptr % ss != 0 && dsc != fh.sect {
                    if fh.flag & FA_DIRTY != 0 {
                        if let Err(e) = self.dev.write(fh.sect, &fh.buf) {
                            return Err(Self::abort(fh, e));
                        }
                        fh.flag &= !FA_DIRTY;
                    }
                    if let Err(e) = self.dev.read(dsc, &mut fh.buf) {
                        return Err(Self::abort(fh, e));
                    }
                    fh.sect = dsc;
                }
            }
            return Ok(());
        }

        let mut ofs = ofs;
        if ofs > fh.obj.objsize && fh.flag & FA_WRITE == 0 {
            ofs = fh.obj.objsize;
        }

        let ifptr = fh.fptr;
        fh.fptr = 0;
        let mut nsect = 0u64;
        if ofs > 0 {
            let bcs = self.cluster_bytes();
            let mut clst;
            if ifptr > 0 && (ofs - 1) / bcs >= (ifptr - 1) / bcs {
                // Forward seek within the already-followed part of the
                // chain: continue from the current cluster.
                fh.fptr = (ifptr - 1) & !(bcs - 1);
                ofs -= fh.fptr;
                clst = fh.clust;
            } else {
                clst = fh.obj.sclust;
                if clst == 0 {
                    match self.create_chain(&mut fh.obj, 0) {
                        Ok(Some(c)) => {
                            fh.obj.sclust = c;
                            clst = c;
                        }
                        Ok(None) => clst = 0,
                        Err(e) => return Err(Self::abort(fh, e)),
                    }
                }
                fh.clust = clst;
            }
            if clst != 0 {
                while ofs > bcs {
                    ofs -= bcs;
                    fh.fptr += bcs;
                    if fh.flag & FA_WRITE != 0 {
                        if self.is_exfat() && fh.fptr > fh.obj.objsize {
                            // Keep the generated chain valid while
                            // allocating ahead of the recorded size.
                            fh.obj.objsize = fh.fptr;
                            fh.flag |= FA_MODIFIED;
                        }
                        match self.create_chain(&mut fh.obj, clst) {
                            Ok(Some(c)) => clst = c,
                            Ok(None) => {
                                // Disk full: stop at this edge.
                                ofs = 0;
                                break;
                            }
                            Err(e) => return Err(Self::abort(fh, e)),
                        }
                    } else {
                        clst = match self.get_fat(&fh.obj, clst) {
                            Ok(c) => c,
                            Err(e) => return Err(Self::abort(fh, e)),
                        };
                    }
                    if clst < 2 || clst >= self.n_fatent {
                        return Err(Self::abort(fh, FsError::Internal("chain ended inside seek")));
                    }
                    fh.clust = clst;
                }
                fh.fptr += ofs;
                if ofs % ss != 0 {
                    nsect = self.clust2sect(clst);
                    if nsect == 0 {
                        return Err(Self::abort(fh, FsError::Internal("cluster out of volume")));
                    }
                    nsect += ofs / ss;
                }
            }
        }

        if fh.fptr > fh.obj.objsize {
            fh.obj.objsize = fh.fptr;
            fh.flag |= FA_MODIFIED;
        }
        if fh.fptr % ss != 0 && nsect != fh.sect {
            if fh.flag & FA_DIRTY != 0 {
                if let Err(e) = self.dev.write(fh.sect, &fh.buf) {
                    return Err(Self::abort(fh, e));
                }
                fh.flag &= !FA_DIRTY;
            }
            if let Err(e) = self.dev.read(nsect, &mut fh.buf) {
                return Err(Self::abort(fh, e));
            }
            fh.sect = nsect;
        }
        Ok(())
    }

    /// Probe the whole cluster chain and attach a link map to the handle,
    /// enabling O(fragments) seeks. The mapped file refuses to grow.
    pub fn create_link_map(&mut self, fh: &mut FileHandle) -> Result<usize, FsError> {
        self.validate_fh(fh)?;
        let mut tbl = Vec::new();
        let mut cl = fh.obj.sclust;
        if cl != 0 {
            loop {
                let tcl = cl;
                let mut ncl = 0u32;
                loop {
                    ncl += 1;
                    cl = match self.get_fat(&fh.obj, cl) {
                        Ok(c) => c,
                        Err(e) => return Err(Self::abort(fh, e)),
                    };
                    if cl != tcl + ncl {
                        break;
                    }
                }
                tbl.push((ncl, tcl));
                if cl >= self.n_fatent {
                    break; // end of chain
                }
                if cl < 2 {
                    return Err(Self::abort(fh, FsError::Internal("broken chain in link map")));
                }
            }
        }
        let runs = tbl.len();
        fh.cltbl = Some(tbl);
        Ok(runs)
    }

    /// Cut the file at the current r/w pointer and free the tail.
    pub fn truncate(&mut self, fh: &mut FileHandle) -> Result<(), FsError> {
        self.validate_fh(fh)?;
        if fh.flag & FA_WRITE == 0 {
            return Err(FsError::Denied);
        }
        self.ensure_mounted(true)?;

        if fh.fptr < fh.obj.objsize {
            if fh.fptr == 0 {
                let scl = fh.obj.sclust;
                if let Err(e) = self.remove_chain(&mut fh.obj, scl, 0) {
                    return Err(Self::abort(fh, e));
                }
                fh.obj.sclust = 0;
            } else {
                let ncl = match self.get_fat(&fh.obj, fh.clust) {
                    Ok(c) => c,
                    Err(e) => return Err(Self::abort(fh, e)),
                };
                if ncl < self.n_fatent {
                    let cur = fh.clust;
                    if let Err(e) = self.remove_chain(&mut fh.obj, ncl, cur) {
                        return Err(Self::abort(fh, e));
                    }
                }
            }
            fh.obj.objsize = fh.fptr;
            fh.flag |= FA_MODIFIED;
            if fh.flag & FA_DIRTY != 0 {
                if let Err(e) = self.dev.write(fh.sect, &fh.buf) {
                    return Err(Self::abort(fh, e));
                }
                fh.flag &= !FA_DIRTY;
            }
        }
        Ok(())
    }

    /// Push the handle's cached data and its directory entry to the
    /// device.
    pub fn sync_file(&mut self, fh: &mut FileHandle) -> Result<(), FsError> {
        self.validate_fh(fh)?;
        if fh.flag & FA_MODIFIED == 0 {
            return Ok(());
        }
        if fh.flag & FA_DIRTY != 0 {
            self.dev.write(fh.sect, &fh.buf)?;
            fh.flag &= !FA_DIRTY;
        }
        let tm = self.now();
        if self.is_exfat() {
            // Put any pending fragments on the FAT, then rewrite the
            // entry set through the containing directory.
            let last = fh.clust;
            let mut obj = fh.obj.clone();
            self.fill_first_frag(&mut obj)?;
            self.fill_last_frag(&mut obj, last, 0xFFFF_FFFF)?;
            fh.obj = obj;

            let mut dj = self.load_obj_xdir(&fh.obj)?;
            self.dirbuf[XDIR_ATTR] |= AM_ARC;
            let scl = fh.obj.sclust;
            let size = fh.obj.objsize;
            st_dword(&mut self.dirbuf[XDIR_FST_CLUS..], scl);
            st_qword(&mut self.dirbuf[XDIR_FILE_SIZE..], size);
            st_qword(&mut self.dirbuf[XDIR_VALID_FILE_SIZE..], size);
            self.dirbuf[XDIR_GEN_FLAGS] = fh.obj.stat | 1;
            st_dword(&mut self.dirbuf[XDIR_MOD_TIME..], tm);
            self.dirbuf[XDIR_MOD_TIME10] = 0;
            st_dword(&mut self.dirbuf[XDIR_ACC_TIME..], 0);
            self.store_xdir(&mut dj)?;
        } else {
            self.move_window(fh.dir_sect)?;
            let off = fh.dir_ofs as usize;
            let scl = fh.obj.sclust;
            {
                let ent = &mut self.win.buf[off..off + SZ_DIRE];
                ent[DIR_ATTR] |= AM_ARC;
            }
            self.st_clust_in_win(off, scl);
            let ent = &mut self.win.buf[off..off + SZ_DIRE];
            st_dword(&mut ent[DIR_FILE_SIZE..], fh.obj.objsize as u32);
            st_dword(&mut ent[DIR_MOD_TIME..], tm);
            st_word(&mut ent[DIR_LST_ACC_DATE..], 0);
            self.mark_window_dirty();
        }
        fh.flag &= !FA_MODIFIED;
        self.sync_fs()
    }

    /// Close the handle. The share-table slot is released even when the
    /// final sync fails.
    pub fn close(&mut self, fh: &mut FileHandle) -> Result<(), FsError> {
        let res = self.sync_file(fh);
        if fh.lockid != 0 {
            let _ = self.share.release(fh.lockid);
            fh.lockid = 0;
        }
        fh.obj.id = 0; // handle is dead from here on
        res
    }
}
