// Directory table access: a positioned cursor over a static (FAT12/16
// root) or clustered directory, entry-block recognition for both 8.3/LFN
// and exFAT entry sets, and entry allocation/removal.

use silt_core::{BlockDevice, FsError};

use crate::families::fat::common::names::{
    self, NS_DOT, NS_LFN, NS_LOSS, NS_NOLFN, NS_NONAME,
};
use crate::families::fat::common::upcase;
use crate::families::fat::volume::{FatVolume, ObjInfo, STA_DIR_STRETCHED};
use crate::families::fat::*;

/// "No LFN / entry block start" marker for `DirCursor::blk_ofs`.
pub(crate) const BLK_NONE: u32 = 0xFFFF_FFFF;

/// Positioned iterator over one directory table.
#[derive(Debug, Clone)]
pub(crate) struct DirCursor {
    pub obj: ObjInfo,
    /// Byte offset of the current entry in the table.
    pub dptr: u32,
    /// Cluster holding the current entry (0 in a static root).
    pub clust: u32,
    /// Sector holding the current entry; 0 once the cursor hit the end.
    pub sect: u64,
    /// Offset of the entry block (LFN head or exFAT FileDir entry).
    pub blk_ofs: u32,
    /// 8.3 rendition of the segment being matched + NS flags in byte 11.
    pub sfn: [u8; 12],
}

impl Default for DirCursor {
    fn default() -> Self {
        DirCursor {
            obj: ObjInfo::default(),
            dptr: 0,
            clust: 0,
            sect: 0,
            blk_ofs: BLK_NONE,
            sfn: [0; 12],
        }
    }
}

/// An open directory, as handed to callers for `readdir`.
pub struct DirHandle {
    pub(crate) dp: DirCursor,
    pub(crate) lockid: u32,
}

impl<D: BlockDevice> FatVolume<D> {
    /// Cursor over the root directory, rewound.
    pub(crate) fn root_cursor(&mut self) -> Result<DirCursor, FsError> {
        let mut dp = DirCursor {
            obj: ObjInfo {
                id: self.id,
                ..ObjInfo::default()
            },
            ..DirCursor::default()
        };
        self.dir_sdi(&mut dp, 0)?;
        Ok(dp)
    }

    /// Load start cluster from an 8.3 entry.
    pub(crate) fn ld_clust_ent(&self, ent: &[u8]) -> u32 {
        let mut cl = ld_word(&ent[DIR_FST_CLUS_LO..]) as u32;
        if self.fs_type == Some(FatType::Fat32) {
            cl |= (ld_word(&ent[DIR_FST_CLUS_HI..]) as u32) << 16;
        }
        cl
    }

    /// Set the cursor to byte offset `idx` of its table.
    pub(crate) fn dir_sdi(&mut self, dp: &mut DirCursor, idx: u32) -> Result<(), FsError> {
        let max = if self.is_exfat() { MAX_DIR_EX } else { MAX_DIR };
        if idx >= max || idx % SZ_DIRE as u32 != 0 {
            return Err(FsError::Internal("directory offset out of range"));
        }
        dp.dptr = idx;
        let mut clst = dp.obj.sclust;
        if clst == 0 && matches!(self.fs_type, Some(FatType::Fat32) | Some(FatType::ExFat)) {
            clst = self.dirbase as u32;
            if self.is_exfat() {
                dp.obj.stat = 0; // the exFAT root has a real FAT chain
            }
        }

        let mut ofs = idx;
        if clst == 0 {
            // Static root directory.
            if ofs / SZ_DIRE as u32 >= self.n_rootdir {
                return Err(FsError::Internal("static root index out of range"));
            }
            dp.sect = self.dirbase;
        } else {
            let csz = self.cluster_bytes() as u32;
            while ofs >= csz {
                clst = self.get_fat(&dp.obj, clst)?;
                if clst < 2 || clst >= self.n_fatent {
                    return Err(FsError::Internal("directory chain ended early"));
                }
                ofs -= csz;
            }
            dp.sect = self.clust2sect(clst);
        }
        dp.clust = clst;
        if dp.sect == 0 {
            return Err(FsError::Internal("directory maps to no sector"));
        }
        dp.sect += (ofs / self.ss) as u64;
        Ok(())
    }

    /// Advance to the next entry. With `stretch` the table grows by one
    /// zeroed cluster when the chain ends.
    pub(crate) fn dir_next(&mut self, dp: &mut DirCursor, stretch: bool) -> Result<(), FsError> {
        let max = if self.is_exfat() { MAX_DIR_EX } else { MAX_DIR };
        let ofs = dp.dptr + SZ_DIRE as u32;
        if ofs >= max {
            dp.sect = 0;
        }
        if dp.sect == 0 {
            return Err(FsError::NoFile);
        }

        if ofs % self.ss == 0 {
            dp.sect += 1;
            if dp.clust == 0 {
                // Static table cannot grow.
                if ofs / SZ_DIRE as u32 >= self.n_rootdir {
                    dp.sect = 0;
                    return Err(FsError::NoFile);
                }
            } else if (ofs / self.ss) & (self.csize - 1) == 0 {
                // Cluster boundary: follow or grow the chain.
                let mut clst = self.get_fat(&dp.obj, dp.clust)?;
                if clst < 2 {
                    return Err(FsError::Internal("directory chain broken"));
                }
                if clst >= self.n_fatent {
                    if !stretch {
                        dp.sect = 0;
                        return Err(FsError::NoFile);
                    }
                    clst = match self.create_chain(&mut dp.obj, dp.clust)? {
                        Some(c) => c,
                        None => {
                            dp.sect = 0;
                            return Err(FsError::Denied); // directory table full
                        }
                    };
                    self.dir_clear(clst)?;
                    if self.is_exfat() {
                        dp.obj.stat |= STA_DIR_STRETCHED;
                    }
                }
                dp.clust = clst;
                dp.sect = self.clust2sect(clst);
            }
        }
        dp.dptr = ofs;
        Ok(())
    }

    /// Zero-fill a freshly allocated directory cluster.
    pub(crate) fn dir_clear(&mut self, clst: u32) -> Result<(), FsError> {
        self.sync_window()?;
        let sect = self.clust2sect(clst);
        self.win.buf.fill(0);
        self.win.sect = sect;
        for n in 0..self.csize as u64 {
            self.dev.write(sect + n, &self.win.buf)?;
        }
        Ok(())
    }

    /// Reserve `n_ent` contiguous free entries, stretching as needed.
    /// Leaves the cursor at the last entry of the run.
    pub(crate) fn dir_alloc(&mut self, dp: &mut DirCursor, n_ent: u32) -> Result<(), FsError> {
        self.dir_sdi(dp, 0)?;
        let mut n = 0u32;
        loop {
            self.move_window(dp.sect)?;
            let off = (dp.dptr % self.ss) as usize;
            let free = if self.is_exfat() {
                self.win.buf[off + XDIR_TYPE] & 0x80 == 0
            } else {
                let b = self.win.buf[off + DIR_NAME];
                b == DDEM || b == 0
            };
            if free {
                n += 1;
                if n == n_ent {
                    return Ok(());
                }
            } else {
                n = 0;
            }
            match self.dir_next(dp, true) {
                Ok(()) => {}
                Err(FsError::NoFile) => return Err(FsError::Denied),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the entry (or volume-label entry) at or after the cursor.
    /// On success the cursor points at the found entry; for exFAT the
    /// whole entry set is loaded into the scratch block.
    pub(crate) fn dir_read(&mut self, dp: &mut DirCursor, vol_label: bool) -> Result<(), FsError> {
        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0xFF;
        let exfat = self.is_exfat();

        while dp.sect != 0 {
            self.move_window(dp.sect)?;
            let off = (dp.dptr % self.ss) as usize;
            let b = self.win.buf[off + DIR_NAME];
            if b == 0 {
                break; // end of directory
            }

            if exfat {
                if vol_label {
                    if b == ET_VLABEL {
                        return Ok(());
                    }
                } else if b == ET_FILEDIR {
                    dp.blk_ofs = dp.dptr;
                    self.load_xdir(dp)?;
                    dp.obj.attr = self.dirbuf[XDIR_ATTR] & AM_MASK;
                    return Ok(());
                }
            } else {
                let attr = self.win.buf[off + DIR_ATTR] & AM_MASK;
                dp.obj.attr = attr;
                let is_vol = (attr & !AM_ARC) == AM_VOL;
                if b == DDEM || b == b'.' || is_vol != vol_label {
                    // Deleted, dot, or the wrong entry class.
                    ord = 0xFF;
                } else if attr == AM_LFN {
                    let mut c = b;
                    if c & LLEF != 0 {
                        sum = self.win.buf[off + LDIR_CHKSUM];
                        c &= !LLEF;
                        ord = c;
                        dp.blk_ofs = dp.dptr;
                    }
                    let ent = &self.win.buf[off..off + SZ_DIRE];
                    ord = if c == ord
                        && sum == ent[LDIR_CHKSUM]
                        && names::pick_lfn(&mut self.lfnbuf, &self.win.buf[off..off + SZ_DIRE])
                    {
                        ord - 1
                    } else {
                        0xFF
                    };
                } else {
                    // An SFN entry terminates the block.
                    let ent = &self.win.buf[off..off + SZ_DIRE];
                    if ord != 0 || sum != names::sum_sfn(ent) {
                        dp.blk_ofs = BLK_NONE; // no (valid) LFN attached
                    }
                    return Ok(());
                }
            }

            match self.dir_next(dp, false) {
                Ok(()) => {}
                Err(FsError::NoFile) => break,
                Err(e) => {
                    dp.sect = 0;
                    return Err(e);
                }
            }
        }
        dp.sect = 0;
        Err(FsError::NoFile)
    }

    /// Find the object whose name was parsed into the cursor/LFN buffer.
    pub(crate) fn dir_find(&mut self, dp: &mut DirCursor) -> Result<(), FsError> {
        self.dir_sdi(dp, 0)?;

        if self.is_exfat() {
            let len = self.lfn_len();
            let hash = names::xname_sum(&self.lfnbuf[..len]);
            loop {
                self.dir_read(dp, false)?;
                if ld_word(&self.dirbuf[XDIR_NAME_HASH..]) == hash {
                    let nc = self.dirbuf[XDIR_NUM_NAME] as usize;
                    let mut di = SZ_DIRE * 2;
                    let mut ni = 0usize;
                    let mut matched = true;
                    for _ in 0..nc {
                        if di % SZ_DIRE == 0 {
                            di += 2; // skip type and flags bytes
                        }
                        if ni >= len
                            || upcase::to_upper(ld_word(&self.dirbuf[di..]))
                                != upcase::to_upper(self.lfnbuf[ni])
                        {
                            matched = false;
                            break;
                        }
                        di += 2;
                        ni += 1;
                    }
                    if matched && ni == len {
                        return Ok(());
                    }
                }
                match self.dir_next(dp, false) {
                    Ok(()) => {}
                    Err(FsError::NoFile) => {
                        dp.sect = 0;
                        return Err(FsError::NoFile);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // FAT/FAT32: walk entries, assembling any LFN sequence in front of
        // each SFN and matching either representation.
        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0xFF;
        dp.blk_ofs = BLK_NONE;
        loop {
            self.move_window(dp.sect)?;
            let off = (dp.dptr % self.ss) as usize;
            let c0 = self.win.buf[off + DIR_NAME];
            if c0 == 0 {
                dp.sect = 0;
                return Err(FsError::NoFile);
            }
            let attr = self.win.buf[off + DIR_ATTR] & AM_MASK;
            dp.obj.attr = attr;
            if c0 == DDEM || ((attr & AM_VOL) != 0 && attr != AM_LFN) {
                ord = 0xFF;
                dp.blk_ofs = BLK_NONE;
            } else if attr == AM_LFN {
                if dp.sfn[11] & NS_NOLFN == 0 {
                    let mut c = c0;
                    if c & LLEF != 0 {
                        sum = self.win.buf[off + LDIR_CHKSUM];
                        c &= !LLEF;
                        ord = c;
                        dp.blk_ofs = dp.dptr;
                    }
                    let ent = &self.win.buf[off..off + SZ_DIRE];
                    ord = if c == ord
                        && sum == ent[LDIR_CHKSUM]
                        && names::cmp_lfn(&self.lfnbuf, ent)
                    {
                        ord - 1
                    } else {
                        0xFF
                    };
                }
            } else {
                let ent = &self.win.buf[off..off + SZ_DIRE];
                if ord == 0 && sum == names::sum_sfn(ent) {
                    return Ok(()); // the LFN in front matched
                }
                if dp.sfn[11] & NS_LOSS == 0 && ent[..11] == dp.sfn[..11] {
                    return Ok(()); // SFN matched
                }
                ord = 0xFF;
                dp.blk_ofs = BLK_NONE;
            }
            match self.dir_next(dp, false) {
                Ok(()) => {}
                Err(FsError::NoFile) => {
                    dp.sect = 0;
                    return Err(FsError::NoFile);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create the directory entries for the parsed name. For FAT this
    /// writes the LFN slots and a blank SFN entry; for exFAT it builds the
    /// entry set in the scratch block for the caller to finish and store.
    pub(crate) fn dir_register(&mut self, dp: &mut DirCursor) -> Result<(), FsError> {
        if dp.sfn[11] & (NS_DOT | NS_NONAME) != 0 {
            return Err(FsError::InvalidName);
        }
        let len = self.lfn_len();

        if self.is_exfat() {
            let n_ent = (len as u32 + 14) / 15 + 2;
            self.dir_alloc(dp, n_ent)?;
            dp.blk_ofs = dp.dptr - SZ_DIRE as u32 * (n_ent - 1);

            if dp.obj.stat & STA_DIR_STRETCHED != 0 {
                // The table grew: put the new cluster on the FAT and bump
                // the directory's own size in its entry set.
                dp.obj.stat &= !STA_DIR_STRETCHED;
                let mut obj = dp.obj.clone();
                self.fill_first_frag(&mut obj)?;
                self.fill_last_frag(&mut obj, dp.clust, 0xFFFF_FFFF)?;
                dp.obj = obj;
                if dp.obj.sclust != 0 {
                    let mut dj = self.load_obj_xdir(&dp.obj)?;
                    dp.obj.objsize += self.cluster_bytes();
                    let size = dp.obj.objsize;
                    st_qword(&mut self.dirbuf[XDIR_FILE_SIZE..], size);
                    st_qword(&mut self.dirbuf[XDIR_VALID_FILE_SIZE..], size);
                    self.dirbuf[XDIR_GEN_FLAGS] = dp.obj.stat | 1;
                    self.store_xdir(&mut dj)?;
                }
            }

            let len = self.lfn_len();
            create_xdir(&mut self.dirbuf, &self.lfnbuf[..=len]);
            return Ok(());
        }

        // Resolve SFN collisions with a numbered name.
        let sn = dp.sfn;
        if sn[11] & NS_LOSS != 0 {
            dp.sfn[11] = NS_NOLFN;
            let mut n = 1u32;
            loop {
                names::gen_numname(&mut dp.sfn, &sn, &self.lfnbuf, n);
                match self.dir_find(dp) {
                    Ok(()) => {
                        n += 1;
                        if n == 100 {
                            return Err(FsError::Denied); // too many collisions
                        }
                    }
                    Err(FsError::NoFile) => break,
                    Err(e) => return Err(e),
                }
            }
            dp.sfn[11] = sn[11];
        }

        let mut n_ent = if sn[11] & NS_LFN != 0 {
            (len as u32 + 12) / 13 + 1
        } else {
            1
        };
        self.dir_alloc(dp, n_ent)?;
        n_ent -= 1;
        if n_ent > 0 {
            // Store the LFN slots, highest ordinal first.
            self.dir_sdi(dp, dp.dptr - n_ent * SZ_DIRE as u32)?;
            let sum = names::sum_sfn(&dp.sfn);
            loop {
                self.move_window(dp.sect)?;
                let off = (dp.dptr % self.ss) as usize;
                names::put_lfn(
                    &self.lfnbuf,
                    &mut self.win.buf[off..off + SZ_DIRE],
                    n_ent as u8,
                    sum,
                );
                self.mark_window_dirty();
                self.dir_next(dp, false)?;
                n_ent -= 1;
                if n_ent == 0 {
                    break;
                }
            }
        }

        // The SFN entry itself; the caller fills cluster/size/times.
        self.move_window(dp.sect)?;
        let off = (dp.dptr % self.ss) as usize;
        let ent = &mut self.win.buf[off..off + SZ_DIRE];
        ent.fill(0);
        ent[..11].copy_from_slice(&dp.sfn[..11]);
        ent[DIR_NTRES] = dp.sfn[11] & (NS_BODY_LOWER | NS_EXT_LOWER);
        self.mark_window_dirty();
        Ok(())
    }

    /// Remove the entry block the cursor points at: deletion markers on
    /// FAT, InUse bits cleared on exFAT.
    pub(crate) fn dir_remove(&mut self, dp: &mut DirCursor) -> Result<(), FsError> {
        let last = dp.dptr;
        if dp.blk_ofs != BLK_NONE {
            self.dir_sdi(dp, dp.blk_ofs)?;
        }
        loop {
            self.move_window(dp.sect)?;
            let off = (dp.dptr % self.ss) as usize;
            if self.is_exfat() {
                self.win.buf[off + XDIR_TYPE] &= 0x7F;
            } else {
                self.win.buf[off + DIR_NAME] = DDEM;
            }
            self.mark_window_dirty();
            if dp.dptr >= last {
                return Ok(());
            }
            match self.dir_next(dp, false) {
                Ok(()) => {}
                Err(FsError::NoFile) => {
                    return Err(FsError::Internal("entry block ended before its tail"))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// exFAT: load the entry set starting at the cursor into the scratch
    /// block, verifying order and checksum.
    pub(crate) fn load_xdir(&mut self, dp: &mut DirCursor) -> Result<(), FsError> {
        // FileDir entry.
        self.move_window(dp.sect)?;
        let off = (dp.dptr % self.ss) as usize;
        if self.win.buf[off + XDIR_TYPE] != ET_FILEDIR {
            return Err(FsError::Internal("entry set does not start with 85"));
        }
        let (win, dirb) = (&self.win.buf, &mut self.dirbuf);
        dirb[..SZ_DIRE].copy_from_slice(&win[off..off + SZ_DIRE]);
        let sz_ent = (self.dirbuf[XDIR_NUM_SEC] as usize + 1) * SZ_DIRE;
        if !(3 * SZ_DIRE..=19 * SZ_DIRE).contains(&sz_ent) {
            return Err(FsError::Internal("entry set with bad secondary count"));
        }

        // Stream entry.
        self.dir_next_strict(dp)?;
        self.move_window(dp.sect)?;
        let off = (dp.dptr % self.ss) as usize;
        if self.win.buf[off + XDIR_TYPE] != ET_STREAM {
            return Err(FsError::Internal("entry set missing stream entry"));
        }
        let (win, dirb) = (&self.win.buf, &mut self.dirbuf);
        dirb[SZ_DIRE..2 * SZ_DIRE].copy_from_slice(&win[off..off + SZ_DIRE]);
        if max_dir_block(self.dirbuf[XDIR_NUM_NAME] as usize) > sz_ent {
            return Err(FsError::Internal("name longer than the entry set"));
        }

        // FileName entries.
        let mut i = 2 * SZ_DIRE;
        loop {
            self.dir_next_strict(dp)?;
            self.move_window(dp.sect)?;
            let off = (dp.dptr % self.ss) as usize;
            if self.win.buf[off + XDIR_TYPE] != ET_FILENAME {
                return Err(FsError::Internal("entry set missing name entry"));
            }
            if i < max_dir_block(MAX_LFN) {
                let (win, dirb) = (&self.win.buf, &mut self.dirbuf);
                dirb[i..i + SZ_DIRE].copy_from_slice(&win[off..off + SZ_DIRE]);
            }
            i += SZ_DIRE;
            if i >= sz_ent {
                break;
            }
        }

        if i <= max_dir_block(MAX_LFN)
            && names::xdir_sum(&self.dirbuf) != ld_word(&self.dirbuf[XDIR_SET_SUM..])
        {
            return Err(FsError::Internal("entry set checksum mismatch"));
        }
        Ok(())
    }

    /// `dir_next` that treats end-of-table as a broken entry set.
    fn dir_next_strict(&mut self, dp: &mut DirCursor) -> Result<(), FsError> {
        match self.dir_next(dp, false) {
            Err(FsError::NoFile) => Err(FsError::Internal("truncated entry set")),
            other => other,
        }
    }

    /// exFAT: initialize an object's allocation info from the loaded
    /// entry set.
    pub(crate) fn init_alloc_info(&self, obj: &mut ObjInfo) {
        obj.sclust = ld_dword(&self.dirbuf[XDIR_FST_CLUS..]);
        obj.objsize = ld_qword(&self.dirbuf[XDIR_FILE_SIZE..]);
        obj.stat = self.dirbuf[XDIR_GEN_FLAGS] & 2;
        obj.n_frag = 0;
    }

    /// exFAT: open the directory containing `obj` and load `obj`'s entry
    /// set, so it can be rewritten.
    pub(crate) fn load_obj_xdir(&mut self, obj: &ObjInfo) -> Result<DirCursor, FsError> {
        let mut dj = DirCursor {
            obj: ObjInfo {
                id: self.id,
                sclust: obj.c_scl,
                stat: (obj.c_size & 0xFF) as u8,
                objsize: (obj.c_size & 0xFFFF_FF00) as u64,
                n_frag: 0,
                ..ObjInfo::default()
            },
            blk_ofs: obj.c_ofs,
            ..DirCursor::default()
        };
        let blk_ofs = dj.blk_ofs;
        self.dir_sdi(&mut dj, blk_ofs)?;
        self.load_xdir(&mut dj)?;
        Ok(dj)
    }

    /// exFAT: write the scratch entry set back to the directory, with a
    /// fresh set checksum.
    pub(crate) fn store_xdir(&mut self, dp: &mut DirCursor) -> Result<(), FsError> {
        let sum = names::xdir_sum(&self.dirbuf);
        st_word(&mut self.dirbuf[XDIR_SET_SUM..], sum);
        let mut nent = self.dirbuf[XDIR_NUM_SEC] as usize + 1;
        self.dir_sdi(dp, dp.blk_ofs)?;
        let mut src = 0usize;
        loop {
            self.move_window(dp.sect)?;
            let off = (dp.dptr % self.ss) as usize;
            self.win.buf[off..off + SZ_DIRE].copy_from_slice(&self.dirbuf[src..src + SZ_DIRE]);
            self.mark_window_dirty();
            nent -= 1;
            if nent == 0 {
                return Ok(());
            }
            src += SZ_DIRE;
            match self.dir_next(dp, false) {
                Ok(()) => {}
                Err(FsError::NoFile) => {
                    return Err(FsError::Internal("entry set ran past the table"))
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// exFAT: build a fresh 85+C0+C1.. entry set for `lfn` (NUL-terminated)
/// in the scratch block.
pub(crate) fn create_xdir(dirb: &mut [u8], lfn: &[u16]) {
    dirb[..2 * SZ_DIRE].fill(0);
    dirb[XDIR_TYPE] = ET_FILEDIR;
    dirb[SZ_DIRE + XDIR_TYPE] = ET_STREAM;

    let mut i = 2 * SZ_DIRE;
    let mut nlen = 0usize;
    let mut nc1 = 0u8;
    let mut wc = 1u16;
    loop {
        dirb[i] = ET_FILENAME;
        dirb[i + 1] = 0;
        i += 2;
        loop {
            if wc != 0 {
                wc = lfn[nlen];
                if wc != 0 {
                    nlen += 1;
                }
            }
            st_word(&mut dirb[i..], wc);
            i += 2;
            if i % SZ_DIRE == 0 {
                break;
            }
        }
        nc1 += 1;
        if lfn[nlen] == 0 {
            break;
        }
    }

    dirb[XDIR_NUM_NAME] = nlen as u8;
    dirb[XDIR_NUM_SEC] = 1 + nc1;
    let hash = names::xname_sum(&lfn[..nlen]);
    st_word(&mut dirb[XDIR_NAME_HASH..], hash);
}
