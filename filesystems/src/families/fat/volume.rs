// Volume object: binds one block device to the FAT engine, owns the mount
// state machine, the sector window, the name scratch buffers and the share
// table. Everything else in the family operates through `FatVolume`.

use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use silt_core::{BlockDevice, FsError};

use crate::detection::{classify_boot_sector, BootSectorKind};
use crate::families::fat::common::share::ShareTable;
use crate::families::fat::common::timestamps::{SystemTimeSource, TimeSource};
use crate::families::fat::common::upcase;
use crate::families::fat::common::window::Window;
use crate::families::fat::*;
use crate::partitioner::{
    gpt_entry_first_lba, is_ms_basic_data, mbr_partition_lbas, test_gpt_header, GPTH_PT_NUM,
    GPTH_PT_OFS, MBR_PTE_SYSTEM, SZ_GPTE,
};

/// Process-wide mount id counter. Ids are stamped on successful mounts
/// only, so a failed mount never consumes one.
static NEXT_MOUNT_ID: AtomicU32 = AtomicU32::new(1);

/// How a volume binds to its device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountOptions {
    /// Mount at bind time instead of on first access.
    pub immediate_mount: bool,
    /// Report freed cluster runs to the device.
    pub trim: bool,
    /// Reject any write-mode access regardless of media state.
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            immediate_mount: false,
            trim: false,
            read_only: false,
        }
    }
}

/// Snapshot of a mounted volume's geometry.
#[derive(Debug, Clone)]
pub struct VolumeStats {
    pub fat_type: FatType,
    pub sector_size: u32,
    pub cluster_size: u32,
    pub total_clusters: u32,
    pub free_clusters: u32,
    pub volume_serial: u32,
}

// exFAT per-object allocation status.
/// Chain lives on the FAT (or no chain yet).
pub(crate) const STA_ON_FAT: u8 = 0;
/// Chain is contiguous; the FAT holds no links for it.
pub(crate) const STA_CONTIGUOUS: u8 = 2;
/// Chain fragmented this session; FAT back-fill still pending.
pub(crate) const STA_JUST_FRAGMENTED: u8 = 3;
/// Directory stretched during an allocation (transient flag).
pub(crate) const STA_DIR_STRETCHED: u8 = 4;

/// Identity and allocation state of an open object (file or directory).
#[derive(Debug, Clone, Default)]
pub(crate) struct ObjInfo {
    /// Mount id of the owning volume at open time.
    pub id: u32,
    pub attr: u8,
    /// exFAT chain status (`STA_*`).
    pub stat: u8,
    pub sclust: u32,
    pub objsize: u64,
    /// exFAT: clusters in the first fragment minus one, valid when
    /// `stat == STA_JUST_FRAGMENTED`.
    pub n_cont: u32,
    /// exFAT: length of the growing tail fragment not yet on the FAT.
    pub n_frag: u32,
    // exFAT: containing-directory info, so the entry set can be rewritten.
    pub c_scl: u32,
    pub c_size: u32,
    pub c_ofs: u32,
}

/// A FAT/exFAT volume over a block device.
pub struct FatVolume<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) opts: MountOptions,
    pub(crate) clock: Box<dyn TimeSource + Send>,

    pub(crate) fs_type: Option<FatType>,
    pub(crate) id: u32,
    pub(crate) ss: u32,
    pub(crate) csize: u32,
    pub(crate) n_fats: u8,
    pub(crate) n_rootdir: u32,
    pub(crate) fsize: u32,
    pub(crate) n_fatent: u32,
    pub(crate) volbase: u64,
    pub(crate) fatbase: u64,
    /// Root directory: start sector (FAT12/16) or start cluster (FAT32/exFAT).
    pub(crate) dirbase: u64,
    pub(crate) database: u64,
    pub(crate) bitbase: u64,

    pub(crate) last_clust: u32,
    pub(crate) free_clust: u32,
    /// Bit 0: FSInfo dirty. Bit 7: FSInfo disabled for this volume.
    pub(crate) fsi_flag: u8,

    /// Current directory start cluster (0 = root).
    pub(crate) cdir: u32,
    // exFAT: containing-directory info of the current directory.
    pub(crate) cdc_scl: u32,
    pub(crate) cdc_size: u32,
    pub(crate) cdc_ofs: u32,
    /// Normalized current directory path, kept for exFAT `getcwd`.
    pub(crate) cwd: String,

    pub(crate) win: Window,
    /// Long-name scratch (UTF-16, NUL-terminated inside the buffer).
    pub(crate) lfnbuf: Vec<u16>,
    /// exFAT entry-set scratch: 85 + C0 + up to 17 C1 entries.
    pub(crate) dirbuf: Vec<u8>,
    pub(crate) share: ShareTable,
}

impl<D: BlockDevice> FatVolume<D> {
    /// Bind a device. No I/O happens unless `immediate_mount` is set.
    pub fn new(dev: D, opts: MountOptions) -> Result<Self, FsError> {
        let ss = dev.sector_size();
        if !ss.is_power_of_two() || !(512..=4096).contains(&ss) {
            return Err(FsError::InvalidParameter("unsupported sector size"));
        }
        let mut vol = FatVolume {
            dev,
            opts,
            clock: Box::new(SystemTimeSource),
            fs_type: None,
            id: 0,
            ss: ss as u32,
            csize: 0,
            n_fats: 0,
            n_rootdir: 0,
            fsize: 0,
            n_fatent: 0,
            volbase: 0,
            fatbase: 0,
            dirbase: 0,
            database: 0,
            bitbase: 0,
            last_clust: CLUSTER_UNKNOWN,
            free_clust: CLUSTER_UNKNOWN,
            fsi_flag: 0x80,
            cdir: 0,
            cdc_scl: 0,
            cdc_size: 0,
            cdc_ofs: 0,
            cwd: String::from("/"),
            win: Window::new(ss),
            lfnbuf: vec![0u16; MAX_LFN + 1],
            dirbuf: vec![0u8; max_dir_block(MAX_LFN)],
            share: ShareTable::default(),
        };
        if vol.opts.immediate_mount {
            vol.mount()?;
        }
        Ok(vol)
    }

    /// Replace the wall-clock oracle.
    pub fn with_clock(mut self, clock: Box<dyn TimeSource + Send>) -> Self {
        self.clock = clock;
        self
    }

    pub fn fat_type(&self) -> Option<FatType> {
        self.fs_type
    }

    pub fn mount_id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_exfat(&self) -> bool {
        self.fs_type == Some(FatType::ExFat)
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now_packed()
    }

    /// First sector of a data cluster, or 0 for an invalid cluster number.
    pub(crate) fn clust2sect(&self, clst: u32) -> u64 {
        if clst < 2 || clst >= self.n_fatent {
            0
        } else {
            self.database + self.csize as u64 * (clst as u64 - 2)
        }
    }

    pub(crate) fn cluster_bytes(&self) -> u64 {
        self.csize as u64 * self.ss as u64
    }

    /// Verify a handle's mount id against the volume.
    pub(crate) fn validate_obj(&self, obj: &ObjInfo) -> Result<(), FsError> {
        if self.fs_type.is_none() || obj.id != self.id {
            return Err(FsError::InvalidObject);
        }
        Ok(())
    }

    /// Mount on demand; checks media and (for writes) protection.
    pub(crate) fn ensure_mounted(&mut self, write: bool) -> Result<(), FsError> {
        let status = self.dev.status();
        if status.not_ready {
            self.fs_type = None;
            return Err(FsError::NotReady);
        }
        if write && (status.write_protected || self.opts.read_only) {
            return Err(FsError::WriteProtected);
        }
        if self.fs_type.is_some() {
            return Ok(());
        }
        self.mount()
    }

    /// Force a (re)mount: locate a FAT volume on the device, validate its
    /// on-disk structures and initialize the volume object.
    pub fn mount(&mut self) -> Result<(), FsError> {
        self.fs_type = None;
        self.win.invalidate();

        let (kind, bsect) = self.find_volume()?;
        match kind {
            BootSectorKind::Fat => self.init_fat_volume(bsect)?,
            BootSectorKind::ExFat => self.init_exfat_volume(bsect)?,
            _ => return Err(FsError::NoFilesystem),
        }

        self.share.clear();
        self.cdir = 0;
        self.cdc_scl = 0;
        self.cdc_size = 0;
        self.cdc_ofs = 0;
        self.cwd = String::from("/");
        self.id = NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            "mounted {} volume: {} clusters of {} bytes, base sector {}",
            self.fs_type.map(|t| t.name()).unwrap_or("?"),
            self.n_fatent - 2,
            self.cluster_bytes(),
            self.volbase
        );
        Ok(())
    }

    /// Flush everything and return to the unmounted state.
    pub fn unmount(&mut self) -> Result<(), FsError> {
        if self.fs_type.is_some() {
            self.sync_fs()?;
        }
        self.share.clear();
        self.fs_type = None;
        self.win.invalidate();
        Ok(())
    }

    /// Load `sect` and classify it.
    fn check_fs(&mut self, sect: u64) -> Result<BootSectorKind, FsError> {
        self.win.invalidate();
        self.move_window(sect)?;
        Ok(classify_boot_sector(&self.win.buf))
    }

    /// Locate the hosting FAT volume: unpartitioned first, then GPT, then
    /// the four MBR primaries.
    fn find_volume(&mut self) -> Result<(BootSectorKind, u64), FsError> {
        let kind = self.check_fs(0)?;
        if matches!(kind, BootSectorKind::Fat | BootSectorKind::ExFat) {
            return Ok((kind, 0));
        }
        if kind == BootSectorKind::Invalid {
            return Ok((kind, 0));
        }

        // Sector 0 is a valid non-FAT boot sector: look for a partition
        // table. A protective-MBR system id of 0xEE means GPT.
        if self.win.buf[MBR_PTE_SYSTEM] == 0xEE {
            return self.find_gpt_volume();
        }

        let parts = mbr_partition_lbas(&self.win.buf);
        for lba in parts {
            if lba == 0 {
                continue;
            }
            let kind = self.check_fs(lba as u64)?;
            if matches!(kind, BootSectorKind::Fat | BootSectorKind::ExFat) {
                debug!("FAT volume found in MBR partition at sector {lba}");
                return Ok((kind, lba as u64));
            }
        }
        Ok((BootSectorKind::ForeignValid, 0))
    }

    fn find_gpt_volume(&mut self) -> Result<(BootSectorKind, u64), FsError> {
        self.move_window(1)?;
        if !test_gpt_header(&self.win.buf) {
            return Err(FsError::NoFilesystem);
        }
        let n_ent = ld_dword(&self.win.buf[GPTH_PT_NUM..]);
        let pt_lba = ld_qword(&self.win.buf[GPTH_PT_OFS..]);
        let ss = self.ss as usize;
        for i in 0..n_ent as usize {
            self.move_window(pt_lba + (i * SZ_GPTE / ss) as u64)?;
            let ofs = i * SZ_GPTE % ss;
            let entry = &self.win.buf[ofs..ofs + SZ_GPTE];
            if !is_ms_basic_data(entry) {
                continue;
            }
            let first = gpt_entry_first_lba(entry);
            let kind = self.check_fs(first)?;
            if matches!(kind, BootSectorKind::Fat | BootSectorKind::ExFat) {
                debug!("FAT volume found in GPT partition at sector {first}");
                return Ok((kind, first));
            }
        }
        Err(FsError::NoFilesystem)
    }

    /// Validate a FAT12/16/32 VBR (already in the window) and fill in the
    /// volume geometry.
    fn init_fat_volume(&mut self, bsect: u64) -> Result<(), FsError> {
        let bs = &self.win.buf;
        if ld_word(&bs[BPB_BYTS_PER_SEC..]) as u32 != self.ss {
            return Err(FsError::NoFilesystem);
        }

        let mut fasize = ld_word(&bs[BPB_FAT_SZ16..]) as u32;
        if fasize == 0 {
            fasize = ld_dword(&bs[BPB_FAT_SZ32..]);
        }
        let fsize = fasize;

        let n_fats = bs[BPB_NUM_FATS];
        if n_fats != 1 && n_fats != 2 {
            return Err(FsError::NoFilesystem);
        }
        let fat_area = fasize * n_fats as u32;

        let csize = bs[BPB_SEC_PER_CLUS] as u32;
        if csize == 0 || !csize.is_power_of_two() {
            return Err(FsError::NoFilesystem);
        }

        let n_rootdir = ld_word(&bs[BPB_ROOT_ENT_CNT..]) as u32;
        if n_rootdir % (self.ss / SZ_DIRE as u32) != 0 {
            return Err(FsError::NoFilesystem);
        }

        let mut tsect = ld_word(&bs[BPB_TOT_SEC16..]) as u32;
        if tsect == 0 {
            tsect = ld_dword(&bs[BPB_TOT_SEC32..]);
        }

        let nrsv = ld_word(&bs[BPB_RSVD_SEC_CNT..]) as u32;
        if nrsv == 0 {
            return Err(FsError::NoFilesystem);
        }

        let sysect = nrsv + fat_area + n_rootdir / (self.ss / SZ_DIRE as u32);
        if tsect < sysect {
            return Err(FsError::NoFilesystem);
        }
        let nclst = (tsect - sysect) / csize;
        let fmt = classify_by_clusters(nclst).ok_or(FsError::NoFilesystem)?;

        self.n_fatent = nclst + 2;
        self.volbase = bsect;
        self.fatbase = bsect + nrsv as u64;
        self.database = bsect + sysect as u64;
        self.fsize = fsize;
        self.csize = csize;
        self.n_fats = n_fats;
        self.n_rootdir = n_rootdir;

        let needed_fat_bytes = match fmt {
            FatType::Fat32 => {
                if ld_word(&bs[BPB_FS_VER32..]) != 0 || n_rootdir != 0 {
                    return Err(FsError::NoFilesystem);
                }
                self.dirbase = ld_dword(&bs[BPB_ROOT_CLUS32..]) as u64;
                self.n_fatent as u64 * 4
            }
            _ => {
                if n_rootdir == 0 {
                    return Err(FsError::NoFilesystem);
                }
                self.dirbase = self.fatbase + fasize as u64;
                if fmt == FatType::Fat16 {
                    self.n_fatent as u64 * 2
                } else {
                    self.n_fatent as u64 * 3 / 2 + (self.n_fatent & 1) as u64
                }
            }
        };
        if (self.fsize as u64) < (needed_fat_bytes + self.ss as u64 - 1) / self.ss as u64 {
            return Err(FsError::NoFilesystem);
        }

        // FSInfo hints (FAT32 with FSInfo at reserved sector 1 only).
        self.last_clust = CLUSTER_UNKNOWN;
        self.free_clust = CLUSTER_UNKNOWN;
        self.fsi_flag = 0x80;
        if fmt == FatType::Fat32
            && ld_word(&self.win.buf[BPB_FS_INFO32..]) == 1
            && self.move_window(bsect + 1).is_ok()
        {
            self.fsi_flag = 0;
            let w = &self.win.buf;
            if ld_word(&w[BS_55AA..]) == 0xAA55
                && ld_dword(&w[FSI_LEAD_SIG..]) == FSI_LEAD_SIG_VALUE
                && ld_dword(&w[FSI_STRUC_SIG..]) == FSI_STRUC_SIG_VALUE
            {
                self.free_clust = ld_dword(&w[FSI_FREE_COUNT..]);
                self.last_clust = ld_dword(&w[FSI_NXT_FREE..]);
            }
        }

        self.bitbase = 0;
        self.fs_type = Some(fmt);
        Ok(())
    }

    /// Validate an exFAT VBR (already in the window) and fill in the
    /// volume geometry, including the allocation bitmap location.
    fn init_exfat_volume(&mut self, bsect: u64) -> Result<(), FsError> {
        let bs = &self.win.buf;
        if bs[BPB_ZEROED_EX..BPB_ZEROED_EX + 53].iter().any(|&b| b != 0) {
            return Err(FsError::NoFilesystem);
        }
        if ld_word(&bs[BPB_FS_VER_EX..]) != 0x100 {
            return Err(FsError::NoFilesystem);
        }
        if 1u32 << bs[BPB_BYTS_PER_SEC_EX] != self.ss {
            return Err(FsError::NoFilesystem);
        }

        let maxlba = ld_qword(&bs[BPB_TOT_SEC_EX..]) + bsect;
        let fsize = ld_dword(&bs[BPB_FAT_SZ_EX..]);
        let n_fats = bs[BPB_NUM_FATS_EX];
        if n_fats != 1 {
            return Err(FsError::NoFilesystem);
        }
        let cshift = bs[BPB_SEC_PER_CLUS_EX] as u32;
        if cshift > 25 - self.ss.trailing_zeros() {
            return Err(FsError::NoFilesystem);
        }
        let csize = 1u32 << cshift;

        let nclst = ld_dword(&bs[BPB_NUM_CLUS_EX..]);
        if nclst > MAX_EXFAT {
            return Err(FsError::NoFilesystem);
        }

        self.n_fatent = nclst + 2;
        self.volbase = bsect;
        self.database = bsect + ld_dword(&bs[BPB_DATA_OFS_EX..]) as u64;
        self.fatbase = bsect + ld_dword(&bs[BPB_FAT_OFS_EX..]) as u64;
        if maxlba < self.database + nclst as u64 * csize as u64 {
            return Err(FsError::NoFilesystem);
        }
        self.dirbase = ld_dword(&bs[BPB_ROOT_CLUS_EX..]) as u64;
        self.fsize = fsize;
        self.csize = csize;
        self.n_fats = n_fats;
        self.n_rootdir = 0;

        // Find the allocation bitmap entry in the first cluster of the
        // root directory and require the bitmap chain to be contiguous.
        // Stricter than the exFAT specification, but volumes this engine
        // family produces always satisfy it.
        let root_sect = self.database + csize as u64 * (self.dirbase - 2);
        let mut bcl = 0u32;
        let mut found = false;
        'search: for so in 0..csize as u64 {
            self.move_window(root_sect + so)?;
            for i in (0..self.ss as usize).step_by(SZ_DIRE) {
                let t = self.win.buf[i];
                if t == 0 {
                    break 'search;
                }
                if t == ET_BITMAP {
                    bcl = ld_dword(&self.win.buf[i + 20..]);
                    found = true;
                    break 'search;
                }
            }
        }
        if !found || bcl < 2 || bcl >= self.n_fatent {
            return Err(FsError::NoFilesystem);
        }
        self.bitbase = self.database + csize as u64 * (bcl as u64 - 2);
        let mut c = bcl;
        loop {
            self.move_window(self.fatbase + (c as u64 / (self.ss as u64 / 4)))?;
            let cv = ld_dword(&self.win.buf[(c as usize % (self.ss as usize / 4)) * 4..]);
            if cv == 0xFFFF_FFFF {
                break;
            }
            c += 1;
            if cv != c {
                return Err(FsError::NoFilesystem); // fragmented bitmap
            }
        }

        self.last_clust = CLUSTER_UNKNOWN;
        self.free_clust = CLUSTER_UNKNOWN;
        self.fsi_flag = 0x80;
        self.fs_type = Some(FatType::ExFat);
        Ok(())
    }

    /// Flush the window, the FSInfo sector if dirty, then the device.
    pub fn sync_fs(&mut self) -> Result<(), FsError> {
        self.sync_window()?;
        if self.fs_type == Some(FatType::Fat32) && self.fsi_flag == 1 {
            // Build the FSInfo sector through the window so the tag stays
            // coherent with the buffer contents.
            self.win.buf.fill(0);
            st_word(&mut self.win.buf[BS_55AA..], 0xAA55);
            st_dword(&mut self.win.buf[FSI_LEAD_SIG..], FSI_LEAD_SIG_VALUE);
            st_dword(&mut self.win.buf[FSI_STRUC_SIG..], FSI_STRUC_SIG_VALUE);
            st_dword(&mut self.win.buf[FSI_FREE_COUNT..], self.free_clust);
            st_dword(&mut self.win.buf[FSI_NXT_FREE..], self.last_clust);
            self.win.sect = self.volbase + 1;
            self.win.dirty = false;
            self.dev.write(self.volbase + 1, &self.win.buf)?;
            self.fsi_flag = 0;
        }
        self.dev.sync()
    }

    /// Number of free clusters. Served from FSInfo when trustworthy,
    /// otherwise counted from the FAT or the allocation bitmap (and the
    /// hint refreshed).
    pub fn getfree(&mut self) -> Result<u32, FsError> {
        self.ensure_mounted(false)?;
        if self.free_clust <= self.n_fatent - 2 {
            return Ok(self.free_clust);
        }

        let mut nfree = 0u32;
        match self.fs_type {
            Some(FatType::Fat12) => {
                let root = ObjInfo {
                    id: self.id,
                    ..Default::default()
                };
                for clst in 2..self.n_fatent {
                    if self.get_fat(&root, clst)? == 0 {
                        nfree += 1;
                    }
                }
            }
            Some(FatType::Fat16) | Some(FatType::Fat32) => {
                let fat32 = self.fs_type == Some(FatType::Fat32);
                let step = if fat32 { 4 } else { 2 };
                let per_sect = self.ss as usize / step;
                for ent in 2..self.n_fatent as usize {
                    let sect = self.fatbase + (ent / per_sect) as u64;
                    self.move_window(sect)?;
                    let off = ent % per_sect * step;
                    let free = if fat32 {
                        ld_dword(&self.win.buf[off..]) & 0x0FFF_FFFF == 0
                    } else {
                        ld_word(&self.win.buf[off..]) == 0
                    };
                    if free {
                        nfree += 1;
                    }
                }
            }
            Some(FatType::ExFat) => {
                let nbits = self.n_fatent - 2;
                let per_sect = self.ss as u64 * 8;
                for bit in 0..nbits as u64 {
                    let sect = self.bitbase + bit / per_sect;
                    self.move_window(sect)?;
                    let b = self.win.buf[(bit % per_sect) as usize / 8];
                    if b & (1 << (bit % 8)) == 0 {
                        nfree += 1;
                    }
                }
            }
            None => return Err(FsError::NotEnabled),
        }

        self.free_clust = nfree;
        if self.fsi_flag & 0x80 == 0 {
            self.fsi_flag |= 1;
        }
        Ok(nfree)
    }

    /// Geometry and free-space snapshot.
    pub fn statvol(&mut self) -> Result<VolumeStats, FsError> {
        self.ensure_mounted(false)?;
        let free = self.getfree()?;
        Ok(VolumeStats {
            fat_type: self.fs_type.ok_or(FsError::NotEnabled)?,
            sector_size: self.ss,
            cluster_size: self.csize * self.ss,
            total_clusters: self.n_fatent - 2,
            free_clusters: free,
            volume_serial: self.volume_serial()?,
        })
    }

    fn volume_serial(&mut self) -> Result<u32, FsError> {
        self.move_window(self.volbase)?;
        let ofs = match self.fs_type {
            Some(FatType::ExFat) => BPB_VOL_ID_EX,
            Some(FatType::Fat32) => BS_VOL_ID32,
            _ => BS_VOL_ID,
        };
        Ok(ld_dword(&self.win.buf[ofs..]))
    }

    /// Read the volume label; empty string when none is set.
    pub fn getlabel(&mut self) -> Result<String, FsError> {
        self.ensure_mounted(false)?;
        let mut dp = self.root_cursor()?;
        match self.dir_read(&mut dp, true) {
            Ok(()) => {
                let off = (dp.dptr % self.ss) as usize;
                let ent: Vec<u8> = self.win.buf[off..off + SZ_DIRE].to_vec();
                if self.is_exfat() {
                    let n = (ent[1] as usize).min(11);
                    let units: Vec<u16> =
                        (0..n).map(|i| ld_word(&ent[2 + i * 2..])).collect();
                    Ok(String::from_utf16_lossy(&units))
                } else {
                    let mut s: String = ent[..11]
                        .iter()
                        .map(|&b| char::from_u32(upcase::oem_to_unicode(b) as u32).unwrap_or('?'))
                        .collect();
                    while s.ends_with(' ') {
                        s.pop();
                    }
                    Ok(s)
                }
            }
            Err(FsError::NoFile) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Set, replace or (with an empty string) remove the volume label.
    pub fn setlabel(&mut self, label: &str) -> Result<(), FsError> {
        self.ensure_mounted(true)?;

        // Encode and validate the new label.
        let exfat = self.is_exfat();
        let mut dirvn = [0u8; 22];
        let mut len = 0usize;
        if exfat {
            for ch in label.encode_utf16() {
                if len >= 11 || ch < 0x20 {
                    return Err(FsError::InvalidName);
                }
                st_word(&mut dirvn[len * 2..], ch);
                len += 1;
            }
        } else {
            dirvn[..11].fill(b' ');
            for ch in label.chars() {
                let w = upcase::to_upper(u16::try_from(ch as u32).map_err(|_| FsError::InvalidName)?);
                let b = upcase::unicode_to_oem(w).ok_or(FsError::InvalidName)?;
                if len >= 11
                    || b < 0x20
                    || b"\"*+,.:;<=>?[]|\x7f".contains(&b)
                {
                    return Err(FsError::InvalidName);
                }
                dirvn[len] = b;
                len += 1;
            }
            if dirvn[0] == DDEM {
                return Err(FsError::InvalidName);
            }
        }

        let mut dp = self.root_cursor()?;
        match self.dir_read(&mut dp, true) {
            Ok(()) => {
                // An entry exists: rewrite it or mark it removed.
                let off = (dp.dptr % self.ss) as usize;
                if len == 0 {
                    if exfat {
                        self.win.buf[off] &= 0x7F;
                    } else {
                        self.win.buf[off] = DDEM;
                    }
                } else if exfat {
                    self.win.buf[off] = ET_VLABEL;
                    self.win.buf[off + 1] = len as u8;
                    self.win.buf[off + 2..off + 24].copy_from_slice(&dirvn);
                } else {
                    self.win.buf[off..off + 11].copy_from_slice(&dirvn[..11]);
                }
                self.mark_window_dirty();
                self.sync_fs()
            }
            Err(FsError::NoFile) if len > 0 => {
                let mut dp = self.root_cursor()?;
                self.dir_alloc(&mut dp, 1)?;
                let off = (dp.dptr % self.ss) as usize;
                self.win.buf[off..off + SZ_DIRE].fill(0);
                if exfat {
                    self.win.buf[off] = ET_VLABEL;
                    self.win.buf[off + 1] = len as u8;
                    self.win.buf[off + 2..off + 24].copy_from_slice(&dirvn);
                } else {
                    let tm = self.now();
                    self.win.buf[off..off + 11].copy_from_slice(&dirvn[..11]);
                    self.win.buf[off + DIR_ATTR] = AM_VOL;
                    st_dword(&mut self.win.buf[off + DIR_MOD_TIME..], tm);
                }
                self.mark_window_dirty();
                self.sync_fs()
            }
            Err(FsError::NoFile) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
