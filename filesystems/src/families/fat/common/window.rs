// Single-sector disk access window, the write-back staging buffer for all
// FAT, directory and FSInfo traffic on a volume.

use log::warn;
use silt_core::{BlockDevice, FsError};

use crate::families::fat::volume::FatVolume;

/// Tag meaning "window holds nothing".
pub(crate) const INVALID_SECTOR: u64 = u64::MAX;

/// The window itself: one sector of data, its LBA, and a dirty bit.
///
/// Invariant: when `dirty` is false and `sect != INVALID_SECTOR`, `buf`
/// equals the on-disk contents of `sect`.
#[derive(Debug)]
pub(crate) struct Window {
    pub buf: Vec<u8>,
    pub sect: u64,
    pub dirty: bool,
}

impl Window {
    pub fn new(sector_size: usize) -> Self {
        Window {
            buf: vec![0u8; sector_size],
            sect: INVALID_SECTOR,
            dirty: false,
        }
    }

    pub fn invalidate(&mut self) {
        self.sect = INVALID_SECTOR;
        self.dirty = false;
    }
}

impl<D: BlockDevice> FatVolume<D> {
    /// Flush the window if it is dirty, duplicating FAT-area sectors into
    /// the second FAT copy when one exists.
    pub(crate) fn sync_window(&mut self) -> Result<(), FsError> {
        if !self.win.dirty {
            return Ok(());
        }
        if self.win.sect == INVALID_SECTOR {
            return Err(FsError::Internal("dirty window with no sector tag"));
        }
        self.dev.write(self.win.sect, &self.win.buf)?;
        self.win.dirty = false;
        if self.n_fats == 2
            && self.win.sect >= self.fatbase
            && self.win.sect < self.fatbase + self.fsize as u64
        {
            // Mirror into FAT 2. A failed mirror write leaves FAT 1
            // authoritative, so it is reported but not fatal.
            let mirror = self.win.sect + self.fsize as u64;
            if let Err(e) = self.dev.write(mirror, &self.win.buf) {
                warn!("FAT mirror write failed at sector {mirror}: {e}");
            }
        }
        Ok(())
    }

    /// Make the window hold `sect`, flushing any dirty contents first.
    /// On a read failure the window is invalidated so the next access
    /// retries the load.
    pub(crate) fn move_window(&mut self, sect: u64) -> Result<(), FsError> {
        if sect == self.win.sect {
            return Ok(());
        }
        self.sync_window()?;
        // Split borrows: the device and the window are disjoint fields.
        let Self { dev, win, .. } = self;
        match dev.read(sect, &mut win.buf) {
            Ok(()) => {
                win.sect = sect;
                Ok(())
            }
            Err(e) => {
                win.invalidate();
                Err(e)
            }
        }
    }

    /// Mark the current window contents modified.
    pub(crate) fn mark_window_dirty(&mut self) {
        self.win.dirty = true;
    }
}
