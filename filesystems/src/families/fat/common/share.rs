// Open-object share table: at most one writer or many readers per
// directory entry, enforced within the owning volume.

use silt_core::FsError;

use crate::families::fat::SHARE_SLOTS;

/// Desired access when checking or registering an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareAccess {
    Read,
    Write,
    /// Delete or rename: requires the object to have no opens at all.
    Delete,
}

/// One exclusive writer.
const CTR_WRITER: u32 = 0x100;

#[derive(Debug, Clone, Copy, Default)]
struct ShareSlot {
    used: bool,
    /// Start cluster of the containing directory (0 for the FAT root).
    clu: u32,
    /// Byte offset of the entry in the directory table.
    ofs: u32,
    /// 0 free, 1..N readers, `CTR_WRITER` one writer.
    ctr: u32,
}

/// Fixed-size table of open-object locks, one per volume.
#[derive(Debug)]
pub struct ShareTable {
    slots: [ShareSlot; SHARE_SLOTS],
}

impl Default for ShareTable {
    fn default() -> Self {
        ShareTable {
            slots: [ShareSlot::default(); SHARE_SLOTS],
        }
    }
}

impl ShareTable {
    fn find(&self, clu: u32, ofs: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.used && s.clu == clu && s.ofs == ofs)
    }

    /// Whether a new object could still be registered.
    pub(crate) fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| !s.used)
    }

    /// Check whether `(clu, ofs)` may be opened with the given access.
    pub fn check(&self, clu: u32, ofs: u32, acc: ShareAccess) -> Result<(), FsError> {
        match self.find(clu, ofs) {
            None => {
                if !self.has_free_slot() && acc != ShareAccess::Delete {
                    Err(FsError::TooManyOpenFiles)
                } else {
                    Ok(())
                }
            }
            Some(i) => {
                // Opened already: reject writers outright and any access
                // when a writer holds it.
                if acc != ShareAccess::Read || self.slots[i].ctr == CTR_WRITER {
                    Err(FsError::Locked)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Register an open and return its 1-based slot id.
    pub fn register(&mut self, clu: u32, ofs: u32, acc: ShareAccess) -> Result<u32, FsError> {
        let i = match self.find(clu, ofs) {
            Some(i) => i,
            None => {
                let i = self
                    .slots
                    .iter()
                    .position(|s| !s.used)
                    .ok_or(FsError::TooManyOpenFiles)?;
                self.slots[i] = ShareSlot {
                    used: true,
                    clu,
                    ofs,
                    ctr: 0,
                };
                i
            }
        };
        if acc != ShareAccess::Read && self.slots[i].ctr != 0 {
            return Err(FsError::Internal("share violation on register"));
        }
        self.slots[i].ctr = if acc == ShareAccess::Read {
            self.slots[i].ctr + 1
        } else {
            CTR_WRITER
        };
        Ok(i as u32 + 1)
    }

    /// Release a previously registered open.
    pub fn release(&mut self, id: u32) -> Result<(), FsError> {
        let i = id.wrapping_sub(1) as usize;
        if i >= SHARE_SLOTS || !self.slots[i].used {
            return Err(FsError::Internal("bad share slot id"));
        }
        let mut n = self.slots[i].ctr;
        if n == CTR_WRITER {
            n = 0;
        }
        if n > 0 {
            n -= 1;
        }
        self.slots[i].ctr = n;
        if n == 0 {
            self.slots[i].used = false;
        }
        Ok(())
    }

    /// Rebase a registered entry after its directory entry moved.
    pub fn relocate(&mut self, id: u32, clu: u32, ofs: u32) {
        let i = id.wrapping_sub(1) as usize;
        if i < SHARE_SLOTS && self.slots[i].used {
            self.slots[i].clu = clu;
            self.slots[i].ofs = ofs;
        }
    }

    /// Drop every entry; used at unmount and volume reset.
    pub fn clear(&mut self) {
        self.slots = [ShareSlot::default(); SHARE_SLOTS];
    }
}
