// Name handling: path segment parsing into a long name plus a synthesized
// 8.3 short name, numbered-name generation for collisions, LFN slot
// packing, and the checksums/hashes used by both FAT and exFAT matching.

use silt_core::{BlockDevice, FsError};

use crate::families::fat::common::upcase;
use crate::families::fat::directory::DirCursor;
use crate::families::fat::volume::FatVolume;
use crate::families::fat::{
    ld_word, st_word, AM_LFN, DDEM, LDIR_ATTR, LDIR_CHKSUM, LDIR_FST_CLUS_LO, LDIR_ORD, LDIR_TYPE,
    LLEF, MAX_LFN, NS_BODY_LOWER, NS_EXT_LOWER, RDDEM, XDIR_NUM_SEC, XDIR_SET_SUM,
};

// Flags kept in byte 11 of the cursor's SFN buffer, describing how the
// parsed segment relates to its 8.3 rendition.
/// 8.3 form lost information; a numbered name is required.
pub(crate) const NS_LOSS: u8 = 0x01;
/// LFN entries must be created for this name.
pub(crate) const NS_LFN: u8 = 0x02;
/// This was the last segment of the path.
pub(crate) const NS_LAST: u8 = 0x04;
// Bits 0x08 and 0x10 record all-lower-case body/extension; they are the
// NTRes flag values themselves (`NS_BODY_LOWER`/`NS_EXT_LOWER`).
/// Dot entry ("." or "..").
pub(crate) const NS_DOT: u8 = 0x20;
/// Match short names only (numbered-name collision probe).
pub(crate) const NS_NOLFN: u8 = 0x40;
/// Null path: the anchor directory itself.
pub(crate) const NS_NONAME: u8 = 0x80;

/// Offsets of the 13 UTF-16 units inside an LFN slot.
const LFN_OFS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Rotate-right-with-carry checksum over the 11 SFN bytes, stored in every
/// LFN slot of the set.
pub(crate) fn sum_sfn(sfn: &[u8]) -> u8 {
    sfn[..11]
        .iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// 16-bit rotate-add checksum of a whole exFAT entry block, skipping the
/// checksum field itself.
pub(crate) fn xdir_sum(dirb: &[u8]) -> u16 {
    let szblk = (dirb[XDIR_NUM_SEC] as usize + 1) * 32;
    let mut sum = 0u16;
    let mut i = 0;
    while i < szblk {
        if i == XDIR_SET_SUM {
            i += 2;
            continue;
        }
        sum = (if sum & 1 != 0 { 0x8000u16 } else { 0u16 })
            .wrapping_add(sum >> 1)
            .wrapping_add(dirb[i] as u16);
        i += 1;
    }
    sum
}

/// 16-bit rotate-add hash of an up-cased UTF-16 name (exFAT NameHash).
pub(crate) fn xname_sum(name: &[u16]) -> u16 {
    let mut sum = 0u16;
    for &u in name {
        if u == 0 {
            break;
        }
        let c = upcase::to_upper(u);
        for b in [c as u8, (c >> 8) as u8] {
            sum = (if sum & 1 != 0 { 0x8000u16 } else { 0u16 })
                .wrapping_add(sum >> 1)
                .wrapping_add(b as u16);
        }
    }
    sum
}

/// Build a numbered 8.3 name (`~N` tail). Past five collisions the
/// sequence number is replaced by a hash of the long name so the search
/// does not degenerate.
pub(crate) fn gen_numname(dst: &mut [u8; 12], src: &[u8; 12], lfn: &[u16], seq: u32) {
    *dst = *src;

    let mut seq = seq as u16;
    if seq > 5 {
        let mut h = seq;
        for &c in lfn {
            if c == 0 {
                break;
            }
            h = (h >> 1).wrapping_add(h << 15).wrapping_add(c);
        }
        seq = h;
    }

    // Build the "~" + hex suffix right-aligned in ns.
    let mut ns = [0u8; 8];
    let mut i = 8usize;
    let mut s = seq;
    loop {
        i -= 1;
        let mut c = (s % 16) as u8 + b'0';
        if c > b'9' {
            c += 7;
        }
        ns[i] = c;
        s /= 16;
        if s == 0 || i == 1 {
            break;
        }
    }
    i -= 1;
    ns[i] = b'~';

    // Append the suffix after the body characters.
    let mut j = 0usize;
    while j < i && dst[j] != b' ' {
        j += 1;
    }
    let mut k = i;
    while j < 8 {
        dst[j] = if k < 8 {
            let c = ns[k];
            k += 1;
            c
        } else {
            b' '
        };
        j += 1;
    }
}

/// Compare one LFN slot against the expected name. `true` when the 13
/// units at this slot's position match (case-folded).
pub(crate) fn cmp_lfn(lfn: &[u16], ent: &[u8]) -> bool {
    if ld_word(&ent[LDIR_FST_CLUS_LO..]) != 0 {
        return false;
    }
    let mut i = ((ent[LDIR_ORD] & 0x3F) as usize).wrapping_sub(1) * 13;
    let mut wc = 1u16;
    for s in 0..13 {
        let uc = ld_word(&ent[LFN_OFS[s]..]);
        if wc != 0 {
            if i >= MAX_LFN + 1 || upcase::to_upper(uc) != upcase::to_upper(lfn[i]) {
                return false;
            }
            i += 1;
            wc = uc;
        } else if uc != 0xFFFF {
            return false; // filler must be 0xFFFF
        }
    }
    if ent[LDIR_ORD] & LLEF != 0 && wc != 0 && lfn.get(i).copied().unwrap_or(0) != 0 {
        return false; // last slot matched but the name is longer
    }
    true
}

/// Extract one LFN slot's 13 units into the name buffer. `false` on a
/// malformed slot or overflow.
pub(crate) fn pick_lfn(lfn: &mut [u16], ent: &[u8]) -> bool {
    let ord = (ent[LDIR_ORD] & 0x3F) as usize;
    if ord == 0 {
        return false;
    }
    let mut i = (ord - 1) * 13;
    let mut wc = 1u16;
    for s in 0..13 {
        let uc = ld_word(&ent[LFN_OFS[s]..]);
        if wc != 0 {
            if i >= MAX_LFN {
                return false;
            }
            lfn[i] = uc;
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    if ent[LDIR_ORD] & LLEF != 0 {
        if i >= MAX_LFN + 1 {
            return false;
        }
        if wc != 0 {
            lfn[i] = 0;
        }
    }
    true
}

/// Fill one LFN slot with 13 units of the name, padding with one NUL then
/// 0xFFFF, and set the ordinal/last flag.
pub(crate) fn put_lfn(lfn: &[u16], ent: &mut [u8], ord: u8, sum: u8) {
    ent[LDIR_CHKSUM] = sum;
    ent[LDIR_ATTR] = AM_LFN;
    ent[LDIR_TYPE] = 0;
    st_word(&mut ent[LDIR_FST_CLUS_LO..], 0);

    let mut i = (ord as usize - 1) * 13;
    let mut wc = 0u16;
    let mut s = 0;
    loop {
        if wc != 0xFFFF {
            wc = lfn[i];
            i += 1;
        }
        st_word(&mut ent[LFN_OFS[s]..], wc);
        if wc == 0 {
            wc = 0xFFFF;
        }
        s += 1;
        if s >= 13 {
            break;
        }
    }
    let mut ord = ord;
    if wc == 0xFFFF || lfn[i] == 0 {
        ord |= LLEF;
    }
    ent[LDIR_ORD] = ord;
}

impl<D: BlockDevice> FatVolume<D> {
    /// Parse the next path segment into the volume's LFN buffer and the
    /// cursor's 8.3 rendition, and advance `path` past the segment.
    pub(crate) fn create_name(&mut self, dp: &mut DirCursor, path: &mut &str) -> Result<(), FsError> {
        let p: &str = path.trim_start_matches(['/', '\\']);

        // Long name in UTF-16 (BMP only).
        let mut di = 0usize;
        let mut term_sep = false;
        let mut next_idx = p.len();
        for (i, ch) in p.char_indices() {
            if ch == '/' || ch == '\\' {
                term_sep = true;
                next_idx = i + 1;
                break;
            }
            let w = ch as u32;
            if w < 0x20 || w > 0xFFFF {
                return Err(FsError::InvalidName);
            }
            if w < 0x80 && "\"*:<>?|\u{7f}".contains(ch) {
                return Err(FsError::InvalidName);
            }
            if di >= MAX_LFN {
                return Err(FsError::InvalidName);
            }
            self.lfnbuf[di] = w as u16;
            di += 1;
        }
        *path = &p[next_idx..];
        let mut cf: u8 = if term_sep { 0 } else { NS_LAST };

        // Dot entries stay dot entries.
        if di > 0 && di <= 2 && self.lfnbuf[..di].iter().all(|&w| w == b'.' as u16) {
            self.lfnbuf[di] = 0;
            for i in 0..11 {
                dp.sfn[i] = if i < di { b'.' } else { b' ' };
            }
            dp.sfn[11] = cf | NS_DOT;
            return Ok(());
        }

        // Snip trailing spaces and dots.
        while di > 0 {
            let w = self.lfnbuf[di - 1];
            if w != b' ' as u16 && w != b'.' as u16 {
                break;
            }
            di -= 1;
        }
        if di == 0 {
            return Err(FsError::InvalidName);
        }
        self.lfnbuf[di] = 0;

        // Synthesize the SFN.
        dp.sfn = [b' '; 12];
        dp.sfn[11] = 0;
        let mut si = 0usize;
        while self.lfnbuf[si] == b' ' as u16 {
            si += 1;
        }
        if si > 0 || self.lfnbuf[si] == b'.' as u16 {
            cf |= NS_LOSS | NS_LFN;
        }
        // Position just after the last dot; 0 when there is no extension.
        let mut ext_pos = di;
        while ext_pos > 0 && self.lfnbuf[ext_pos - 1] != b'.' as u16 {
            ext_pos -= 1;
        }

        let mut i = 0usize;
        let mut ni = 8usize;
        let mut b: u8 = 0;
        loop {
            let mut w = self.lfnbuf[si] as u32;
            if w == 0 {
                break;
            }
            si += 1;
            if w == 0x20 || (w == b'.' as u32 && si != ext_pos) {
                // Embedded spaces and dots vanish from the SFN.
                cf |= NS_LOSS | NS_LFN;
                continue;
            }

            if i >= ni || si == ext_pos {
                // End of the body or extension field.
                if ni == 11 {
                    cf |= NS_LOSS | NS_LFN;
                    break;
                }
                if si != ext_pos {
                    cf |= NS_LOSS | NS_LFN;
                }
                if si > ext_pos {
                    break; // no extension at all
                }
                si = ext_pos;
                i = 8;
                ni = 11;
                b <<= 2;
                continue;
            }

            if w >= 0x80 {
                // Extended character: LFN is mandatory, SFN gets the
                // up-cased OEM rendition or goes lossy.
                cf |= NS_LFN;
                w = match upcase::unicode_to_oem(upcase::to_upper(w as u16)) {
                    Some(oem) => oem as u32,
                    None => 0,
                };
            }

            if w == 0 || b"+,;=[]".contains(&(w as u8)) {
                w = b'_' as u32;
                cf |= NS_LOSS | NS_LFN;
            } else if (w as u8).is_ascii_uppercase() {
                b |= 2;
            } else if (w as u8).is_ascii_lowercase() {
                b |= 1;
                w -= 0x20;
            }
            dp.sfn[i] = w as u8;
            i += 1;
        }

        if dp.sfn[0] == DDEM {
            dp.sfn[0] = RDDEM;
        }
        if ni == 8 {
            b <<= 2;
        }
        if b & 0x0C == 0x0C || b & 0x03 == 0x03 {
            // Mixed case in one field cannot be recorded in NT flags.
            cf |= NS_LFN;
        }
        if cf & NS_LFN == 0 {
            if b & 0x01 != 0 {
                cf |= NS_EXT_LOWER;
            }
            if b & 0x04 != 0 {
                cf |= NS_BODY_LOWER;
            }
        }

        dp.sfn[11] = cf;
        Ok(())
    }

    /// Length of the parsed long name in the scratch buffer.
    pub(crate) fn lfn_len(&self) -> usize {
        self.lfnbuf.iter().position(|&w| w == 0).unwrap_or(MAX_LFN)
    }
}
