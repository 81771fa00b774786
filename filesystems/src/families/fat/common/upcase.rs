// Unicode up-case conversion for case-insensitive name matching, and the
// OEM code page mapping used when squeezing long names into 8.3 form.
// Covers the Basic Multilingual Plane; names outside the BMP are rejected
// by the name codec before they reach this table.

/// Map a UTF-16 code unit to its uppercase equivalent.
pub fn to_upper(ch: u16) -> u16 {
    match ch {
        // ASCII
        0x0061..=0x007A => ch - 0x20,

        // Latin-1 Supplement (0xF7 is the division sign, 0xFF has no
        // uppercase form in Latin-1)
        0x00E0..=0x00F6 | 0x00F8..=0x00FE => ch - 0x20,

        // Latin Extended-A: alternating pairs
        0x0100..=0x012F | 0x0132..=0x0137 | 0x014A..=0x0177 => {
            if ch % 2 == 1 {
                ch - 1
            } else {
                ch
            }
        }
        0x0139..=0x0148 => {
            if ch % 2 == 0 {
                ch - 1
            } else {
                ch
            }
        }
        0x017A | 0x017C | 0x017E => ch - 1,
        0x017F => 0x0053, // long s

        // Greek
        0x03AC => 0x0386,
        0x03AD..=0x03AF => ch - 0x25,
        0x03B1..=0x03C1 => ch - 0x20,
        0x03C2 => 0x03A3, // final sigma
        0x03C3..=0x03CB => ch - 0x20,
        0x03CC => 0x038C,
        0x03CD | 0x03CE => ch - 0x3F,

        // Cyrillic
        0x0430..=0x044F => ch - 0x20,
        0x0450..=0x045F => ch - 0x50,
        0x0460..=0x0481 | 0x048A..=0x04BF => {
            if ch % 2 == 1 {
                ch - 1
            } else {
                ch
            }
        }

        // Fullwidth Latin
        0xFF41..=0xFF5A => ch - 0x20,

        _ => ch,
    }
}

/// Case-fold two UTF-16 strings for equality.
pub fn eq_fold(a: &[u16], b: &[u16]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| to_upper(*x) == to_upper(*y))
}

/// Unicode → OEM (code page 1252) for SFN synthesis.
///
/// Returns `None` when the code point is not representable, which forces
/// the caller to go lossy and rely on the LFN.
pub fn unicode_to_oem(ch: u16) -> Option<u8> {
    match ch {
        0x0000..=0x007F => Some(ch as u8),
        0x00A0..=0x00FF => Some(ch as u8),
        0x20AC => Some(0x80), // euro sign
        0x0160 => Some(0x8A),
        0x017D => Some(0x8E),
        0x0152 => Some(0x8C),
        _ => None,
    }
}

/// OEM (code page 1252) → Unicode, for decoding stored 8.3 names.
pub fn oem_to_unicode(b: u8) -> u16 {
    match b {
        0x80 => 0x20AC,
        0x8A => 0x0160,
        0x8C => 0x0152,
        0x8E => 0x017D,
        _ => b as u16,
    }
}
