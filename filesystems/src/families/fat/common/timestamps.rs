// Timestamp handling for the FAT family.
// FAT packs date and time into 16-bit fields; the engine moves them around
// as one 32-bit word (date in the high half) the way the on-disk ModTime
// fields of FAT32 and exFAT are laid out.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock oracle consumed by the engine.
///
/// Returns the packed FAT timestamp: bits [31:25] year-1980, [24:21] month,
/// [20:16] day, [15:11] hour, [10:5] minute, [4:0] seconds/2.
pub trait TimeSource {
    fn now_packed(&self) -> u32;
}

/// Default `TimeSource` backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_packed(&self) -> u32 {
        let (date, time) = get_current_fat_datetime();
        ((date as u32) << 16) | time as u32
    }
}

/// Convert FAT date/time to a Unix timestamp.
/// FAT date: bits 15-9: year (0=1980), bits 8-5: month, bits 4-0: day.
/// FAT time: bits 15-11: hours, bits 10-5: minutes, bits 4-0: seconds/2.
pub fn fat_datetime_to_unix(date: u16, time: u16) -> u64 {
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;

    let hour = ((time >> 11) & 0x1F) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;

    if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
        if let Some(dt) = d.and_hms_opt(hour, minute, second) {
            return dt.and_utc().timestamp() as u64;
        }
    }
    0 // invalid on-disk timestamp
}

/// Convert a Unix timestamp to FAT date/time.
pub fn unix_to_fat_datetime(timestamp: u64) -> (u16, u16) {
    let datetime = DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(timestamp));

    // Clamp year to the FAT range (1980-2107).
    let fat_year = if datetime.year() < 1980 {
        0
    } else if datetime.year() > 2107 {
        127
    } else {
        (datetime.year() - 1980) as u16
    };

    let fat_date = (fat_year << 9) | ((datetime.month() as u16) << 5) | datetime.day() as u16;
    let fat_time = ((datetime.hour() as u16) << 11)
        | ((datetime.minute() as u16) << 5)
        | (datetime.second() / 2) as u16;

    (fat_date, fat_time)
}

/// Current FAT date/time from the system clock.
pub fn get_current_fat_datetime() -> (u16, u16) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => unix_to_fat_datetime(duration.as_secs()),
        Err(_) => (0x21, 0), // 1980-01-01, clock before epoch
    }
}

/// Split a packed timestamp into (date, time) halves.
pub fn split_packed(packed: u32) -> (u16, u16) {
    ((packed >> 16) as u16, packed as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat_datetime_round_trip() {
        // 2024-01-15 14:30:00
        let (date, time) = unix_to_fat_datetime(1705329000);
        assert_eq!(fat_datetime_to_unix(date, time), 1705329000);
    }

    #[test]
    fn seconds_resolution_is_two() {
        let (d0, t0) = unix_to_fat_datetime(1705329001);
        let (d1, t1) = unix_to_fat_datetime(1705329000);
        assert_eq!((d0, t0), (d1, t1));
    }

    #[test]
    fn year_clamps_to_fat_range() {
        let (date, _) = unix_to_fat_datetime(0); // 1970
        assert_eq!(date >> 9, 0);
    }

    #[test]
    fn packed_layout() {
        let src = SystemTimeSource;
        let packed = src.now_packed();
        let (date, time) = split_packed(packed);
        // Month 1..=12, day 1..=31, hour < 24.
        let month = (date >> 5) & 0x0F;
        assert!((1..=12).contains(&month));
        assert!((time >> 11) < 24);
    }
}
