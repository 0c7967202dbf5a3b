//! Conversion between calendar time and the FAT packed date/time word.
//!
//! The high half of the word holds the date as (years since 1980, month,
//! day) in 7/4/5 bit fields; the low half holds the time of day as
//! (hour, minute, seconds / 2) in 5/6/5 bit fields. All conversions are UTC,
//! there is no timezone or daylight saving adjustment.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Timelike, Utc};

/// Seconds since the Unix epoch, the scalar exchanged through `stat` and `utime`.
pub type UnixTime = i64;

/// First year representable in the packed date.
pub const FAT_EPOCH_YEAR: i32 = 1980;

/// Last year representable in the packed date.
pub const FAT_MAX_YEAR: i32 = FAT_EPOCH_YEAR + 0x7F;

/// Packs a calendar time into the engine's date/time word.
///
/// Years outside [`FAT_EPOCH_YEAR`]..=[`FAT_MAX_YEAR`] are not rejected; the
/// year field is truncated and aliases. Odd seconds are rounded down.
pub fn to_packed(time: UnixTime) -> u32 {
    let dt = DateTime::<Utc>::from_timestamp(time, 0).unwrap_or_default();

    let fdate: u16 = (((dt.year() - FAT_EPOCH_YEAR) as u16) << 9)
        | ((dt.month() as u16) << 5)
        | (dt.day() as u16);
    let ftime: u16 =
        ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | ((dt.second() / 2) as u16);

    join(fdate, ftime)
}

/// Unpacks a date/time word into seconds since the Unix epoch.
///
/// Field values the calendar cannot hold (month 0, day 0, 60 seconds...)
/// roll over into the neighbouring unit instead of failing.
pub fn from_packed(packed: u32) -> UnixTime {
    let (fdate, ftime) = split(packed);

    let year = ((fdate >> 9) & 0x7F) as i32 + FAT_EPOCH_YEAR;
    let month = ((fdate >> 5) & 0x0F) as u32;
    let day = (fdate & 0x1F) as i64;

    let hour = ((ftime >> 11) & 0x1F) as i64;
    let minute = ((ftime >> 5) & 0x3F) as i64;
    let second = ((ftime & 0x1F) * 2) as i64;

    normalized(year, month, day, hour, minute, second).unwrap_or(0)
}

fn normalized(
    year: i32,
    month: u32,
    day: i64,
    hour: i64,
    minute: i64,
    second: i64,
) -> Option<UnixTime> {
    let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let first_of_month = if month == 0 {
        jan1.checked_sub_months(Months::new(1))?
    } else {
        jan1.checked_add_months(Months::new(month - 1))?
    };
    let midnight = first_of_month.and_hms_opt(0, 0, 0)?.and_utc();

    let dt = midnight
        + Duration::days(day - 1)
        + Duration::hours(hour)
        + Duration::minutes(minute)
        + Duration::seconds(second);
    Some(dt.timestamp())
}

/// Splits a packed word into its (date, time) halves.
pub fn split(packed: u32) -> (u16, u16) {
    ((packed >> 16) as u16, packed as u16)
}

/// Joins (date, time) halves into a packed word.
pub fn join(fdate: u16, ftime: u16) -> u32 {
    ((fdate as u32) << 16) | ftime as u32
}

/// Current UTC time in packed form; engines stamp new and modified entries with it.
pub fn fat_time_now() -> u32 {
    to_packed(Utc::now().timestamp())
}
