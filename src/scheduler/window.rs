//! Delivery-window resolution: local wall-clock hours to UTC instants.
//!
//! Each window endpoint converts independently through the subscriber's
//! timezone, so a window spanning a daylight-saving transition lands on the
//! true local wall clock rather than a fixed UTC offset.

use crate::error::{DripfeedError, Result};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Resolve a subscriber's local delivery window on a given day to UTC.
///
/// `start_hour` is inclusive, `end_hour` exclusive; `end_hour` may be 24
/// (local midnight of the following day). Fails with `UnknownTimezone` for
/// an unrecognized name and `InvalidWindow` when the window is empty.
pub fn resolve_window(
    timezone: &str,
    start_hour: u8,
    end_hour: u8,
    day: NaiveDate,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if start_hour >= end_hour || end_hour > 24 {
        return Err(DripfeedError::InvalidWindow {
            start: start_hour,
            end: end_hour,
        });
    }

    let tz: Tz = timezone
        .parse()
        .map_err(|_| DripfeedError::UnknownTimezone(timezone.to_string()))?;

    let start = resolve_local_hour(tz, day, start_hour)?;
    let end = resolve_local_hour(tz, day, end_hour)?;
    Ok((start, end))
}

/// Convert one local hour on `day` to a UTC instant.
///
/// DST edges: a wall time skipped by spring-forward rolls ahead one hour;
/// an ambiguous fall-back time takes the earlier offset.
fn resolve_local_hour(tz: Tz, day: NaiveDate, hour: u8) -> Result<DateTime<Utc>> {
    let naive = local_naive(day, hour)?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(earlier, _) => Ok(earlier.with_timezone(&Utc)),
                LocalResult::None => Err(DripfeedError::Scheduling(format!(
                    "unresolvable local time {naive} in {tz}"
                ))),
            }
        }
    }
}

fn local_naive(day: NaiveDate, hour: u8) -> Result<NaiveDateTime> {
    if hour == 24 {
        let next = day
            .succ_opt()
            .ok_or_else(|| DripfeedError::Scheduling(format!("day out of range: {day}")))?;
        return local_naive(next, 0);
    }

    day.and_hms_opt(hour as u32, 0, 0)
        .ok_or_else(|| DripfeedError::Scheduling(format!("invalid hour {hour} on {day}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        date(y, m, d).and_hms_opt(h, 0, 0).unwrap().and_utc()
    }

    #[test]
    fn test_standard_time_conversion() {
        // New York in winter is UTC-5: 12:00 local = 17:00 UTC
        let (start, end) =
            resolve_window("America/New_York", 12, 17, date(2024, 3, 3)).unwrap();
        assert_eq!(start, utc(2024, 3, 3, 17));
        assert_eq!(end, utc(2024, 3, 3, 22));
    }

    #[test]
    fn test_dst_date_shifts_window_by_one_hour() {
        // 2024-03-10 is the US spring-forward date; afternoon is already EDT
        let (winter_start, _) =
            resolve_window("America/New_York", 12, 17, date(2024, 3, 3)).unwrap();
        let (dst_start, dst_end) =
            resolve_window("America/New_York", 12, 17, date(2024, 3, 10)).unwrap();

        assert_eq!(dst_start, utc(2024, 3, 10, 16));
        assert_eq!(dst_end, utc(2024, 3, 10, 21));
        assert_eq!(
            winter_start.time().hour() as i64 - dst_start.time().hour() as i64,
            1
        );
    }

    #[test]
    fn test_spring_forward_gap_rolls_ahead() {
        // 02:00 local does not exist on 2024-03-10 in New York; it becomes
        // 03:00 EDT = 07:00 UTC
        let (start, end) = resolve_window("America/New_York", 2, 3, date(2024, 3, 10)).unwrap();
        assert_eq!(start, utc(2024, 3, 10, 7));
        assert_eq!(end, utc(2024, 3, 10, 7));
    }

    #[test]
    fn test_fall_back_takes_earlier_offset() {
        // 01:00 local occurs twice on 2024-11-03 in New York; the earlier
        // instant is still EDT (UTC-4)
        let (start, _) = resolve_window("America/New_York", 1, 3, date(2024, 11, 3)).unwrap();
        assert_eq!(start, utc(2024, 11, 3, 5));
    }

    #[test]
    fn test_end_hour_24_is_next_local_midnight() {
        let (_, end) = resolve_window("America/New_York", 20, 24, date(2024, 3, 3)).unwrap();
        // Midnight EST on 2024-03-04 = 05:00 UTC
        assert_eq!(end, utc(2024, 3, 4, 5));
    }

    #[test]
    fn test_unknown_timezone() {
        let result = resolve_window("Mars/Olympus_Mons", 12, 17, date(2024, 3, 3));
        assert!(matches!(result, Err(DripfeedError::UnknownTimezone(_))));
    }

    #[test]
    fn test_invalid_window() {
        let result = resolve_window("America/New_York", 17, 12, date(2024, 3, 3));
        assert!(matches!(result, Err(DripfeedError::InvalidWindow { .. })));

        let result = resolve_window("America/New_York", 12, 12, date(2024, 3, 3));
        assert!(matches!(result, Err(DripfeedError::InvalidWindow { .. })));

        let result = resolve_window("America/New_York", 12, 25, date(2024, 3, 3));
        assert!(matches!(result, Err(DripfeedError::InvalidWindow { .. })));
    }

    #[test]
    fn test_utc_window_is_identity() {
        let (start, end) = resolve_window("UTC", 9, 10, date(2024, 6, 1)).unwrap();
        assert_eq!(start, utc(2024, 6, 1, 9));
        assert_eq!(end, utc(2024, 6, 1, 10));
    }
}
