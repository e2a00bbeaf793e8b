//! Pure helper functions backing the VM's marshal dispatch (§4.E): time
//! rounding/extraction and segment bitmap algebra. Kept free of VM state so
//! they can be unit-tested directly.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::index::IndexBits;
use crate::query::opcode::Marshal;

fn to_datetime(epoch_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap())
}

/// `date_second` … `date_year`: truncate a timestamp to the start of the
/// named period, per the marshal list in §4.D.
pub fn date_round(marshal: Marshal, epoch_ms: i64) -> i64 {
    let dt = to_datetime(epoch_ms);
    let naive = match marshal {
        Marshal::DateSecond => dt.date_naive().and_hms_opt(dt.hour(), dt.minute(), dt.second()),
        Marshal::DateMinute => dt.date_naive().and_hms_opt(dt.hour(), dt.minute(), 0),
        Marshal::DateHour => dt.date_naive().and_hms_opt(dt.hour(), 0, 0),
        Marshal::DateDay => dt.date_naive().and_hms_opt(0, 0, 0),
        Marshal::DateWeek => {
            let days_from_monday = dt.weekday().num_days_from_monday() as i64;
            (dt.date_naive() - chrono::Duration::days(days_from_monday)).and_hms_opt(0, 0, 0)
        }
        Marshal::DateMonth => NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
        Marshal::DateYear => {
            NaiveDate::from_ymd_opt(dt.year(), 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
        }
        other => unreachable!("{other:?} is not a date-rounding marshal"),
    };
    naive.map(|n| Utc.from_utc_datetime(&n).timestamp_millis()).unwrap_or(epoch_ms)
}

/// `get_second` … `get_year`: extract one calendar field.
pub fn get_part(marshal: Marshal, epoch_ms: i64) -> i64 {
    let dt = to_datetime(epoch_ms);
    match marshal {
        Marshal::GetSecond => dt.second() as i64,
        Marshal::GetMinute => dt.minute() as i64,
        Marshal::GetHour => dt.hour() as i64,
        Marshal::GetDayOfWeek => dt.weekday().num_days_from_monday() as i64,
        Marshal::GetDayOfMonth => dt.day() as i64,
        Marshal::GetMonth => dt.month() as i64,
        Marshal::GetYear => dt.year() as i64,
        other => unreachable!("{other:?} is not a time-extraction marshal"),
    }
}

pub fn intersection(a: &IndexBits, b: &IndexBits) -> IndexBits {
    let mut out = a.clone();
    out.and(b);
    out
}

pub fn union(a: &IndexBits, b: &IndexBits) -> IndexBits {
    let mut out = a.clone();
    out.or(b);
    out
}

pub fn difference(a: &IndexBits, b: &IndexBits) -> IndexBits {
    let mut out = a.clone();
    out.andnot(b);
    out
}

pub fn compliment(a: &IndexBits) -> IndexBits {
    let mut out = a.clone();
    out.not();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_day_truncates_to_midnight_utc() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 5, 14, 37, 9).unwrap().timestamp_millis();
        let truncated = date_round(Marshal::DateDay, ts);
        let expected = Utc.with_ymd_and_hms(2026, 3, 5, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(truncated, expected);
    }

    #[test]
    fn date_week_truncates_to_monday() {
        // 2026-03-05 is a Thursday.
        let ts = Utc.with_ymd_and_hms(2026, 3, 5, 14, 0, 0).unwrap().timestamp_millis();
        let truncated = date_round(Marshal::DateWeek, ts);
        let expected = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(truncated, expected);
    }

    #[test]
    fn get_hour_extracts_component() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 5, 14, 37, 9).unwrap().timestamp_millis();
        assert_eq!(get_part(Marshal::GetHour, ts), 14);
    }

    #[test]
    fn segment_algebra_matches_bitmap_ops() {
        let mut a = IndexBits::new(8);
        a.set(1);
        a.set(2);
        let mut b = IndexBits::new(8);
        b.set(2);
        b.set(3);
        assert_eq!(intersection(&a, &b).population(), 1);
        assert_eq!(union(&a, &b).population(), 3);
        assert_eq!(difference(&a, &b).population(), 1);
    }
}
