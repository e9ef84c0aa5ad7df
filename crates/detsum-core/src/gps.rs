//! GPS time conversion and span helpers.
//!
//! GPS time counts SI seconds since 1980-01-06T00:00:00 UTC and does not
//! apply leap seconds, so it drifts ahead of UTC by one second per leap.
//! The table below lists the Unix times of every leap second inserted
//! since the GPS epoch (through 2017-01-01, the most recent at the time
//! of writing); conversions are exact for any date in that range.

use crate::error::ConfigError;
use crate::interval::Interval;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

/// Unix timestamp of the GPS epoch, 1980-01-06T00:00:00Z.
const GPS_EPOCH_UNIX: i64 = 315_964_800;

/// Unix times at which a leap second took effect after the GPS epoch.
const LEAP_SECONDS: [i64; 18] = [
    362_793_600,   // 1981-07-01
    394_329_600,   // 1982-07-01
    425_865_600,   // 1983-07-01
    489_024_000,   // 1985-07-01
    567_993_600,   // 1988-01-01
    631_152_000,   // 1990-01-01
    662_688_000,   // 1991-01-01
    709_948_800,   // 1992-07-01
    741_484_800,   // 1993-07-01
    773_020_800,   // 1994-07-01
    820_454_400,   // 1996-01-01
    867_715_200,   // 1997-07-01
    915_148_800,   // 1999-01-01
    1_136_073_600, // 2006-01-01
    1_230_768_000, // 2009-01-01
    1_341_100_800, // 2012-07-01
    1_435_708_800, // 2015-07-01
    1_483_228_800, // 2017-01-01
];

/// Number of leap seconds inserted up to (and including) a Unix time.
fn leap_count(unix: i64) -> i64 {
    LEAP_SECONDS.iter().filter(|&&leap| unix >= leap).count() as i64
}

/// Convert a UTC instant to GPS seconds.
#[must_use]
pub fn utc_to_gps(utc: DateTime<Utc>) -> f64 {
    let unix = utc.timestamp();
    let frac = f64::from(utc.timestamp_subsec_nanos()) / 1e9;
    (unix - GPS_EPOCH_UNIX + leap_count(unix)) as f64 + frac
}

/// Convert GPS seconds to a UTC instant.
#[must_use]
pub fn gps_to_utc(gps: f64) -> DateTime<Utc> {
    let whole = gps.floor() as i64;
    let frac = gps - whole as f64;
    // Fixed-point on the leap correction; two passes settle it because
    // leap seconds are years apart.
    let mut unix = whole + GPS_EPOCH_UNIX;
    for _ in 0..2 {
        unix = whole + GPS_EPOCH_UNIX - leap_count(unix);
    }
    Utc.timestamp_opt(unix, (frac * 1e9).round() as u32)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(unix, 0).unwrap())
}

/// Parse a `YYYYMMDD` date string into the UTC midnight starting it.
fn parse_day(day: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(day, "%Y%m%d")
        .map_err(|_| ConfigError::Invalid(format!("bad date '{day}', expected YYYYMMDD")))
}

/// UTC midnight starting the given date.
fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

/// The GPS span covering one UTC calendar day.
pub fn day_span(day: &str) -> Result<Interval, ConfigError> {
    let start = midnight(parse_day(day)?);
    let end = start + Duration::days(1);
    Ok(Interval::new(utc_to_gps(start), utc_to_gps(end)))
}

/// The GPS span covering seven UTC days starting at the given day.
pub fn week_span(day: &str) -> Result<Interval, ConfigError> {
    let start = midnight(parse_day(day)?);
    let end = start + Duration::days(7);
    Ok(Interval::new(utc_to_gps(start), utc_to_gps(end)))
}

/// The GPS span covering one UTC calendar month, given as `YYYYMM`.
pub fn month_span(month: &str) -> Result<Interval, ConfigError> {
    let bad = || ConfigError::Invalid(format!("bad month '{month}', expected YYYYMM"));
    if month.len() != 6 {
        return Err(bad());
    }
    let first = NaiveDate::parse_from_str(&format!("{month}01"), "%Y%m%d").map_err(|_| bad())?;
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .expect("first of month exists");
    Ok(Interval::new(
        utc_to_gps(midnight(first)),
        utc_to_gps(midnight(next)),
    ))
}

/// The GPS span covering one UTC calendar year, given as `YYYY`.
pub fn year_span(year: &str) -> Result<Interval, ConfigError> {
    let bad = || ConfigError::Invalid(format!("bad year '{year}', expected YYYY"));
    if year.len() != 4 {
        return Err(bad());
    }
    let y: i32 = year.parse().map_err(|_| bad())?;
    let first = NaiveDate::from_ymd_opt(y, 1, 1).ok_or_else(bad)?;
    let next = NaiveDate::from_ymd_opt(y + 1, 1, 1).ok_or_else(bad)?;
    Ok(Interval::new(
        utc_to_gps(midnight(first)),
        utc_to_gps(midnight(next)),
    ))
}

/// The GPS span covering the current UTC calendar day.
#[must_use]
pub fn today_span() -> Interval {
    let start = midnight(Utc::now().date_naive());
    let end = start + Duration::days(1);
    Interval::new(utc_to_gps(start), utc_to_gps(end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_epoch_is_zero() {
        let epoch = Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).unwrap();
        assert_eq!(utc_to_gps(epoch), 0.0);
    }

    #[test]
    fn known_conversion_after_all_leaps() {
        // 2017-01-01T00:00:00 UTC is GPS 1167264018 (18 leap seconds in).
        let t = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(utc_to_gps(t), 1_167_264_018.0);
    }

    #[test]
    fn round_trip_modern_date() {
        let t = Utc.with_ymd_and_hms(2026, 8, 24, 12, 30, 0).unwrap();
        let gps = utc_to_gps(t);
        assert_eq!(gps_to_utc(gps), t);
    }

    #[test]
    fn day_span_is_86400_seconds() {
        let span = day_span("20260824").unwrap();
        assert_eq!(span.duration(), 86400.0);
    }

    #[test]
    fn week_is_seven_consecutive_days() {
        let week = week_span("20260817").unwrap();
        assert_eq!(week.duration(), 7.0 * 86400.0);
        // The week decomposes into day spans with no seams.
        let mut cursor = week.start;
        for day in ["20260817", "20260818", "20260819", "20260820", "20260821", "20260822", "20260823"] {
            let span = day_span(day).unwrap();
            assert_eq!(span.start, cursor);
            cursor = span.end;
        }
        assert_eq!(cursor, week.end);
    }

    #[test]
    fn month_span_covers_the_calendar_month() {
        let aug = month_span("202608").unwrap();
        assert_eq!(aug.duration(), 31.0 * 86400.0);
        assert_eq!(aug.start, day_span("20260801").unwrap().start);
        assert_eq!(aug.end, day_span("20260901").unwrap().start);

        // Leap-year February, and the December -> January rollover.
        assert_eq!(month_span("202402").unwrap().duration(), 29.0 * 86400.0);
        assert_eq!(
            month_span("202512").unwrap().end,
            day_span("20260101").unwrap().start
        );
    }

    #[test]
    fn year_span_covers_the_calendar_year() {
        let y = year_span("2026").unwrap();
        assert_eq!(y.duration(), 365.0 * 86400.0);
        assert_eq!(y.start, day_span("20260101").unwrap().start);
        assert_eq!(year_span("2024").unwrap().duration(), 366.0 * 86400.0);
    }

    #[test]
    fn today_span_is_the_current_utc_day() {
        let span = today_span();
        assert_eq!(span.duration(), 86400.0);
        assert!(span.contains(utc_to_gps(Utc::now())));
    }

    #[test]
    fn bad_date_is_config_error() {
        assert!(day_span("2026-08-24").is_err());
        assert!(day_span("garbage").is_err());
        assert!(month_span("2026").is_err());
        assert!(month_span("202613").is_err());
        assert!(year_span("26").is_err());
        assert!(year_span("twenty").is_err());
    }
}
