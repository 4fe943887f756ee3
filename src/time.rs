//! Wall-clock views of `Ms` instants in the gym's single operating timezone.
//!
//! The operating zone is fixed at UTC+08:00 and observes no daylight saving,
//! so every conversion here is a constant offset.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};

use crate::model::{DAY_MS, MINUTE_MS, Ms, Span};

pub const TIMEZONE_NAME: &str = "Asia/Manila";
pub const TIMEZONE_ABBR: &str = "PHT";
pub const UTC_OFFSET_SECS: i64 = 8 * 3600;

const OFFSET_MS: Ms = UTC_OFFSET_SECS * 1000;

/// Returned when a caller-supplied timestamp string cannot be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTimeFormat(pub String);

impl fmt::Display for InvalidTimeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time format: {:?}", self.0)
    }
}

impl std::error::Error for InvalidTimeFormat {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Up,
    Down,
    Nearest,
}

/// `h:m` as a time of day. Out-of-range input collapses to midnight.
pub fn clock(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

pub fn opening_time() -> NaiveTime {
    clock(7, 0)
}

pub fn closing_time() -> NaiveTime {
    clock(22, 0)
}

pub fn to_local(ms: Ms) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ms + OFFSET_MS)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

pub fn from_local(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis() - OFFSET_MS
}

/// The instant at which `date` reads `time` on the gym's wall clock.
pub fn at(date: NaiveDate, time: NaiveTime) -> Ms {
    from_local(date.and_time(time))
}

pub fn local_date(ms: Ms) -> NaiveDate {
    to_local(ms).date()
}

pub fn time_of_day(ms: Ms) -> NaiveTime {
    to_local(ms).time()
}

pub fn weekday(ms: Ms) -> Weekday {
    to_local(ms).weekday()
}

/// Midnight to midnight for one operating-zone calendar day.
pub fn day_span(date: NaiveDate) -> Span {
    let start = at(date, NaiveTime::MIN);
    Span::new(start, start + DAY_MS)
}

/// Accepts `YYYY-MM-DD HH:MM[:SS]`, the same with a `T` separator, or a
/// full RFC 3339 timestamp. Naive forms are read as operating-zone wall time.
pub fn parse_local_datetime(input: &str) -> Result<Ms, InvalidTimeFormat> {
    let s = input.trim();
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(from_local(dt));
        }
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| InvalidTimeFormat(input.to_string()))
}

pub fn parse_date(input: &str) -> Result<NaiveDate, InvalidTimeFormat> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| InvalidTimeFormat(input.to_string()))
}

pub fn parse_time(input: &str) -> Result<NaiveTime, InvalidTimeFormat> {
    let s = input.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| InvalidTimeFormat(input.to_string()))
}

/// True iff the wall-clock minute is :00 or :30.
pub fn align30(ms: Ms) -> bool {
    matches!(time_of_day(ms).minute(), 0 | 30)
}

pub fn is_whole_minute(ms: Ms) -> bool {
    ms.rem_euclid(MINUTE_MS) == 0
}

/// 07:00 through 22:00 inclusive; 22:00 itself is allowed, nothing after it.
pub fn within_operating_hours(ms: Ms) -> bool {
    let tod = time_of_day(ms);
    tod >= opening_time() && tod <= closing_time()
}

pub fn duration_minutes(start: Ms, end: Ms) -> i64 {
    ((end - start) / MINUTE_MS).max(0)
}

/// Snap to a :00 / :30 boundary. Sub-minute precision is dropped first.
pub fn round30(ms: Ms, rounding: Rounding) -> Ms {
    const HALF_HOUR: Ms = 30 * MINUTE_MS;
    let local = ms + OFFSET_MS;
    let floor = local - local.rem_euclid(HALF_HOUR);
    let snapped = match rounding {
        Rounding::Down => floor,
        Rounding::Up if floor == local => floor,
        Rounding::Up => floor + HALF_HOUR,
        Rounding::Nearest if local - floor >= HALF_HOUR / 2 => floor + HALF_HOUR,
        Rounding::Nearest => floor,
    };
    snapped - OFFSET_MS
}

/// Sunday 00:00 through the following Sunday 00:00 (half-open) around `date`.
pub fn week_bounds(date: NaiveDate) -> Span {
    let back = date.weekday().num_days_from_sunday() as i64;
    let sunday = date - Duration::days(back);
    let start = at(sunday, NaiveTime::MIN);
    Span::new(start, start + 7 * DAY_MS)
}

// ── Display helpers for user-facing messages ─────────────────────

/// "9:00 AM"
pub fn format_clock(t: NaiveTime) -> String {
    t.format("%-I:%M %p").to_string()
}

pub fn format_instant_clock(ms: Ms) -> String {
    format_clock(time_of_day(ms))
}

/// "December 20, 2025"
pub fn format_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

/// "9:00 AM–10:00 AM"
pub fn format_range(span: &Span) -> String {
    format!(
        "{}–{}",
        format_instant_clock(span.start),
        format_instant_clock(span.end)
    )
}

/// "1h 30m", "2h", "45m", "0m"
pub fn format_duration(minutes: i64) -> String {
    let (h, m) = (minutes / 60, minutes % 60);
    match (h, m) {
        (0, 0) => "0m".to_string(),
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

/// "Sat, Dec 20 2025 9:00 AM PHT"
pub fn format_display(ms: Ms) -> String {
    format!(
        "{} {TIMEZONE_ABBR}",
        to_local(ms).format("%a, %b %-d %Y %-I:%M %p")
    )
}
