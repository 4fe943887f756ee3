use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time;

/// Unix milliseconds, the only instant type. Wall-clock views go through `time`.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Pad both ends by `by` milliseconds.
    pub fn expand(&self, by: Ms) -> Span {
        Span::new(self.start - by, self.end + by)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassType {
    Boxing,
    MuayThai,
    Mma,
    Gym,
}

impl ClassType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassType::Boxing => "Boxing",
            ClassType::MuayThai => "Muay Thai",
            ClassType::Mma => "MMA",
            ClassType::Gym => "Gym",
        }
    }
}

impl fmt::Display for ClassType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "boxing" => Ok(ClassType::Boxing),
            "muay thai" | "muay_thai" | "muaythai" => Ok(ClassType::MuayThai),
            "mma" => Ok(ClassType::Mma),
            "gym" => Ok(ClassType::Gym),
            other => Err(format!("unknown class type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    /// Invalidated by an admin availability change, awaiting user action.
    Blocked,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Blocked => "blocked",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed session blocks of the pre-time-based booking scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionSlot {
    Morning,
    Afternoon,
    Evening,
}

impl SessionSlot {
    pub fn window(&self) -> (NaiveTime, NaiveTime) {
        match self {
            SessionSlot::Morning => (time::clock(7, 0), time::clock(11, 0)),
            SessionSlot::Afternoon => (time::clock(13, 0), time::clock(17, 0)),
            SessionSlot::Evening => (time::clock(18, 0), time::clock(22, 0)),
        }
    }

    pub fn span_on(&self, date: NaiveDate) -> Span {
        let (start, end) = self.window();
        Span::new(time::at(date, start), time::at(date, end))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionSlot::Morning => "Morning",
            SessionSlot::Afternoon => "Afternoon",
            SessionSlot::Evening => "Evening",
        }
    }

    pub fn hours_label(&self) -> &'static str {
        match self {
            SessionSlot::Morning => "7-11 AM",
            SessionSlot::Afternoon => "1-5 PM",
            SessionSlot::Evening => "6-10 PM",
        }
    }
}

impl FromStr for SessionSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Ok(SessionSlot::Morning),
            "afternoon" => Ok(SessionSlot::Afternoon),
            "evening" => Ok(SessionSlot::Evening),
            other => Err(format!("unknown session: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub trainer_id: Ulid,
    pub class_type: ClassType,
    pub span: Span,
    pub status: BookingStatus,
    /// Symmetric padding applied when this booking is tested against new requests.
    pub buffer_minutes: u32,
    /// Set for bookings made through the legacy session-slot pipeline.
    pub session: Option<SessionSlot>,
    pub booked_at: Ms,
    pub unavailable_marked_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }

    pub fn counts_toward_quota(&self) -> bool {
        matches!(self.status, BookingStatus::Confirmed | BookingStatus::Completed)
    }

    pub fn buffer_ms(&self) -> Ms {
        self.buffer_minutes as Ms * MINUTE_MS
    }

    pub fn local_date(&self) -> NaiveDate {
        time::local_date(self.span.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftKind {
    Morning,
    Afternoon,
    Night,
    Custom,
    /// No working window that day, whatever the other fields say.
    #[serde(rename = "none")]
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerShift {
    pub trainer_id: Ulid,
    pub weekday: Weekday,
    pub kind: ShiftKind,
    pub custom_start: Option<NaiveTime>,
    pub custom_end: Option<NaiveTime>,
    pub break_start: Option<NaiveTime>,
    pub break_end: Option<NaiveTime>,
    pub active: bool,
}

impl TrainerShift {
    pub fn break_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.break_start, self.break_end) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        }
    }
}

/// Administrator-imposed unavailability layered on top of the shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminBlock {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub date: NaiveDate,
    pub all_day: bool,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub reason: Option<String>,
    pub blocked_by: Option<Ulid>,
    pub created_at: Ms,
}

impl AdminBlock {
    pub fn is_all_day(&self) -> bool {
        self.all_day || self.start.is_none() || self.end.is_none()
    }

    pub fn span(&self) -> Span {
        match (self.is_all_day(), self.start, self.end) {
            (false, Some(start), Some(end)) => {
                Span::new(time::at(self.date, start), time::at(self.date, end))
            }
            _ => time::day_span(self.date),
        }
    }
}

/// Everything the engine knows about one trainer. Guarded by one lock.
#[derive(Debug, Clone)]
pub struct TrainerState {
    pub id: Ulid,
    pub shifts: HashMap<Weekday, TrainerShift>,
    /// Legacy day-off rows, consulted only when no active shift row exists.
    pub day_offs: HashMap<Weekday, bool>,
    pub blocks: Vec<AdminBlock>,
    /// All bookings regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl TrainerState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            shifts: HashMap::new(),
            day_offs: HashMap::new(),
            blocks: Vec::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (any status) whose raw span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn blocks_on(&self, date: NaiveDate) -> impl Iterator<Item = &AdminBlock> {
        self.blocks.iter().filter(move |b| b.date == date)
    }

    pub fn block(&self, id: Ulid) -> Option<&AdminBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ShiftSet {
        shift: TrainerShift,
    },
    DayOffSet {
        trainer_id: Ulid,
        weekday: Weekday,
        is_day_off: bool,
    },
    BlockAdded {
        block: AdminBlock,
    },
    BlockRemoved {
        id: Ulid,
        trainer_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        trainer_id: Ulid,
        span: Span,
    },
    BookingBlocked {
        id: Ulid,
        trainer_id: Ulid,
        at: Ms,
    },
    BookingRestored {
        id: Ulid,
        trainer_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        trainer_id: Ulid,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        trainer_id: Ulid,
    },
}

impl Event {
    pub fn trainer_id(&self) -> Ulid {
        match self {
            Event::ShiftSet { shift } => shift.trainer_id,
            Event::BlockAdded { block } => block.trainer_id,
            Event::BookingCreated { booking } => booking.trainer_id,
            Event::DayOffSet { trainer_id, .. }
            | Event::BlockRemoved { trainer_id, .. }
            | Event::BookingRescheduled { trainer_id, .. }
            | Event::BookingBlocked { trainer_id, .. }
            | Event::BookingRestored { trainer_id, .. }
            | Event::BookingCancelled { trainer_id, .. }
            | Event::BookingCompleted { trainer_id, .. } => *trainer_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A blocked booking still inside its grace window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedBookingView {
    pub booking_id: Ulid,
    pub trainer_id: Ulid,
    pub trainer_name: Option<String>,
    pub class_type: ClassType,
    pub span: Span,
    pub unavailable_marked_at: Ms,
    pub hours_since_marked: i64,
    pub hours_remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeeklyUsage {
    /// Sunday 00:00 through the following Sunday 00:00, operating timezone.
    pub week: Span,
    pub used_minutes: i64,
    pub limit_minutes: i64,
    pub plan_name: Option<String>,
}

impl WeeklyUsage {
    pub fn remaining_minutes(&self) -> i64 {
        (self.limit_minutes - self.used_minutes).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_at(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            trainer_id: Ulid::new(),
            class_type: ClassType::Boxing,
            span: Span::new(start, end),
            status: BookingStatus::Confirmed,
            buffer_minutes: 10,
            session: None,
            booked_at: 0,
            unavailable_marked_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn span_expand_pads_both_ends() {
        let s = Span::new(10 * MINUTE_MS, 20 * MINUTE_MS).expand(5 * MINUTE_MS);
        assert_eq!(s, Span::new(5 * MINUTE_MS, 25 * MINUTE_MS));
        assert_eq!(s.duration_minutes(), 20);
    }

    #[test]
    fn class_type_parses_display_names() {
        assert_eq!("Muay Thai".parse::<ClassType>(), Ok(ClassType::MuayThai));
        assert_eq!("mma".parse::<ClassType>(), Ok(ClassType::Mma));
        assert_eq!(ClassType::Mma.to_string(), "MMA");
        assert!("Yoga".parse::<ClassType>().is_err());
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut ts = TrainerState::new(Ulid::new());
        ts.insert_booking(booking_at(300, 400));
        ts.insert_booking(booking_at(100, 200));
        ts.insert_booking(booking_at(200, 300));
        let starts: Vec<Ms> = ts.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_booking_by_id() {
        let mut ts = TrainerState::new(Ulid::new());
        let b = booking_at(100, 200);
        let id = b.id;
        ts.insert_booking(b);
        ts.insert_booking(booking_at(300, 400));
        assert!(ts.remove_booking(id).is_some());
        assert!(ts.remove_booking(id).is_none());
        assert_eq!(ts.bookings.len(), 1);
    }

    #[test]
    fn overlapping_skips_adjacent_and_future() {
        let mut ts = TrainerState::new(Ulid::new());
        ts.insert_booking(booking_at(100, 200));
        ts.insert_booking(booking_at(450, 600));
        ts.insert_booking(booking_at(1000, 1100));

        let hits: Vec<_> = ts.overlapping(&Span::new(200, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn admin_block_span_all_day_when_times_missing() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
        let block = AdminBlock {
            id: Ulid::new(),
            trainer_id: Ulid::new(),
            date,
            all_day: false,
            start: Some(time::clock(9, 0)),
            end: None,
            reason: None,
            blocked_by: None,
            created_at: 0,
        };
        assert!(block.is_all_day());
        assert_eq!(block.span(), time::day_span(date));
    }

    #[test]
    fn shift_break_requires_both_ends() {
        let mut shift = TrainerShift {
            trainer_id: Ulid::new(),
            weekday: Weekday::Mon,
            kind: ShiftKind::Morning,
            custom_start: None,
            custom_end: None,
            break_start: Some(time::clock(12, 0)),
            break_end: None,
            active: true,
        };
        assert_eq!(shift.break_window(), None);
        shift.break_end = Some(time::clock(12, 30));
        assert_eq!(
            shift.break_window(),
            Some((time::clock(12, 0), time::clock(12, 30)))
        );
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ShiftSet {
            shift: TrainerShift {
                trainer_id: Ulid::new(),
                weekday: Weekday::Sat,
                kind: ShiftKind::Custom,
                custom_start: Some(time::clock(8, 0)),
                custom_end: Some(time::clock(16, 30)),
                break_start: None,
                break_end: None,
                active: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
