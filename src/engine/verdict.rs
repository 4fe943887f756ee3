use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use ulid::Ulid;

use crate::model::{Booking, ClassType, SessionSlot, Span};

/// Machine-readable tag for the check that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedCheck {
    InvalidTimeFormat,
    NotAligned,
    OutOfOperatingHours,
    MinimumDurationNotMet,
    NoActiveMembership,
    DateOutOfRange,
    TrainerNotFound,
    SpecializationMismatch,
    TrainerDayOff,
    OutsideShiftWindow,
    DuringBreak,
    AdminBlocked,
    TrainerBufferConflict,
    UserDoubleBooked,
    WeeklyQuotaExceeded,
    TrainerSessionTaken,
    FacilityAtCapacity,
    WeeklyBookingLimit,
    BookingNotFound,
    CancellationWindowViolated,
    AlreadyNonCancellable,
}

impl FailedCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedCheck::InvalidTimeFormat => "invalid_time_format",
            FailedCheck::NotAligned => "not_aligned",
            FailedCheck::OutOfOperatingHours => "out_of_operating_hours",
            FailedCheck::MinimumDurationNotMet => "minimum_duration_not_met",
            FailedCheck::NoActiveMembership => "no_active_membership",
            FailedCheck::DateOutOfRange => "date_out_of_range",
            FailedCheck::TrainerNotFound => "trainer_not_found",
            FailedCheck::SpecializationMismatch => "specialization_mismatch",
            FailedCheck::TrainerDayOff => "trainer_day_off",
            FailedCheck::OutsideShiftWindow => "outside_shift_window",
            FailedCheck::DuringBreak => "during_break",
            FailedCheck::AdminBlocked => "admin_blocked",
            FailedCheck::TrainerBufferConflict => "trainer_buffer_conflict",
            FailedCheck::UserDoubleBooked => "user_double_booked",
            FailedCheck::WeeklyQuotaExceeded => "weekly_quota_exceeded",
            FailedCheck::TrainerSessionTaken => "trainer_session_taken",
            FailedCheck::FacilityAtCapacity => "facility_at_capacity",
            FailedCheck::WeeklyBookingLimit => "weekly_booking_limit",
            FailedCheck::BookingNotFound => "booking_not_found",
            FailedCheck::CancellationWindowViolated => "cancellation_window_violated",
            FailedCheck::AlreadyNonCancellable => "already_non_cancellable",
        }
    }
}

impl std::fmt::Display for FailedCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured context for a rejection, for callers that want more than the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionDetail {
    None,
    Conflict {
        booking_id: Ulid,
        span: Span,
        buffered: Span,
    },
    Window {
        start: NaiveTime,
        end: NaiveTime,
    },
    Block {
        block_id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    Quota {
        used_minutes: i64,
        requested_minutes: i64,
        limit_minutes: i64,
    },
    Capacity {
        trainers: usize,
        capacity: usize,
    },
    WeeklyCount {
        count: usize,
        limit: usize,
        week_start: NaiveDate,
        week_end: NaiveDate,
    },
    LeadTime {
        minutes_until_start: i64,
        required_hours: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub failed_check: FailedCheck,
    pub message: String,
    pub detail: RejectionDetail,
}

impl Rejection {
    pub fn new(failed_check: FailedCheck, message: impl Into<String>) -> Self {
        Self {
            failed_check,
            message: message.into(),
            detail: RejectionDetail::None,
        }
    }

    pub fn with_detail(mut self, detail: RejectionDetail) -> Self {
        self.detail = detail;
        self
    }
}

/// What a passing booking validation reports back for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Approval {
    pub span: Span,
    pub duration_minutes: i64,
    pub session: Option<SessionSlot>,
    /// Time-based pipeline: weekly minutes left after this booking.
    pub remaining_weekly_minutes: Option<i64>,
    /// Legacy pipeline: weekly sessions left after this booking.
    pub remaining_weekly_sessions: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancellationApproval {
    pub booking_id: Ulid,
    pub hours_until_start: i64,
}

/// Accept/reject decision. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verdict<T = Approval> {
    Approved(T),
    Rejected(Rejection),
}

impl<T> Verdict<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Approved(_))
    }

    pub fn failed_check(&self) -> Option<FailedCheck> {
        match self {
            Verdict::Approved(_) => None,
            Verdict::Rejected(r) => Some(r.failed_check),
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Verdict::Approved(_) => None,
            Verdict::Rejected(r) => Some(r),
        }
    }

    pub fn approved(self) -> Option<T> {
        match self {
            Verdict::Approved(v) => Some(v),
            Verdict::Rejected(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Verdict<U> {
        match self {
            Verdict::Approved(v) => Verdict::Approved(f(v)),
            Verdict::Rejected(r) => Verdict::Rejected(r),
        }
    }
}

impl<T> From<Rejection> for Verdict<T> {
    fn from(r: Rejection) -> Self {
        Verdict::Rejected(r)
    }
}

/// Result of `create_booking`: the stored booking, or why it was refused.
pub type BookingOutcome = Verdict<Booking>;

/// Who is asking. Passed explicitly; nothing is read from ambient state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub is_admin: bool,
    pub override_quota: bool,
}

impl CallerContext {
    pub fn member() -> Self {
        Self::default()
    }

    pub fn admin() -> Self {
        Self {
            is_admin: true,
            override_quota: false,
        }
    }

    pub fn admin_override() -> Self {
        Self {
            is_admin: true,
            override_quota: true,
        }
    }

    /// The override only counts when an administrator sets it.
    pub fn skip_quota(&self) -> bool {
        self.is_admin && self.override_quota
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    #[default]
    Standard,
    /// Cancel a booking already blocked by an availability change; no lead-time rule.
    FromBlocked,
}

/// Time-based booking request. Timestamps arrive as text and are parsed by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedRequest {
    pub user_id: Ulid,
    pub trainer_id: Ulid,
    pub class_type: ClassType,
    pub start: String,
    pub end: String,
    pub exclude_booking_id: Option<Ulid>,
}

/// Legacy session-slot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub user_id: Ulid,
    pub trainer_id: Ulid,
    pub class_type: ClassType,
    pub date: NaiveDate,
    pub session: SessionSlot,
}

/// The shape of the request picks the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingRequest {
    Timed(TimedRequest),
    Session(SessionRequest),
}

impl BookingRequest {
    pub fn user_id(&self) -> Ulid {
        match self {
            BookingRequest::Timed(r) => r.user_id,
            BookingRequest::Session(r) => r.user_id,
        }
    }

    pub fn trainer_id(&self) -> Ulid {
        match self {
            BookingRequest::Timed(r) => r.trainer_id,
            BookingRequest::Session(r) => r.trainer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_requires_admin() {
        let sneaky = CallerContext {
            is_admin: false,
            override_quota: true,
        };
        assert!(!sneaky.skip_quota());
        assert!(CallerContext::admin_override().skip_quota());
        assert!(!CallerContext::admin().skip_quota());
    }

    #[test]
    fn rejection_serializes_snake_case_tag() {
        let r = Rejection::new(FailedCheck::TrainerBufferConflict, "busy");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["failed_check"], "trainer_buffer_conflict");
        assert_eq!(json["detail"]["kind"], "none");
    }

    #[test]
    fn verdict_accessors() {
        let v: Verdict<u32> = Rejection::new(FailedCheck::DuringBreak, "break").into();
        assert!(!v.is_valid());
        assert_eq!(v.failed_check(), Some(FailedCheck::DuringBreak));
        let ok: Verdict<u32> = Verdict::Approved(3);
        assert_eq!(ok.map(|n| n * 2).approved(), Some(6));
    }
}
