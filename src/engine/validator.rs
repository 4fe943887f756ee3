use std::time::Instant;

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::services::Services;
use crate::time;

use super::conflict::{trainer_conflict, user_conflict};
use super::quota::{QuotaCheck, limit_minutes};
use super::shift::{ShiftResolution, ShiftResolver, ShiftViolation};
use super::verdict::*;
use super::{Engine, EngineError};

/// The stored data a pipeline decides against. Built by the engine under the
/// appropriate locks; validators never reach into the store themselves.
pub struct ScheduleView<'a> {
    pub trainer: &'a TrainerState,
    /// Every booking of the requesting user, any trainer.
    pub user_bookings: &'a [Booking],
    /// Confirmed session bookings of other trainers for the same class/date/slot.
    pub facility: &'a [Booking],
    pub now: Ms,
}

/// One booking pipeline. Implementations run their checks in a fixed order
/// and stop at the first failure.
#[async_trait]
pub trait Validator: Send + Sync {
    type Request: Send + Sync;

    /// Metric label.
    fn pipeline(&self) -> &'static str;

    async fn validate(
        &self,
        request: &Self::Request,
        view: &ScheduleView<'_>,
        caller: &CallerContext,
    ) -> Result<Verdict, EngineError>;
}

/// Run a validator and record the outcome.
pub(super) async fn run_validator<V: Validator>(
    validator: &V,
    request: &V::Request,
    view: &ScheduleView<'_>,
    caller: &CallerContext,
) -> Result<Verdict, EngineError> {
    let started = Instant::now();
    let verdict = validator.validate(request, view, caller).await?;
    let outcome = crate::observability::outcome_label(verdict.failed_check());
    metrics::counter!(
        crate::observability::VALIDATIONS_TOTAL,
        "pipeline" => validator.pipeline(),
        "outcome" => outcome,
    )
    .increment(1);
    metrics::histogram!(
        crate::observability::VALIDATION_DURATION_SECONDS,
        "pipeline" => validator.pipeline(),
    )
    .record(started.elapsed().as_secs_f64());
    if let Verdict::Rejected(r) = &verdict {
        debug!(pipeline = validator.pipeline(), check = %r.failed_check, "{}", r.message);
    }
    Ok(verdict)
}

macro_rules! reject {
    ($check:expr, $($msg:tt)+) => {
        return Ok(Verdict::Rejected(Rejection::new($check, format!($($msg)+))))
    };
}

/// Parsed and shape-checked candidate interval.
pub(super) fn normalize(
    start: &str,
    end: &str,
    config: &EngineConfig,
) -> Result<Span, Rejection> {
    let start = time::parse_local_datetime(start).map_err(|e| {
        Rejection::new(FailedCheck::InvalidTimeFormat, format!("Invalid start time: {e}"))
    })?;
    let end = time::parse_local_datetime(end).map_err(|e| {
        Rejection::new(FailedCheck::InvalidTimeFormat, format!("Invalid end time: {e}"))
    })?;

    for t in [start, end] {
        if !time::is_whole_minute(t) || !time::align30(t) {
            return Err(Rejection::new(
                FailedCheck::NotAligned,
                "Start and end times must fall on the hour or half hour",
            ));
        }
    }
    for t in [start, end] {
        if !time::within_operating_hours(t) {
            return Err(Rejection::new(
                FailedCheck::OutOfOperatingHours,
                "Sessions must be between 7:00 AM and 10:00 PM",
            ));
        }
    }
    if time::local_date(start) != time::local_date(end) {
        return Err(Rejection::new(
            FailedCheck::OutOfOperatingHours,
            "A session must start and end on the same day",
        ));
    }
    let minutes = time::duration_minutes(start, end);
    if end <= start || minutes < config.min_session_minutes {
        return Err(Rejection::new(
            FailedCheck::MinimumDurationNotMet,
            format!("Sessions must be at least {} minutes long", config.min_session_minutes),
        ));
    }
    Ok(Span::new(start, end))
}

/// Not before `now`, and no further ahead than the horizon (calendar days).
pub(super) fn check_horizon(start: Ms, now: Ms, horizon_days: u32) -> Result<(), Rejection> {
    let today = time::local_date(now);
    if start < now {
        return Err(Rejection::new(FailedCheck::DateOutOfRange, "Cannot book sessions in the past"));
    }
    if time::local_date(start) > today + Duration::days(horizon_days as i64) {
        return Err(Rejection::new(
            FailedCheck::DateOutOfRange,
            format!("Bookings are limited to {horizon_days} days in advance"),
        ));
    }
    Ok(())
}

/// The trainer's profile, checked for existence and specialization.
pub(super) async fn check_specialization(
    services: &Services,
    trainer_id: Ulid,
    class_type: ClassType,
) -> Result<Result<String, Rejection>, EngineError> {
    let profile = services.trainers.trainer(trainer_id).await?;
    let Some(profile) = profile.filter(|p| p.active) else {
        return Ok(Err(Rejection::new(FailedCheck::TrainerNotFound, "Trainer not found")));
    };
    if profile.specialization != class_type {
        return Ok(Err(Rejection::new(
            FailedCheck::SpecializationMismatch,
            format!(
                "This trainer specializes in {}, not {}",
                profile.specialization, class_type
            ),
        )));
    }
    Ok(Ok(profile.name))
}

/// Continuous-time pipeline: shifts, breaks, buffered conflicts and a minute quota.
pub struct TimedValidator<'a> {
    pub services: &'a Services,
    pub config: &'a EngineConfig,
    pub shifts: &'a ShiftResolver,
}

#[async_trait]
impl<'a> Validator for TimedValidator<'a> {
    type Request = TimedRequest;

    fn pipeline(&self) -> &'static str {
        "timed"
    }

    async fn validate(
        &self,
        req: &TimedRequest,
        view: &ScheduleView<'_>,
        caller: &CallerContext,
    ) -> Result<Verdict, EngineError> {
        // 1. format, alignment, operating hours, minimum duration
        let span = match normalize(&req.start, &req.end, self.config) {
            Ok(span) => span,
            Err(r) => return Ok(r.into()),
        };
        let date = time::local_date(span.start);
        let minutes = span.duration_minutes();

        // 2. membership
        if !self.services.membership.is_active(req.user_id).await? {
            reject!(FailedCheck::NoActiveMembership, "You need an active membership to book sessions");
        }

        // 3. horizon
        if let Err(r) = check_horizon(span.start, view.now, self.config.booking_horizon_days) {
            return Ok(r.into());
        }

        // 4. trainer + specialization
        if let Err(r) = check_specialization(self.services, req.trainer_id, req.class_type).await? {
            return Ok(r.into());
        }

        // 5. shift window and break
        let window = match self.shifts.resolve(view.trainer, date) {
            ShiftResolution::DayOff { .. } => {
                reject!(
                    FailedCheck::TrainerDayOff,
                    "Trainer is not available on {}s",
                    date.format("%A")
                );
            }
            ShiftResolution::Working(w) => w,
        };
        match window.check(date, &span) {
            Ok(()) => {}
            Err(ShiftViolation::OutsideWindow) => {
                let detail = RejectionDetail::Window {
                    start: window.start,
                    end: window.end,
                };
                let message = format!(
                    "Requested time is outside the trainer's shift ({}–{})",
                    time::format_clock(window.start),
                    time::format_clock(window.end)
                );
                return Ok(Rejection::new(FailedCheck::OutsideShiftWindow, message)
                    .with_detail(detail)
                    .into());
            }
            Err(ShiftViolation::DuringBreak { start, end }) => {
                let message = format!(
                    "Trainer is on break during {}–{}",
                    time::format_clock(start),
                    time::format_clock(end)
                );
                return Ok(Rejection::new(FailedCheck::DuringBreak, message)
                    .with_detail(RejectionDetail::Window { start, end })
                    .into());
            }
        }

        // 6. admin blocks
        if let Some(block) = view
            .trainer
            .blocks_on(date)
            .filter(|b| b.span().overlaps(&span))
            .min_by_key(|b| b.id)
        {
            let reason = block.reason.as_deref().unwrap_or("No reason given");
            let message = if block.is_all_day() {
                format!("Trainer unavailable all day: {reason}")
            } else {
                format!("Trainer blocked during {}: {reason}", time::format_range(&block.span()))
            };
            return Ok(Rejection::new(FailedCheck::AdminBlocked, message)
                .with_detail(RejectionDetail::Block {
                    block_id: block.id,
                    span: block.span(),
                    reason: block.reason.clone(),
                })
                .into());
        }

        // 7. trainer-side buffered conflict
        if let Some(c) = trainer_conflict(view.trainer, &span, req.exclude_booking_id) {
            let buffer = (c.buffered.end - c.span.end) / MINUTE_MS;
            let message = format!(
                "Trainer has another session at {} ({buffer}-minute buffer required)",
                time::format_range(&c.span)
            );
            return Ok(Rejection::new(FailedCheck::TrainerBufferConflict, message)
                .with_detail(RejectionDetail::Conflict {
                    booking_id: c.booking_id,
                    span: c.span,
                    buffered: c.buffered,
                })
                .into());
        }

        // 8. user-side double booking
        if let Some(c) = user_conflict(view.user_bookings, &span, req.exclude_booking_id) {
            let message = format!("You already have a session at {}", time::format_range(&c.span));
            return Ok(Rejection::new(FailedCheck::UserDoubleBooked, message)
                .with_detail(RejectionDetail::Conflict {
                    booking_id: c.booking_id,
                    span: c.span,
                    buffered: c.buffered,
                })
                .into());
        }

        // 9. weekly quota
        if caller.override_quota && !caller.is_admin {
            tracing::warn!(user = %req.user_id, "quota override requested by non-admin caller; ignored");
        }
        let quota = self.services.membership.active_quota(req.user_id).await?;
        let limit = limit_minutes(quota.as_ref(), self.config.default_weekly_hours);
        let check = QuotaCheck::new(view.user_bookings, date, minutes, limit, req.exclude_booking_id);
        if !caller.skip_quota() && check.exceeded() {
            let message = format!(
                "Weekly limit reached: {} used of {}, this session adds {}",
                time::format_duration(check.used_minutes),
                time::format_duration(check.limit_minutes),
                time::format_duration(minutes)
            );
            return Ok(Rejection::new(FailedCheck::WeeklyQuotaExceeded, message)
                .with_detail(RejectionDetail::Quota {
                    used_minutes: check.used_minutes,
                    requested_minutes: minutes,
                    limit_minutes: check.limit_minutes,
                })
                .into());
        }

        Ok(Verdict::Approved(Approval {
            span,
            duration_minutes: minutes,
            session: None,
            remaining_weekly_minutes: Some(check.remaining_after()),
            remaining_weekly_sessions: None,
        }))
    }
}

impl Engine {
    pub(super) fn timed_validator(&self) -> TimedValidator<'_> {
        TimedValidator {
            services: &self.services,
            config: &self.config,
            shifts: &self.shifts,
        }
    }

    /// Dry-run the time-based pipeline against current state.
    pub async fn validate_booking(
        &self,
        request: &TimedRequest,
        caller: &CallerContext,
    ) -> Result<Verdict, EngineError> {
        let user_bookings = self.user_snapshot(request.user_id).await;
        let ts = self.trainer_state_or_default(request.trainer_id);
        let guard = ts.read().await;
        let view = ScheduleView {
            trainer: &guard,
            user_bookings: &user_bookings,
            facility: &[],
            now: self.now(),
        };
        run_validator(&self.timed_validator(), request, &view, caller).await
    }

    /// Dry-run the legacy session pipeline against current state.
    pub async fn validate_booking_legacy(
        &self,
        request: &SessionRequest,
        caller: &CallerContext,
    ) -> Result<Verdict, EngineError> {
        let user_bookings = self.user_snapshot(request.user_id).await;
        let facility = self.facility_snapshot(request.class_type, request.date, request.session).await;
        let ts = self.trainer_state_or_default(request.trainer_id);
        let guard = ts.read().await;
        let view = ScheduleView {
            trainer: &guard,
            user_bookings: &user_bookings,
            facility: &facility,
            now: self.now(),
        };
        run_validator(&self.session_validator(), request, &view, caller).await
    }

    /// Whether `user_id` may cancel `booking_id` right now. Administrators may
    /// act on bookings they do not own.
    pub async fn validate_cancellation(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        mode: CancelMode,
        caller: &CallerContext,
    ) -> Result<Verdict<CancellationApproval>, EngineError> {
        let Some(booking) = self.get_booking(&booking_id).await else {
            return Ok(Rejection::new(FailedCheck::BookingNotFound, "Booking not found").into());
        };
        Ok(self.check_cancellation(&booking, user_id, mode, caller))
    }

    pub(super) fn check_cancellation(
        &self,
        booking: &Booking,
        user_id: Ulid,
        mode: CancelMode,
        caller: &CallerContext,
    ) -> Verdict<CancellationApproval> {
        if booking.user_id != user_id && !caller.is_admin {
            return Rejection::new(FailedCheck::BookingNotFound, "Booking not found").into();
        }
        let allowed = match mode {
            CancelMode::Standard => booking.status == BookingStatus::Confirmed,
            CancelMode::FromBlocked => matches!(
                booking.status,
                BookingStatus::Confirmed | BookingStatus::Blocked
            ),
        };
        if !allowed {
            return Rejection::new(
                FailedCheck::AlreadyNonCancellable,
                format!("Booking is not in confirmed status (currently {})", booking.status),
            )
            .into();
        }

        let until_start = booking.span.start - self.now();
        let lead = self.config.cancellation_lead_ms();
        if mode == CancelMode::Standard && until_start < lead {
            return Rejection::new(
                FailedCheck::CancellationWindowViolated,
                format!(
                    "Cancellations must be made at least {} hours before the session",
                    self.config.cancellation_lead_hours
                ),
            )
            .with_detail(RejectionDetail::LeadTime {
                minutes_until_start: until_start / MINUTE_MS,
                required_hours: self.config.cancellation_lead_hours,
            })
            .into();
        }

        Verdict::Approved(CancellationApproval {
            booking_id: booking.id,
            hours_until_start: until_start / HOUR_MS,
        })
    }
}
