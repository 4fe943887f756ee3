//! Fixed Morning/Afternoon/Evening session pipeline kept for bookings made
//! before the time-based scheme. Independent of the time-based pipeline.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};

use crate::config::EngineConfig;
use crate::model::*;
use crate::services::Services;
use crate::time;

use super::conflict::trainer_conflict;
use super::quota::session_count;
use super::validator::{ScheduleView, Validator, check_specialization};
use super::verdict::*;
use super::{Engine, EngineError};

pub struct SessionValidator<'a> {
    pub services: &'a Services,
    pub config: &'a EngineConfig,
}

fn reject(check: FailedCheck, message: impl Into<String>) -> Result<Verdict, EngineError> {
    Ok(Verdict::Rejected(Rejection::new(check, message)))
}

#[async_trait]
impl<'a> Validator for SessionValidator<'a> {
    type Request = SessionRequest;

    fn pipeline(&self) -> &'static str {
        "session"
    }

    async fn validate(
        &self,
        req: &SessionRequest,
        view: &ScheduleView<'_>,
        _caller: &CallerContext,
    ) -> Result<Verdict, EngineError> {
        let span = req.session.span_on(req.date);

        if !self.services.membership.is_active(req.user_id).await? {
            return reject(
                FailedCheck::NoActiveMembership,
                "You need an active membership to book sessions",
            );
        }

        // Day granularity; today stays bookable until the session is over.
        let today = time::local_date(view.now);
        if req.date < today || view.now >= span.end {
            return reject(FailedCheck::DateOutOfRange, "Cannot book sessions in the past");
        }
        let horizon = self.config.booking_horizon_days;
        if req.date > today + Duration::days(horizon as i64) {
            return reject(
                FailedCheck::DateOutOfRange,
                format!("Bookings are limited to {horizon} days in advance"),
            );
        }

        if let Some(existing) = view.user_bookings.iter().find(|b| {
            b.is_confirmed()
                && ((b.session == Some(req.session) && b.local_date() == req.date)
                    || b.span.overlaps(&span))
        }) {
            return reject(
                FailedCheck::UserDoubleBooked,
                format!(
                    "You already have a {} booking for {} session ({}) on this date",
                    existing.class_type,
                    req.session.label(),
                    req.session.hours_label()
                ),
            );
        }

        if let Err(r) = check_specialization(self.services, req.trainer_id, req.class_type).await? {
            return Ok(r.into());
        }

        if view.trainer.day_offs.get(&req.date.weekday()).copied().unwrap_or(false) {
            return reject(
                FailedCheck::TrainerDayOff,
                format!("Trainer is not available on {}s", req.date.format("%A")),
            );
        }

        if let Some(block) = view
            .trainer
            .blocks_on(req.date)
            .filter(|b| b.span().overlaps(&span))
            .min_by_key(|b| b.id)
        {
            let reason = block.reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default();
            return Ok(Rejection::new(
                FailedCheck::AdminBlocked,
                format!("Trainer unavailable for this session{reason}"),
            )
            .with_detail(RejectionDetail::Block {
                block_id: block.id,
                span: block.span(),
                reason: block.reason.clone(),
            })
            .into());
        }

        // Any confirmed booking touching the session window, with its buffer.
        if let Some(c) = trainer_conflict(view.trainer, &span, None) {
            return Ok(Rejection::new(
                FailedCheck::TrainerSessionTaken,
                "Trainer already has a booking for this session",
            )
            .with_detail(RejectionDetail::Conflict {
                booking_id: c.booking_id,
                span: c.span,
                buffered: c.buffered,
            })
            .into());
        }

        let trainers: BTreeSet<_> = view
            .facility
            .iter()
            .filter(|b| b.is_confirmed())
            .map(|b| b.trainer_id)
            .collect();
        let capacity = self.config.legacy_facility_capacity;
        if trainers.len() >= capacity {
            return Ok(Rejection::new(
                FailedCheck::FacilityAtCapacity,
                format!(
                    "The {} facility is at capacity for this session ({}/{capacity} trainers booked)",
                    req.class_type,
                    trainers.len()
                ),
            )
            .with_detail(RejectionDetail::Capacity {
                trainers: trainers.len(),
                capacity,
            })
            .into());
        }

        let week = time::week_bounds(req.date);
        let count = session_count(view.user_bookings, &week, None);
        let limit = self.config.legacy_weekly_bookings;
        if count >= limit {
            let week_start = time::local_date(week.start);
            let week_end = week_start + Duration::days(6);
            return Ok(Rejection::new(
                FailedCheck::WeeklyBookingLimit,
                format!(
                    "You have reached the maximum of {limit} bookings for the week of {} - {}",
                    week_start.format("%b %-d"),
                    week_end.format("%b %-d")
                ),
            )
            .with_detail(RejectionDetail::WeeklyCount {
                count,
                limit,
                week_start,
                week_end,
            })
            .into());
        }

        Ok(Verdict::Approved(Approval {
            span,
            duration_minutes: span.duration_minutes(),
            session: Some(req.session),
            remaining_weekly_minutes: None,
            remaining_weekly_sessions: Some(limit - count - 1),
        }))
    }
}

impl Engine {
    pub(super) fn session_validator(&self) -> SessionValidator<'_> {
        SessionValidator {
            services: &self.services,
            config: &self.config,
        }
    }

    /// Confirmed session bookings for a class/date/slot, any trainer.
    /// One trainer read lock at a time.
    pub(super) async fn facility_snapshot(
        &self,
        class_type: ClassType,
        date: NaiveDate,
        session: SessionSlot,
    ) -> Vec<Booking> {
        let mut out = Vec::new();
        for ts in self.all_trainers() {
            let guard = ts.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| {
                        b.is_confirmed()
                            && b.class_type == class_type
                            && b.session == Some(session)
                            && b.local_date() == date
                    })
                    .cloned(),
            );
        }
        out
    }
}
