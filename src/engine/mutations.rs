use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time;

use super::conflict::{trainer_conflict, user_conflict, validate_reason, validate_span};
use super::quota::{QuotaCheck, limit_minutes, session_count};
use super::shift::ShiftResolution;
use super::validator::{ScheduleView, run_validator};
use super::verdict::*;
use super::{Engine, EngineError, WalCommand};

/// An administrator's request to take a trainer out of service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub trainer_id: Ulid,
    pub date: NaiveDate,
    pub all_day: bool,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockOutcome {
    pub block_id: Ulid,
    /// Bookings moved to `blocked` by this block.
    pub affected: Vec<Ulid>,
}

fn not_found<T>() -> Result<Verdict<T>, EngineError> {
    Ok(Rejection::new(FailedCheck::BookingNotFound, "Booking not found").into())
}

fn check_window(start: NaiveTime, end: NaiveTime, what: &str) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInput(format!("{what} must start before it ends")));
    }
    if start < time::opening_time() || end > time::closing_time() {
        return Err(EngineError::InvalidInput(format!(
            "{what} must fall within operating hours"
        )));
    }
    Ok(())
}

fn validate_shift(shift: &TrainerShift) -> Result<(), EngineError> {
    if shift.kind == ShiftKind::Custom {
        match (shift.custom_start, shift.custom_end) {
            (Some(start), Some(end)) => check_window(start, end, "custom shift")?,
            _ => {
                return Err(EngineError::InvalidInput(
                    "custom shift requires start and end times".into(),
                ));
            }
        }
    }
    match (shift.break_start, shift.break_end) {
        (None, None) => Ok(()),
        (Some(start), Some(end)) => check_window(start, end, "break"),
        _ => Err(EngineError::InvalidInput(
            "break requires both start and end times".into(),
        )),
    }
}

impl Engine {
    /// Whether a booking still fits the trainer's working pattern for its date.
    fn fits_availability(&self, ts: &TrainerState, booking: &Booking) -> bool {
        let date = booking.local_date();
        if booking.session.is_some() && ts.day_offs.get(&date.weekday()).copied().unwrap_or(false) {
            return false;
        }
        match self.shifts.resolve(ts, date) {
            ShiftResolution::DayOff { .. } => false,
            ShiftResolution::Working(window) => window.check(date, &booking.span).is_ok(),
        }
    }

    /// Validate and store a booking in one trainer critical section.
    pub async fn create_booking(
        &self,
        request: BookingRequest,
        caller: CallerContext,
    ) -> Result<BookingOutcome, EngineError> {
        let _gate = self.begin_write().await;
        match request {
            BookingRequest::Timed(req) => self.create_timed(req, caller).await,
            BookingRequest::Session(req) => self.create_session(req, caller).await,
        }
    }

    async fn create_timed(
        &self,
        req: TimedRequest,
        caller: CallerContext,
    ) -> Result<BookingOutcome, EngineError> {
        let req = TimedRequest {
            exclude_booking_id: None,
            ..req
        };
        let user_lock = self.user_lock(req.user_id);
        let _user = user_lock.lock().await;
        let user_bookings = self.user_snapshot(req.user_id).await;

        let ts = self.trainer_state_or_default(req.trainer_id);
        let mut guard = ts.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many bookings on trainer"));
        }
        let now = self.now();
        let view = ScheduleView {
            trainer: &guard,
            user_bookings: &user_bookings,
            facility: &[],
            now,
        };
        let approval = match run_validator(&self.timed_validator(), &req, &view, &caller).await? {
            Verdict::Approved(a) => a,
            Verdict::Rejected(r) => return Ok(r.into()),
        };
        validate_span(&approval.span)?;

        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            trainer_id: req.trainer_id,
            class_type: req.class_type,
            span: approval.span,
            status: BookingStatus::Confirmed,
            buffer_minutes: self.config.default_buffer_minutes.min(MAX_BUFFER_MINUTES),
            session: None,
            booked_at: now,
            unavailable_marked_at: None,
            cancelled_at: None,
        };
        self.store_booking(&mut guard, booking, "timed").await
    }

    async fn create_session(
        &self,
        req: SessionRequest,
        caller: CallerContext,
    ) -> Result<BookingOutcome, EngineError> {
        let user_lock = self.user_lock(req.user_id);
        let _user = user_lock.lock().await;
        let facility_lock = self.facility_lock((req.class_type, req.date, req.session));
        let _facility = facility_lock.lock().await;
        let user_bookings = self.user_snapshot(req.user_id).await;
        let facility = self.facility_snapshot(req.class_type, req.date, req.session).await;

        let ts = self.trainer_state_or_default(req.trainer_id);
        let mut guard = ts.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many bookings on trainer"));
        }
        let now = self.now();
        let view = ScheduleView {
            trainer: &guard,
            user_bookings: &user_bookings,
            facility: &facility,
            now,
        };
        let approval = match run_validator(&self.session_validator(), &req, &view, &caller).await? {
            Verdict::Approved(a) => a,
            Verdict::Rejected(r) => return Ok(r.into()),
        };

        // Session bookings occupy their whole window and carry no padding.
        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            trainer_id: req.trainer_id,
            class_type: req.class_type,
            span: approval.span,
            status: BookingStatus::Confirmed,
            buffer_minutes: 0,
            session: Some(req.session),
            booked_at: now,
            unavailable_marked_at: None,
            cancelled_at: None,
        };
        self.store_booking(&mut guard, booking, "session").await
    }

    async fn store_booking(
        &self,
        ts: &mut TrainerState,
        booking: Booking,
        pipeline: &'static str,
    ) -> Result<BookingOutcome, EngineError> {
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(ts, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "pipeline" => pipeline)
            .increment(1);
        info!(
            booking = %booking.id,
            user = %booking.user_id,
            trainer = %booking.trainer_id,
            "booked {} {}",
            booking.class_type,
            time::format_display(booking.span.start)
        );
        Ok(Verdict::Approved(booking))
    }

    /// Move a confirmed or blocked booking to a new time with the same trainer
    /// and class. A blocked booking that moves is confirmed again.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        start: &str,
        end: &str,
        caller: CallerContext,
    ) -> Result<BookingOutcome, EngineError> {
        let _gate = self.begin_write().await;
        let Some(current) = self.get_booking(&booking_id).await else {
            return not_found();
        };
        if current.user_id != user_id && !caller.is_admin {
            return not_found();
        }

        let owner = current.user_id;
        let user_lock = self.user_lock(owner);
        let _user = user_lock.lock().await;
        let user_bookings = self.user_snapshot(owner).await;

        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let Some(current) = guard.booking(booking_id).cloned() else {
            return not_found();
        };
        if !matches!(current.status, BookingStatus::Confirmed | BookingStatus::Blocked) {
            return Ok(Rejection::new(
                FailedCheck::AlreadyNonCancellable,
                format!("Cannot reschedule a {} booking", current.status),
            )
            .into());
        }

        let req = TimedRequest {
            user_id: owner,
            trainer_id: current.trainer_id,
            class_type: current.class_type,
            start: start.to_string(),
            end: end.to_string(),
            exclude_booking_id: Some(booking_id),
        };
        let view = ScheduleView {
            trainer: &guard,
            user_bookings: &user_bookings,
            facility: &[],
            now: self.now(),
        };
        let approval = match run_validator(&self.timed_validator(), &req, &view, &caller).await? {
            Verdict::Approved(a) => a,
            Verdict::Rejected(r) => return Ok(r.into()),
        };
        validate_span(&approval.span)?;

        let event = Event::BookingRescheduled {
            id: booking_id,
            trainer_id: current.trainer_id,
            span: approval.span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            booking = %booking_id,
            from = %time::format_display(current.span.start),
            to = %time::format_display(approval.span.start),
            "booking rescheduled"
        );
        match guard.booking(booking_id) {
            Some(b) => Ok(Verdict::Approved(b.clone())),
            None => not_found(),
        }
    }

    /// Cancel on behalf of `user_id`. An administrator cancelling someone else's
    /// booking triggers a notice to the owner.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        mode: CancelMode,
        caller: CallerContext,
    ) -> Result<BookingOutcome, EngineError> {
        let _gate = self.begin_write().await;
        if self.trainer_for_booking(&booking_id).is_none() {
            return not_found();
        }
        let cancelled = {
            let mut guard = self.resolve_booking_write(&booking_id).await?;
            let Some(booking) = guard.booking(booking_id).cloned() else {
                return not_found();
            };
            if let Verdict::Rejected(r) = self.check_cancellation(&booking, user_id, mode, &caller) {
                return Ok(r.into());
            }
            let event = Event::BookingCancelled {
                id: booking_id,
                trainer_id: booking.trainer_id,
                at: self.now(),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            guard.booking(booking_id).cloned().unwrap_or(booking)
        };

        info!(booking = %booking_id, user = %cancelled.user_id, ?mode, "booking cancelled");
        if caller.is_admin && cancelled.user_id != user_id {
            self.send_cancelled_notice(&cancelled).await;
        }
        Ok(Verdict::Approved(cancelled))
    }

    /// `confirmed → completed`, driven by whatever marks sessions as held.
    pub async fn complete_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.begin_write().await;
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.is_confirmed() {
            return Err(EngineError::InvalidInput(format!(
                "cannot complete a {} booking",
                booking.status
            )));
        }
        let event = Event::BookingCompleted {
            id: booking_id,
            trainer_id: booking.trainer_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.booking(booking_id).cloned().unwrap_or(booking))
    }

    /// Block every future confirmed booking on `weekday` that no longer fits the
    /// trainer's pattern. Caller holds the trainer write lock.
    async fn block_unfit(
        &self,
        ts: &mut TrainerState,
        weekday: chrono::Weekday,
    ) -> Result<Vec<Booking>, EngineError> {
        let now = self.now();
        let unfit: Vec<Ulid> = ts
            .bookings
            .iter()
            .filter(|b| {
                b.is_confirmed()
                    && b.span.start >= now
                    && b.local_date().weekday() == weekday
                    && !self.fits_availability(ts, b)
            })
            .map(|b| b.id)
            .collect();
        let mut blocked = Vec::with_capacity(unfit.len());
        for id in unfit {
            if let Some(b) = self.mark_blocked(ts, id, now).await? {
                blocked.push(b);
            }
        }
        Ok(blocked)
    }

    /// Store a weekday shift row and block future bookings it invalidates.
    /// Returns the ids of the blocked bookings.
    pub async fn set_shift(
        &self,
        shift: TrainerShift,
        admin_id: Option<Ulid>,
    ) -> Result<Vec<Ulid>, EngineError> {
        validate_shift(&shift)?;
        let _gate = self.begin_write().await;
        if self.services.trainers.trainer(shift.trainer_id).await?.is_none() {
            return Err(EngineError::NotFound(shift.trainer_id));
        }
        let weekday = shift.weekday;
        let ts = self.trainer_state_or_default(shift.trainer_id);
        let blocked = {
            let mut guard = ts.write().await;
            self.persist_and_apply(&mut guard, &Event::ShiftSet { shift }).await?;
            self.block_unfit(&mut guard, weekday).await?
        };
        self.notify_schedule_change(&blocked, admin_id).await;
        Ok(blocked.into_iter().map(|b| b.id).collect())
    }

    /// Store a legacy day-off row and block future bookings it invalidates.
    pub async fn set_legacy_day_off(
        &self,
        trainer_id: Ulid,
        weekday: chrono::Weekday,
        is_day_off: bool,
        admin_id: Option<Ulid>,
    ) -> Result<Vec<Ulid>, EngineError> {
        let _gate = self.begin_write().await;
        if self.services.trainers.trainer(trainer_id).await?.is_none() {
            return Err(EngineError::NotFound(trainer_id));
        }
        let ts = self.trainer_state_or_default(trainer_id);
        let blocked = {
            let mut guard = ts.write().await;
            let event = Event::DayOffSet {
                trainer_id,
                weekday,
                is_day_off,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            self.block_unfit(&mut guard, weekday).await?
        };
        self.notify_schedule_change(&blocked, admin_id).await;
        Ok(blocked.into_iter().map(|b| b.id).collect())
    }

    async fn notify_schedule_change(&self, blocked: &[Booking], admin_id: Option<Ulid>) {
        for b in blocked {
            self.send_unavailable_notice(b, Some("Trainer schedule changed"), admin_id)
                .await;
        }
    }

    /// Store an admin block and move every overlapping confirmed booking to `blocked`.
    pub async fn add_admin_block(
        &self,
        req: BlockRequest,
        admin_id: Option<Ulid>,
    ) -> Result<BlockOutcome, EngineError> {
        validate_reason(req.reason.as_deref())?;
        let (start, end) = if req.all_day {
            (None, None)
        } else {
            match (req.start, req.end) {
                (Some(s), Some(e)) if s < e => (Some(s), Some(e)),
                _ => {
                    return Err(EngineError::InvalidInput(
                        "a partial block needs a start before its end".into(),
                    ));
                }
            }
        };

        let _gate = self.begin_write().await;
        if self.services.trainers.trainer(req.trainer_id).await?.is_none() {
            return Err(EngineError::NotFound(req.trainer_id));
        }
        let ts = self.trainer_state_or_default(req.trainer_id);
        let (block, blocked) = {
            let mut guard = ts.write().await;
            if guard.blocks.len() >= MAX_BLOCKS_PER_TRAINER {
                return Err(EngineError::LimitExceeded("too many blocks on trainer"));
            }
            if let Some(dup) = guard.blocks_on(req.date).find(|b| {
                b.is_all_day() == req.all_day && (req.all_day || (b.start == start && b.end == end))
            }) {
                return Err(EngineError::AlreadyExists(dup.id));
            }

            let now = self.now();
            let block = AdminBlock {
                id: Ulid::new(),
                trainer_id: req.trainer_id,
                date: req.date,
                all_day: req.all_day,
                start,
                end,
                reason: req.reason.clone(),
                blocked_by: admin_id,
                created_at: now,
            };
            self.persist_and_apply(&mut guard, &Event::BlockAdded { block: block.clone() })
                .await?;

            let overlapping: Vec<Ulid> = guard
                .overlapping(&block.span())
                .filter(|b| b.is_confirmed())
                .map(|b| b.id)
                .collect();
            let mut blocked = Vec::with_capacity(overlapping.len());
            for id in overlapping {
                if let Some(b) = self.mark_blocked(&mut guard, id, now).await? {
                    blocked.push(b);
                }
            }
            (block, blocked)
        };

        info!(
            block = %block.id,
            trainer = %block.trainer_id,
            date = %block.date,
            affected = blocked.len(),
            "admin block added"
        );
        for b in &blocked {
            self.send_unavailable_notice(b, block.reason.as_deref(), admin_id).await;
        }
        Ok(BlockOutcome {
            block_id: block.id,
            affected: blocked.into_iter().map(|b| b.id).collect(),
        })
    }

    /// Delete an admin block and restore the bookings it displaced, where that is
    /// still safe. Returns the ids of restored bookings.
    pub async fn remove_admin_block(&self, block_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let _gate = self.begin_write().await;
        let trainer_id = self
            .index
            .blocks
            .get(&block_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(block_id))?;
        let ts = self
            .trainer_state(&trainer_id)
            .ok_or(EngineError::NotFound(trainer_id))?;

        // Phase 1: drop the block and note who might come back.
        let candidates: Vec<Booking> = {
            let mut guard = ts.write().await;
            let block = guard
                .block(block_id)
                .cloned()
                .ok_or(EngineError::NotFound(block_id))?;
            self.persist_and_apply(&mut guard, &Event::BlockRemoved { id: block_id, trainer_id })
                .await?;
            let window = block.span();
            guard
                .bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Blocked && window.contains_span(&b.span))
                .cloned()
                .collect()
        };

        // Phase 2: one booking at a time under user → facility → trainer order.
        let mut restored = Vec::new();
        for candidate in candidates {
            let id = candidate.id;
            let user_lock = self.user_lock(candidate.user_id);
            let _user = user_lock.lock().await;
            let facility_lock = candidate
                .session
                .map(|slot| self.facility_lock((candidate.class_type, candidate.local_date(), slot)));
            let _facility = match &facility_lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };
            let user_bookings = self.user_snapshot(candidate.user_id).await;
            let facility = match candidate.session {
                Some(slot) => {
                    self.facility_snapshot(candidate.class_type, candidate.local_date(), slot)
                        .await
                }
                None => Vec::new(),
            };
            let limit = match self.services.membership.active_quota(candidate.user_id).await {
                Ok(quota) => limit_minutes(quota.as_ref(), self.config.default_weekly_hours),
                Err(e) => {
                    warn!(booking = %id, "membership lookup failed, booking left blocked: {e}");
                    continue;
                }
            };

            let mut guard = ts.write().await;
            let Some(b) = guard.booking(id).cloned() else { continue };
            if b.status != BookingStatus::Blocked {
                continue;
            }
            if let Some(reason) = self.restore_blocker(&guard, &b, &user_bookings, &facility, limit) {
                info!(booking = %id, reason, "blocked booking left blocked after block removal");
                continue;
            }
            self.persist_and_apply(&mut guard, &Event::BookingRestored { id, trainer_id })
                .await?;
            restored.push(id);
        }
        info!(block = %block_id, restored = restored.len(), "admin block removed");
        Ok(restored)
    }

    /// Why a blocked booking cannot go back to `confirmed`, if anything stops it.
    /// A restored booking must still fit the schedule and the user's limits.
    fn restore_blocker(
        &self,
        ts: &TrainerState,
        b: &Booking,
        user_bookings: &[Booking],
        facility: &[Booking],
        limit_minutes: i64,
    ) -> Option<&'static str> {
        let date = b.local_date();
        if ts.blocks_on(date).any(|blk| blk.span().overlaps(&b.span)) {
            return Some("still blocked");
        }
        if !self.fits_availability(ts, b) {
            return Some("outside availability");
        }
        if trainer_conflict(ts, &b.span, Some(b.id)).is_some() {
            return Some("trainer conflict");
        }
        if user_conflict(user_bookings, &b.span, Some(b.id)).is_some() {
            return Some("user conflict");
        }
        let quota = QuotaCheck::new(
            user_bookings,
            date,
            b.span.duration_minutes(),
            limit_minutes,
            Some(b.id),
        );
        if quota.exceeded() {
            return Some("weekly quota");
        }
        if b.session.is_some() {
            let others: BTreeSet<Ulid> = facility
                .iter()
                .filter(|f| f.id != b.id && f.trainer_id != b.trainer_id)
                .map(|f| f.trainer_id)
                .collect();
            if others.len() >= self.config.legacy_facility_capacity {
                return Some("facility at capacity");
            }
            let week = time::week_bounds(date);
            if session_count(user_bookings, &week, Some(b.id)) >= self.config.legacy_weekly_bookings {
                return Some("weekly session limit");
            }
        }
        None
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.write_gate.write().await;
        let mut events = Vec::new();
        let mut trainers: Vec<_> = self.state.iter().map(|e| (*e.key(), e.value().clone())).collect();
        trainers.sort_by_key(|(id, _)| *id);

        for (_, ts) in trainers {
            let guard = ts.read().await;
            let mut shifts: Vec<&TrainerShift> = guard.shifts.values().collect();
            shifts.sort_by_key(|s| s.weekday.num_days_from_sunday());
            events.extend(shifts.into_iter().map(|s| Event::ShiftSet { shift: s.clone() }));

            let mut day_offs: Vec<_> = guard.day_offs.iter().collect();
            day_offs.sort_by_key(|(w, _)| w.num_days_from_sunday());
            events.extend(day_offs.into_iter().map(|(weekday, is_day_off)| Event::DayOffSet {
                trainer_id: guard.id,
                weekday: *weekday,
                is_day_off: *is_day_off,
            }));

            events.extend(guard.blocks.iter().map(|b| Event::BlockAdded { block: b.clone() }));
            events.extend(
                guard
                    .bookings
                    .iter()
                    .map(|b| Event::BookingCreated { booking: b.clone() }),
            );
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
