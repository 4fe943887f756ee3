//! Blocked-booking lifecycle: `confirmed → blocked` when availability is taken
//! away, the user-facing notice, and the sweep that finalizes expired blocks.

use std::time::Instant;

use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::time;

use super::{Engine, EngineError};

impl Engine {
    /// Transition one booking to `blocked`. Only confirmed bookings move; anything
    /// else is left alone and `None` comes back. Caller holds the trainer write lock.
    pub(super) async fn mark_blocked(
        &self,
        ts: &mut TrainerState,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<Option<Booking>, EngineError> {
        if !ts.booking(booking_id).is_some_and(|b| b.is_confirmed()) {
            return Ok(None);
        }
        let event = Event::BookingBlocked {
            id: booking_id,
            trainer_id: ts.id,
            at: now,
        };
        self.persist_and_apply(ts, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_BLOCKED_TOTAL).increment(1);
        info!(booking = %booking_id, trainer = %ts.id, "booking blocked");
        Ok(ts.booking(booking_id).cloned())
    }

    async fn trainer_name(&self, trainer_id: Ulid) -> String {
        match self.services.trainers.trainer(trainer_id).await {
            Ok(Some(profile)) => profile.name,
            Ok(None) => "your trainer".into(),
            Err(e) => {
                warn!(trainer = %trainer_id, "trainer lookup failed: {e}");
                "your trainer".into()
            }
        }
    }

    async fn describe(&self, booking: &Booking) -> String {
        format!(
            "Your {} session with {} on {} ({} - {})",
            booking.class_type,
            self.trainer_name(booking.trainer_id).await,
            time::format_date(booking.local_date()),
            time::format_instant_clock(booking.span.start),
            time::format_instant_clock(booking.span.end),
        )
    }

    /// Delivery is best effort: a failure is logged and counted, never returned.
    async fn deliver(&self, notification: Notification) -> bool {
        let user = notification.user_id;
        let kind = notification.kind;
        match self.services.notifications.notify(notification).await {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
                warn!(%user, ?kind, "notification delivery failed: {e}");
                false
            }
        }
    }

    pub(super) async fn send_unavailable_notice(
        &self,
        booking: &Booking,
        reason: Option<&str>,
        admin_id: Option<Ulid>,
    ) {
        let mut message = format!(
            "{} is no longer available due to trainer scheduling changes.",
            self.describe(booking).await
        );
        if let Some(reason) = reason.filter(|r| !r.is_empty()) {
            message.push_str(&format!(" Reason: {reason}."));
        }
        message.push_str(&format!(
            " Please reschedule or cancel this booking within {} hours, or it will be automatically cancelled.",
            self.config.block_grace_hours
        ));
        let admin_identifier = if admin_id.is_some() { "Administrator" } else { "System" };
        self.deliver(Notification {
            user_id: booking.user_id,
            kind: NotificationKind::BookingUnavailable,
            booking_id: Some(booking.id),
            title: "Booking Unavailable - Action Required".into(),
            message,
            admin_identifier: admin_identifier.into(),
            send_email: true,
            created_at: self.now(),
        })
        .await;
    }

    pub(super) async fn send_cancelled_notice(&self, booking: &Booking) {
        let message = format!(
            "{} has been cancelled by an administrator.",
            self.describe(booking).await
        );
        self.deliver(Notification {
            user_id: booking.user_id,
            kind: NotificationKind::BookingCancelled,
            booking_id: Some(booking.id),
            title: "Booking Cancelled".into(),
            message,
            admin_identifier: "Administrator".into(),
            send_email: true,
            created_at: self.now(),
        })
        .await;
    }

    async fn send_auto_cancel_notice(&self, booking: &Booking) {
        let message = format!(
            "{} has been automatically cancelled as no action was taken within {} hours.",
            self.describe(booking).await,
            self.config.block_grace_hours
        );
        self.deliver(Notification {
            user_id: booking.user_id,
            kind: NotificationKind::BookingAutoCancelled,
            booking_id: Some(booking.id),
            title: "Booking Auto-Cancelled".into(),
            message,
            admin_identifier: "System".into(),
            send_email: true,
            created_at: self.now(),
        })
        .await;
    }

    /// Move a confirmed booking owned by `user_id` to `blocked` and tell the owner.
    ///
    /// Returns `false` when there was nothing to transition (unknown booking,
    /// another user's booking, or not confirmed). Once the transition is stored
    /// the result is `true` even if the notice could not be delivered.
    pub async fn notify_blocked_booking(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        reason: Option<&str>,
        admin_id: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        super::conflict::validate_reason(reason)?;
        let _gate = self.begin_write().await;
        let Some(trainer_id) = self.trainer_for_booking(&booking_id) else {
            return Ok(false);
        };
        let Some(ts) = self.trainer_state(&trainer_id) else {
            return Ok(false);
        };
        let blocked = {
            let mut guard = ts.write().await;
            if !guard.booking(booking_id).is_some_and(|b| b.user_id == user_id) {
                return Ok(false);
            }
            self.mark_blocked(&mut guard, booking_id, self.now()).await?
        };
        let Some(booking) = blocked else {
            return Ok(false);
        };
        self.send_unavailable_notice(&booking, reason, admin_id).await;
        Ok(true)
    }

    /// The user's blocked bookings still inside the grace window, oldest mark first.
    pub async fn blocked_bookings_requiring_action(&self, user_id: Ulid) -> Vec<BlockedBookingView> {
        let now = self.now();
        let grace = self.config.block_grace_ms();
        let mut pending: Vec<(Booking, Ms)> = self
            .user_snapshot(user_id)
            .await
            .into_iter()
            .filter_map(|b| {
                let marked = b.unavailable_marked_at?;
                (b.status == BookingStatus::Blocked && now - marked < grace).then_some((b, marked))
            })
            .collect();
        pending.sort_by_key(|(b, marked)| (*marked, b.id));

        let mut out = Vec::with_capacity(pending.len());
        for (b, marked) in pending {
            let trainer_name = match self.services.trainers.trainer(b.trainer_id).await {
                Ok(profile) => profile.map(|p| p.name),
                Err(e) => {
                    warn!(trainer = %b.trainer_id, "trainer lookup failed: {e}");
                    None
                }
            };
            let hours_since_marked = (now - marked) / HOUR_MS;
            out.push(BlockedBookingView {
                booking_id: b.id,
                trainer_id: b.trainer_id,
                trainer_name,
                class_type: b.class_type,
                span: b.span,
                unavailable_marked_at: marked,
                hours_since_marked,
                hours_remaining: self.config.block_grace_hours - hours_since_marked,
            });
        }
        out
    }

    /// Dashboard badge: any blocked booking still awaiting action.
    pub async fn has_pending_blocked_bookings(&self, user_id: Ulid) -> bool {
        let now = self.now();
        let grace = self.config.block_grace_ms();
        self.user_snapshot(user_id).await.iter().any(|b| {
            b.status == BookingStatus::Blocked
                && b.unavailable_marked_at.is_some_and(|marked| now - marked < grace)
        })
    }

    /// Cancel every booking that has sat in `blocked` for at least the grace period.
    /// The status precondition is re-checked under each trainer's write lock, so
    /// concurrent sweeps cancel and notify each booking once. Returns the count.
    pub async fn auto_cancel_expired_blocks(&self) -> Result<usize, EngineError> {
        let started = Instant::now();
        let _gate = self.begin_write().await;
        let now = self.now();
        let grace = self.config.block_grace_ms();

        let mut cancelled = Vec::new();
        let mut failure = None;
        'sweep: for ts in self.all_trainers() {
            let mut guard = ts.write().await;
            let expired: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| {
                    b.status == BookingStatus::Blocked
                        && b.unavailable_marked_at.is_some_and(|marked| now - marked >= grace)
                })
                .map(|b| b.id)
                .collect();
            for id in expired {
                let event = Event::BookingCancelled {
                    id,
                    trainer_id: guard.id,
                    at: now,
                };
                if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
                    failure = Some(e);
                    break 'sweep;
                }
                if let Some(b) = guard.booking(id) {
                    info!(booking = %id, user = %b.user_id, "blocked booking auto-cancelled after grace period");
                    cancelled.push(b.clone());
                }
            }
        }

        for booking in &cancelled {
            self.send_auto_cancel_notice(booking).await;
        }

        metrics::counter!(crate::observability::BOOKINGS_AUTO_CANCELLED_TOTAL)
            .increment(cancelled.len() as u64);
        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if !cancelled.is_empty() {
            info!("sweep cancelled {} expired blocked bookings", cancelled.len());
        }
        match failure {
            // The cancellations before the failure are committed and their users notified.
            Some(e) => {
                error!(committed = cancelled.len(), "sweep stopped early: {e}");
                Err(e)
            }
            None => Ok(cancelled.len()),
        }
    }
}
