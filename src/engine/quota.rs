use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Booking, Span};
use crate::services::MembershipQuota;
use crate::time;

/// Minutes of confirmed + completed sessions that start inside `week`.
pub fn used_minutes<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    week: &Span,
    exclude: Option<Ulid>,
) -> i64 {
    counted(bookings, week, exclude)
        .map(|b| b.span.duration_minutes())
        .sum()
}

/// Number of confirmed + completed sessions that start inside `week`.
pub fn session_count<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    week: &Span,
    exclude: Option<Ulid>,
) -> usize {
    counted(bookings, week, exclude).count()
}

fn counted<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    week: &Span,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Booking> {
    let week = *week;
    bookings.into_iter().filter(move |b| {
        b.counts_toward_quota() && Some(b.id) != exclude && week.contains_instant(b.span.start)
    })
}

/// The plan's weekly limit in minutes, or the configured default when the plan is silent.
pub fn limit_minutes(quota: Option<&MembershipQuota>, default_hours: u32) -> i64 {
    let hours = quota
        .and_then(|q| q.weekly_hour_limit)
        .unwrap_or(default_hours)
        .min(crate::limits::MAX_WEEKLY_HOURS);
    hours as i64 * 60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub week: Span,
    pub used_minutes: i64,
    pub requested_minutes: i64,
    pub limit_minutes: i64,
}

impl QuotaCheck {
    pub fn new(
        bookings: &[Booking],
        reference: NaiveDate,
        requested_minutes: i64,
        limit_minutes: i64,
        exclude: Option<Ulid>,
    ) -> Self {
        let week = time::week_bounds(reference);
        Self {
            week,
            used_minutes: used_minutes(bookings, &week, exclude),
            requested_minutes,
            limit_minutes,
        }
    }

    pub fn exceeded(&self) -> bool {
        self.used_minutes + self.requested_minutes > self.limit_minutes
    }

    pub fn remaining_after(&self) -> i64 {
        (self.limit_minutes - self.used_minutes - self.requested_minutes).max(0)
    }
}
