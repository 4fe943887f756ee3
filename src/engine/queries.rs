use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::time;

use super::availability::{free_windows, slot_grid};
use super::conflict::trainer_conflict;
use super::quota::{limit_minutes, used_minutes};
use super::shift::ShiftResolution;
use super::{Engine, EngineError};

const SLOT_MS: Ms = 30 * MINUTE_MS;

/// One trainer's calendar for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainerDay {
    pub trainer_id: Ulid,
    pub date: NaiveDate,
    pub resolution: ShiftResolution,
    pub blocks: Vec<AdminBlock>,
    /// Confirmed bookings on the date, each padded by its own buffer.
    pub booked: Vec<Span>,
    pub available_slots: Vec<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerAvailabilityStatus {
    Available,
    Booked,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    DayOff,
    Blocked,
    AlreadyBooked,
    FacilityFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableTrainer {
    pub trainer_id: Ulid,
    pub name: String,
    pub status: TrainerAvailabilityStatus,
    pub reason: Option<UnavailableReason>,
}

impl Engine {
    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let trainer_id = self.trainer_for_booking(id)?;
        let ts = self.trainer_state(&trainer_id)?;
        let guard = ts.read().await;
        guard.booking(*id).cloned()
    }

    /// Every booking the user has ever made, any status, sorted by start.
    pub async fn user_bookings(&self, user_id: Ulid) -> Vec<Booking> {
        self.user_snapshot(user_id).await
    }

    /// Minutes used in the Sunday–Saturday week containing `date`, against the plan's limit.
    pub async fn weekly_usage(
        &self,
        user_id: Ulid,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<WeeklyUsage, EngineError> {
        let quota = self.services.membership.active_quota(user_id).await?;
        let week = time::week_bounds(date);
        let bookings = self.user_snapshot(user_id).await;
        Ok(WeeklyUsage {
            week,
            used_minutes: used_minutes(&bookings, &week, exclude),
            limit_minutes: limit_minutes(quota.as_ref(), self.config.default_weekly_hours),
            plan_name: quota.map(|q| q.plan_name),
        })
    }

    /// Shift, blocks, occupied windows and bookable 30-minute slots for a date.
    pub async fn trainer_day(
        &self,
        trainer_id: Ulid,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<TrainerDay, EngineError> {
        if !self
            .services
            .trainers
            .trainer(trainer_id)
            .await?
            .is_some_and(|p| p.active)
        {
            return Err(EngineError::NotFound(trainer_id));
        }
        let empty;
        let shared = self.trainer_state(&trainer_id);
        let guard = match &shared {
            Some(ts) => Some(ts.read().await),
            None => None,
        };
        let ts: &TrainerState = match &guard {
            Some(g) => &**g,
            None => {
                empty = TrainerState::new(trainer_id);
                &empty
            }
        };

        let resolution = self.shifts.resolve(ts, date);
        let blocks: Vec<AdminBlock> = ts.blocks_on(date).cloned().collect();
        let booked: Vec<Span> = ts
            .overlapping(&time::day_span(date))
            .filter(|b| b.is_confirmed() && Some(b.id) != exclude && b.local_date() == date)
            .map(|b| b.span.expand(b.buffer_ms()))
            .collect();

        let available_slots = match resolution.window() {
            Some(window) if !blocks.iter().any(|b| b.is_all_day()) => {
                let span = window.span_on(date);
                let mut busy: Vec<Span> = blocks.iter().map(|b| b.span()).collect();
                busy.extend(window.break_span_on(date));
                busy.extend_from_slice(&booked);
                slot_grid(span, &free_windows(span, &busy), SLOT_MS)
            }
            _ => Vec::new(),
        };

        Ok(TrainerDay {
            trainer_id,
            date,
            resolution,
            blocks,
            booked,
            available_slots,
        })
    }

    /// Trainers teaching `class_type`, each marked for the given session slot.
    /// Available trainers come first; ties keep directory (name) order.
    pub async fn available_trainers(
        &self,
        class_type: ClassType,
        date: NaiveDate,
        session: SessionSlot,
    ) -> Result<Vec<AvailableTrainer>, EngineError> {
        let profiles = self
            .services
            .trainers
            .trainers_with_specialization(class_type)
            .await?;
        let facility = self.facility_snapshot(class_type, date, session).await;
        let booked_trainers: BTreeSet<Ulid> = facility.iter().map(|b| b.trainer_id).collect();
        let facility_full = booked_trainers.len() >= self.config.legacy_facility_capacity;
        let span = session.span_on(date);

        let mut out = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let reason = match self.trainer_state(&profile.id) {
                Some(ts) => {
                    let guard = ts.read().await;
                    self.session_unavailability(&guard, date, &span)
                }
                None => self.session_unavailability(&TrainerState::new(profile.id), date, &span),
            }
            .or(facility_full.then_some(UnavailableReason::FacilityFull));
            let status = match reason {
                None => TrainerAvailabilityStatus::Available,
                Some(UnavailableReason::AlreadyBooked) => TrainerAvailabilityStatus::Booked,
                Some(_) => TrainerAvailabilityStatus::Unavailable,
            };
            out.push(AvailableTrainer {
                trainer_id: profile.id,
                name: profile.name,
                status,
                reason,
            });
        }
        out.sort_by_key(|t| t.status != TrainerAvailabilityStatus::Available);
        Ok(out)
    }

    fn session_unavailability(
        &self,
        ts: &TrainerState,
        date: NaiveDate,
        span: &Span,
    ) -> Option<UnavailableReason> {
        let legacy_off = ts.day_offs.get(&date.weekday()).copied().unwrap_or(false);
        if legacy_off || matches!(self.shifts.resolve(ts, date), ShiftResolution::DayOff { .. }) {
            return Some(UnavailableReason::DayOff);
        }
        if ts.blocks_on(date).any(|b| b.span().overlaps(span)) {
            return Some(UnavailableReason::Blocked);
        }
        if trainer_conflict(ts, span, None).is_some() {
            return Some(UnavailableReason::AlreadyBooked);
        }
        None
    }
}
