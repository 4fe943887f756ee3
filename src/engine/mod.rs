mod availability;
mod conflict;
mod error;
mod legacy;
mod mutations;
mod notifier;
mod queries;
mod quota;
mod shift;
mod validator;
mod verdict;

pub use availability::{free_windows, merge_overlapping, slot_grid, subtract_intervals};
pub use conflict::{Buffer, Conflict, has_conflict, trainer_conflict, user_conflict};
pub use error::EngineError;
pub use legacy::SessionValidator;
pub use mutations::{BlockOutcome, BlockRequest};
pub use queries::{AvailableTrainer, TrainerAvailabilityStatus, TrainerDay, UnavailableReason};
pub use quota::{QuotaCheck, limit_minutes, session_count, used_minutes};
pub use shift::{
    DefaultWindow, LegacyDayOffs, ModernShifts, ShiftResolution, ShiftResolver, ShiftSource,
    ShiftSourceKind, ShiftViolation, ShiftWindow, default_window,
};
pub use validator::{ScheduleView, TimedValidator, Validator};
pub use verdict::{
    Approval, BookingOutcome, BookingRequest, CallerContext, CancelMode, CancellationApproval,
    FailedCheck, Rejection, RejectionDetail, SessionRequest, TimedRequest, Verdict,
};

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::services::Services;
use crate::wal::{Wal, WalLock};

pub type SharedTrainerState = Arc<RwLock<TrainerState>>;

type FacilityKey = (ClassType, NaiveDate, SessionSlot);
type Responder = oneshot::Sender<io::Result<()>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append { event: Event, response: Responder },
    Compact { events: Vec<Event>, response: Responder },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
    #[cfg(test)]
    FailAppendsAfter { appends: Option<u64>, response: oneshot::Sender<()> },
}

/// Owns the WAL. Every append that is already queued when the first one
/// arrives rides along in the same fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Responder)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't bleed into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch {
        let _ = tx.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailAppendsAfter { appends, response } => {
            wal.fail_appends_after(appends);
            let _ = response.send(());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Reverse lookups maintained alongside the per-trainer state.
#[derive(Default)]
pub(super) struct Index {
    /// booking id → trainer id
    pub(super) bookings: DashMap<Ulid, Ulid>,
    /// admin block id → trainer id
    pub(super) blocks: DashMap<Ulid, Ulid>,
    /// user id → booking ids
    pub(super) users: DashMap<Ulid, Vec<Ulid>>,
}

/// Apply an event to a trainer's state (no locking, caller holds the lock).
fn apply_to_trainer(ts: &mut TrainerState, event: &Event, index: &Index) {
    match event {
        Event::ShiftSet { shift } => {
            ts.shifts.insert(shift.weekday, shift.clone());
        }
        Event::DayOffSet {
            weekday, is_day_off, ..
        } => {
            ts.day_offs.insert(*weekday, *is_day_off);
        }
        Event::BlockAdded { block } => {
            ts.blocks.push(block.clone());
            index.blocks.insert(block.id, ts.id);
        }
        Event::BlockRemoved { id, .. } => {
            ts.blocks.retain(|b| b.id != *id);
            index.blocks.remove(id);
        }
        Event::BookingCreated { booking } => {
            ts.insert_booking(booking.clone());
            index.bookings.insert(booking.id, ts.id);
            let mut ids = index.users.entry(booking.user_id).or_default();
            if !ids.contains(&booking.id) {
                ids.push(booking.id);
            }
        }
        Event::BookingRescheduled { id, span, .. } => {
            if let Some(mut b) = ts.remove_booking(*id) {
                b.span = *span;
                // A moved session booking is an ordinary timed booking from now on.
                b.session = None;
                b.status = BookingStatus::Confirmed;
                b.unavailable_marked_at = None;
                ts.insert_booking(b);
            }
        }
        Event::BookingBlocked { id, at, .. } => {
            if let Some(b) = ts.booking_mut(*id) {
                b.status = BookingStatus::Blocked;
                b.unavailable_marked_at = Some(*at);
            }
        }
        Event::BookingRestored { id, .. } => {
            if let Some(b) = ts.booking_mut(*id) {
                b.status = BookingStatus::Confirmed;
                b.unavailable_marked_at = None;
            }
        }
        Event::BookingCancelled { id, at, .. } => {
            if let Some(b) = ts.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(*at);
            }
        }
        Event::BookingCompleted { id, .. } => {
            if let Some(b) = ts.booking_mut(*id) {
                b.status = BookingStatus::Completed;
            }
        }
    }
}

/// The booking store: per-trainer calendars behind their own locks, an
/// event log for durability, and the collaborators validation calls out to.
pub struct Engine {
    pub state: DashMap<Ulid, SharedTrainerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) index: Index,
    /// Held shared by every mutation and exclusively by compaction.
    write_gate: RwLock<()>,
    user_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    facility_locks: DashMap<FacilityKey, Arc<Mutex<()>>>,
    pub(super) shifts: ShiftResolver,
    pub(super) services: Services,
    pub(super) config: EngineConfig,
    _owner: WalLock,
}

impl Engine {
    /// Take ownership of `wal_path`, replay it and start the WAL writer. Fails
    /// with `WouldBlock` while another engine owns the same log. Must run inside
    /// a tokio runtime.
    pub fn new(wal_path: PathBuf, services: Services, config: EngineConfig) -> io::Result<Self> {
        Self::with_resolver(wal_path, services, config, ShiftResolver::default())
    }

    pub fn with_resolver(
        wal_path: PathBuf,
        services: Services,
        config: EngineConfig,
        shifts: ShiftResolver,
    ) -> io::Result<Self> {
        let owner = WalLock::acquire(&wal_path)?;
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let index = Index::default();
        let mut trainers: HashMap<Ulid, TrainerState> = HashMap::new();
        for event in &events {
            let tid = event.trainer_id();
            let ts = trainers.entry(tid).or_insert_with(|| TrainerState::new(tid));
            apply_to_trainer(ts, event, &index);
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events for {} trainers from {}",
                events.len(),
                trainers.len(),
                wal_path.display()
            );
        }

        let state = DashMap::new();
        for (id, ts) in trainers {
            state.insert(id, Arc::new(RwLock::new(ts)));
        }

        Ok(Self {
            state,
            wal_tx,
            index,
            write_gate: RwLock::new(()),
            user_locks: DashMap::new(),
            facility_locks: DashMap::new(),
            shifts,
            services,
            config,
            _owner: owner,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub(super) fn now(&self) -> Ms {
        self.services.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply. Nothing changes in memory if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TrainerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_trainer(ts, event, &self.index);
        Ok(())
    }

    /// Taken first by every mutating entry point.
    pub(super) async fn begin_write(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    pub fn trainer_state(&self, id: &Ulid) -> Option<SharedTrainerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// A trainer with no stored rows still has a calendar (default window).
    pub(super) fn trainer_state_or_default(&self, id: Ulid) -> SharedTrainerState {
        self.state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(TrainerState::new(id))))
            .value()
            .clone()
    }

    pub fn trainer_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.index.bookings.get(booking_id).map(|e| *e.value())
    }

    /// Lookup booking → trainer, acquire that trainer's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TrainerState>, EngineError> {
        let trainer_id = self
            .trainer_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ts = self
            .trainer_state(&trainer_id)
            .ok_or(EngineError::NotFound(trainer_id))?;
        Ok(ts.write_owned().await)
    }

    pub(super) fn user_lock(&self, user_id: Ulid) -> Arc<Mutex<()>> {
        self.user_locks.entry(user_id).or_default().value().clone()
    }

    pub(super) fn facility_lock(&self, key: FacilityKey) -> Arc<Mutex<()>> {
        self.facility_locks.entry(key).or_default().value().clone()
    }

    /// Drop advisory locks nobody holds. Returns how many went.
    pub fn prune_idle_locks(&self) -> usize {
        let mut pruned = 0;
        self.user_locks.retain(|_, lock| {
            let held = Arc::strong_count(lock) > 1;
            pruned += usize::from(!held);
            held
        });
        self.facility_locks.retain(|_, lock| {
            let held = Arc::strong_count(lock) > 1;
            pruned += usize::from(!held);
            held
        });
        pruned
    }

    #[cfg(test)]
    pub(super) async fn fail_wal_appends_after(&self, appends: Option<u64>) {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::FailAppendsAfter { appends, response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// All of a user's bookings across trainers, sorted by start. Takes one
    /// trainer read lock at a time; never call while holding a trainer lock.
    pub(super) async fn user_snapshot(&self, user_id: Ulid) -> Vec<Booking> {
        let booking_ids = self
            .index
            .users
            .get(&user_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let trainer_ids: BTreeSet<Ulid> = booking_ids
            .iter()
            .filter_map(|id| self.trainer_for_booking(id))
            .collect();

        let mut out = Vec::with_capacity(booking_ids.len());
        for tid in trainer_ids {
            let Some(ts) = self.trainer_state(&tid) else { continue };
            let guard = ts.read().await;
            out.extend(guard.bookings.iter().filter(|b| b.user_id == user_id).cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    /// Arcs for every trainer, cloned out so no map guard is held across awaits.
    pub(super) fn all_trainers(&self) -> Vec<SharedTrainerState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }
}
