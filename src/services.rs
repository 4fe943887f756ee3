//! Interfaces to the collaborators the engine consumes but does not own,
//! plus an in-memory implementation used by tests and the sweeper binary.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::ClassType;
use crate::notify::NotificationService;
use crate::time;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError(pub String);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collaborator error: {}", self.0)
    }
}

impl std::error::Error for ServiceError {}

/// Membership plan inputs relevant to booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipQuota {
    pub user_id: Ulid,
    /// `None` means the plan does not say; the engine's default applies.
    pub weekly_hour_limit: Option<u32>,
    pub plan_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub grace_days: u32,
}

impl MembershipQuota {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date + Duration::days(self.grace_days as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerProfile {
    pub id: Ulid,
    pub name: String,
    pub specialization: ClassType,
    /// False once soft-deleted or deactivated.
    pub active: bool,
}

#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn is_active(&self, user_id: Ulid) -> Result<bool, ServiceError>;
    async fn active_quota(&self, user_id: Ulid) -> Result<Option<MembershipQuota>, ServiceError>;
}

#[async_trait]
pub trait TrainerDirectory: Send + Sync {
    async fn trainer(&self, trainer_id: Ulid) -> Result<Option<TrainerProfile>, ServiceError>;

    /// Active trainers teaching `class_type`, ordered by name.
    async fn trainers_with_specialization(
        &self,
        class_type: ClassType,
    ) -> Result<Vec<TrainerProfile>, ServiceError>;
}

/// Everything the engine calls out to, bundled for constructor injection.
#[derive(Clone)]
pub struct Services {
    pub membership: Arc<dyn MembershipService>,
    pub trainers: Arc<dyn TrainerDirectory>,
    pub notifications: Arc<dyn NotificationService>,
    pub clock: Arc<dyn Clock>,
}

/// In-process directory of memberships and trainers.
pub struct InMemoryDirectory {
    memberships: DashMap<Ulid, MembershipQuota>,
    trainers: DashMap<Ulid, TrainerProfile>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDirectory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            memberships: DashMap::new(),
            trainers: DashMap::new(),
            clock,
        }
    }

    pub fn put_membership(&self, quota: MembershipQuota) {
        self.memberships.insert(quota.user_id, quota);
    }

    pub fn remove_membership(&self, user_id: &Ulid) {
        self.memberships.remove(user_id);
    }

    pub fn put_trainer(&self, profile: TrainerProfile) {
        self.trainers.insert(profile.id, profile);
    }

    fn today(&self) -> NaiveDate {
        time::local_date(self.clock.now_ms())
    }
}

#[async_trait]
impl MembershipService for InMemoryDirectory {
    async fn is_active(&self, user_id: Ulid) -> Result<bool, ServiceError> {
        Ok(self.active_quota(user_id).await?.is_some())
    }

    async fn active_quota(&self, user_id: Ulid) -> Result<Option<MembershipQuota>, ServiceError> {
        let today = self.today();
        Ok(self
            .memberships
            .get(&user_id)
            .filter(|m| m.is_active_on(today))
            .map(|m| m.value().clone()))
    }
}

#[async_trait]
impl TrainerDirectory for InMemoryDirectory {
    async fn trainer(&self, trainer_id: Ulid) -> Result<Option<TrainerProfile>, ServiceError> {
        Ok(self.trainers.get(&trainer_id).map(|t| t.value().clone()))
    }

    async fn trainers_with_specialization(
        &self,
        class_type: ClassType,
    ) -> Result<Vec<TrainerProfile>, ServiceError> {
        let mut out: Vec<TrainerProfile> = self
            .trainers
            .iter()
            .filter(|t| t.active && t.specialization == class_type)
            .map(|t| t.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
