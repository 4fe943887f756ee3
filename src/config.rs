use std::path::PathBuf;
use std::str::FromStr;

use crate::model::{HOUR_MS, MINUTE_MS, Ms};

/// Business rules the engine enforces. Read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Padding stored on each new time-based booking.
    pub default_buffer_minutes: u32,
    /// How far ahead a session may be booked.
    pub booking_horizon_days: u32,
    /// Minimum notice before a user may cancel a confirmed session.
    pub cancellation_lead_hours: i64,
    /// How long a blocked booking waits for the user before the sweep cancels it.
    pub block_grace_hours: i64,
    /// Weekly limit when the plan carries none.
    pub default_weekly_hours: u32,
    pub min_session_minutes: i64,
    /// Distinct trainers allowed per (class, date, session) in the legacy scheme.
    pub legacy_facility_capacity: usize,
    /// Confirmed legacy sessions allowed per user per week.
    pub legacy_weekly_bookings: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_buffer_minutes: 10,
            booking_horizon_days: 30,
            cancellation_lead_hours: 12,
            block_grace_hours: 24,
            default_weekly_hours: 48,
            min_session_minutes: 30,
            legacy_facility_capacity: 2,
            legacy_weekly_bookings: 12,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            default_buffer_minutes: parse_or(&lookup, "GYMBOOK_DEFAULT_BUFFER_MINUTES", d.default_buffer_minutes)
                .min(crate::limits::MAX_BUFFER_MINUTES),
            booking_horizon_days: parse_or(&lookup, "GYMBOOK_BOOKING_HORIZON_DAYS", d.booking_horizon_days)
                .min(crate::limits::MAX_HORIZON_DAYS),
            cancellation_lead_hours: parse_or(&lookup, "GYMBOOK_CANCELLATION_LEAD_HOURS", d.cancellation_lead_hours),
            block_grace_hours: parse_or(&lookup, "GYMBOOK_BLOCK_GRACE_HOURS", d.block_grace_hours),
            default_weekly_hours: parse_or(&lookup, "GYMBOOK_DEFAULT_WEEKLY_HOURS", d.default_weekly_hours),
            min_session_minutes: parse_or(&lookup, "GYMBOOK_MIN_SESSION_MINUTES", d.min_session_minutes),
            legacy_facility_capacity: parse_or(&lookup, "GYMBOOK_LEGACY_FACILITY_CAPACITY", d.legacy_facility_capacity),
            legacy_weekly_bookings: parse_or(&lookup, "GYMBOOK_LEGACY_WEEKLY_BOOKINGS", d.legacy_weekly_bookings),
        }
    }

    pub fn cancellation_lead_ms(&self) -> Ms {
        self.cancellation_lead_hours * HOUR_MS
    }

    pub fn block_grace_ms(&self) -> Ms {
        self.block_grace_hours * HOUR_MS
    }

    pub fn min_session_ms(&self) -> Ms {
        self.min_session_minutes * MINUTE_MS
    }
}

/// Process-level settings for the sweeper daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Seconds between sweeps. Zero runs a single sweep and exits.
    pub sweep_interval_secs: u64,
    pub compact_threshold: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            sweep_interval_secs: 3600,
            compact_threshold: 1000,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            data_dir: lookup("GYMBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: lookup("GYMBOOK_METRICS_PORT").and_then(|s| s.parse().ok()),
            sweep_interval_secs: parse_or(&lookup, "GYMBOOK_SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
            compact_threshold: parse_or(&lookup, "GYMBOOK_COMPACT_THRESHOLD", d.compact_threshold),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}
