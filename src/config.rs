use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::access::AccessConfig;
use crate::limits::{MAX_COMMIT_ATTEMPTS, MIN_SLOT_STEP_MS};
use crate::model::{MINUTE_MS, Ms};

/// Knobs of the scheduling engine, injected at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default bound on lock waits and validation when the caller sets none.
    pub request_timeout: Duration,
    /// Single lock-wait attempt before backing off and retrying.
    pub lock_wait: Duration,
    pub max_commit_attempts: u32,
    /// Slot step when neither the query nor the employee sets one.
    pub default_slot_step: Option<Ms>,
    /// Bookings must lie inside employee ∩ branch availability. Turn off to
    /// accept bookings outside working hours.
    pub require_schedule_fit: bool,
    /// When set, appointments may not start more than this far in the past,
    /// and started appointments can no longer be cancelled.
    pub past_booking_grace: Option<Ms>,
    pub access: AccessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            lock_wait: Duration::from_millis(250),
            max_commit_attempts: 8,
            default_slot_step: None,
            require_schedule_fit: true,
            past_booking_grace: None,
            access: AccessConfig::default(),
        }
    }
}

/// Process configuration, read once from `AGENDA_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str, default: bool| lookup(key).and_then(|v| parse_flag(&v)).unwrap_or(default);

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            request_timeout: parsed("AGENDA_REQUEST_TIMEOUT_MS")
                .map_or(defaults.request_timeout, Duration::from_millis),
            lock_wait: parsed("AGENDA_LOCK_WAIT_MS").map_or(defaults.lock_wait, Duration::from_millis),
            max_commit_attempts: parsed("AGENDA_MAX_COMMIT_ATTEMPTS")
                .map_or(defaults.max_commit_attempts, |n| n.clamp(1, MAX_COMMIT_ATTEMPTS as u64) as u32),
            default_slot_step: parsed("AGENDA_SLOT_STEP_MINUTES")
                .map(|m| (m as Ms * MINUTE_MS).max(MIN_SLOT_STEP_MS)),
            require_schedule_fit: flag("AGENDA_REQUIRE_SCHEDULE_FIT", defaults.require_schedule_fit),
            past_booking_grace: parsed("AGENDA_PAST_BOOKING_GRACE_MS").map(|ms| ms.min(Ms::MAX as u64) as Ms),
            access: AccessConfig {
                conceal_cross_tenant: flag("AGENDA_CONCEAL_CROSS_TENANT", defaults.access.conceal_cross_tenant),
                client_self_booking: flag("AGENDA_CLIENT_SELF_BOOKING", defaults.access.client_self_booking),
            },
        };

        Self {
            data_dir: lookup("AGENDA_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            metrics_port: lookup("AGENDA_METRICS_PORT").and_then(|v| u16::from_str(v.trim()).ok()),
            compact_threshold: parsed("AGENDA_COMPACT_THRESHOLD").unwrap_or(1000),
            engine,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("agenda.wal")
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
