//! Configuration module for Vigil.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::service::AlertIntervals;

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file (default: "vigil.db")
    pub db_path: String,
    /// Seconds between scheduler ticks (default: 30)
    pub tick_secs: u64,
    /// Outer bound on a single probe call (default: 60)
    pub probe_timeout_secs: u64,
    /// Checks allowed to run at once (default: 8)
    pub max_concurrent_checks: usize,
    /// Cooldown for a sustained warning, in minutes (default: 120)
    pub notification_interval_mins: i64,
    /// Cooldown for a sustained error or critical status, in minutes (default: 10)
    pub alert_interval_mins: i64,
    /// Seconds between expired-acknowledgement sweeps (default: 60)
    pub ack_sweep_secs: u64,
    /// Recipients for services without on-call schedules
    pub default_recipients: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "vigil.db".to_string(),
            tick_secs: 30,
            probe_timeout_secs: 60,
            max_concurrent_checks: 8,
            notification_interval_mins: 120,
            alert_interval_mins: 10,
            ack_sweep_secs: 60,
            default_recipients: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `VIGIL_DB_PATH`: Database file path (default: "vigil.db")
    /// - `VIGIL_TICK_SECS`: Scheduler tick (default: 30)
    /// - `VIGIL_PROBE_TIMEOUT_SECS`: Probe timeout (default: 60)
    /// - `VIGIL_MAX_CONCURRENT_CHECKS`: Parallel checks (default: 8)
    /// - `VIGIL_NOTIFICATION_INTERVAL_MINS`: Warning cooldown (default: 120)
    /// - `VIGIL_ALERT_INTERVAL_MINS`: Error/critical cooldown (default: 10)
    /// - `VIGIL_ACK_SWEEP_SECS`: Acknowledgement sweep period (default: 60)
    /// - `VIGIL_DEFAULT_RECIPIENTS`: Comma-separated usernames (default: none)
    ///
    /// Malformed values are ignored.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("VIGIL_DB_PATH") {
            cfg.db_path = db_path;
        }
        set_parsed(&lookup, "VIGIL_TICK_SECS", &mut cfg.tick_secs);
        set_parsed(&lookup, "VIGIL_PROBE_TIMEOUT_SECS", &mut cfg.probe_timeout_secs);
        set_parsed(&lookup, "VIGIL_MAX_CONCURRENT_CHECKS", &mut cfg.max_concurrent_checks);
        set_minutes(
            &lookup,
            "VIGIL_NOTIFICATION_INTERVAL_MINS",
            &mut cfg.notification_interval_mins,
        );
        set_minutes(&lookup, "VIGIL_ALERT_INTERVAL_MINS", &mut cfg.alert_interval_mins);
        set_parsed(&lookup, "VIGIL_ACK_SWEEP_SECS", &mut cfg.ack_sweep_secs);

        if let Some(recipients) = lookup("VIGIL_DEFAULT_RECIPIENTS") {
            cfg.default_recipients = recipients
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Zero would stall the tick loop or the semaphore.
        cfg.tick_secs = cfg.tick_secs.max(1);
        cfg.ack_sweep_secs = cfg.ack_sweep_secs.max(1);
        cfg.max_concurrent_checks = cfg.max_concurrent_checks.max(1);

        cfg
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn ack_sweep(&self) -> Duration {
        Duration::from_secs(self.ack_sweep_secs)
    }

    pub fn intervals(&self) -> AlertIntervals {
        let minutes = |m: i64| chrono::Duration::minutes(m.clamp(1, MAX_INTERVAL_MINS));
        AlertIntervals {
            notification_interval: minutes(self.notification_interval_mins),
            alert_interval: minutes(self.alert_interval_mins),
        }
    }
}

fn set_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring malformed {}={:?}", key, raw),
        }
    }
}

/// Longest accepted cooldown, one week.
pub const MAX_INTERVAL_MINS: i64 = 7 * 24 * 60;

fn set_minutes(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut i64) {
    let mut minutes = *slot;
    set_parsed(lookup, key, &mut minutes);
    if (1..=MAX_INTERVAL_MINS).contains(&minutes) {
        *slot = minutes;
    } else {
        tracing::warn!(
            "Ignoring {}={}, expected 1 to {} minutes",
            key,
            minutes,
            MAX_INTERVAL_MINS
        );
    }
}
