//! Database model types.

use crate::probe::ProbeSpec;
use crate::run_window::RunWindow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default minutes between runs of a check.
pub const DEFAULT_CHECK_FREQUENCY: u32 = 5;
/// Default number of failures tolerated before a check is failing.
pub const DEFAULT_CHECK_RETRIES: u32 = 0;
/// Upper bound on stored raw probe output, in bytes.
pub const RAW_DATA_LIMIT: usize = 500_000;

/// Severity of a check failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Importance {
    Warning,
    Error,
    Critical,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Warning => "WARNING",
            Importance::Error => "ERROR",
            Importance::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WARNING" => Ok(Importance::Warning),
            "ERROR" => Ok(Importance::Error),
            "CRITICAL" => Ok(Importance::Critical),
            other => Err(format!("unknown importance '{}'", other)),
        }
    }
}

/// Retry-tolerant health verdict of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Acked,
    /// Recognized but never derived.
    Intermittent,
    Failing,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passing => "passing",
            CheckStatus::Acked => "acked",
            CheckStatus::Intermittent => "intermittent",
            CheckStatus::Failing => "failing",
        }
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passing" => Ok(CheckStatus::Passing),
            "acked" => Ok(CheckStatus::Acked),
            "intermittent" => Ok(CheckStatus::Intermittent),
            "failing" => Ok(CheckStatus::Failing),
            other => Err(format!("unknown check status '{}'", other)),
        }
    }
}

/// Overall status of a service, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Passing,
    Acked,
    Warning,
    Error,
    Critical,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Passing => "PASSING",
            ServiceStatus::Acked => "ACKED",
            ServiceStatus::Warning => "WARNING",
            ServiceStatus::Error => "ERROR",
            ServiceStatus::Critical => "CRITICAL",
        }
    }
}

impl From<Importance> for ServiceStatus {
    fn from(importance: Importance) -> Self {
        match importance {
            Importance::Warning => ServiceStatus::Warning,
            Importance::Error => ServiceStatus::Error,
            Importance::Critical => ServiceStatus::Critical,
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASSING" => Ok(ServiceStatus::Passing),
            "ACKED" => Ok(ServiceStatus::Acked),
            "WARNING" => Ok(ServiceStatus::Warning),
            "ERROR" => Ok(ServiceStatus::Error),
            "CRITICAL" => Ok(ServiceStatus::Critical),
            other => Err(format!("unknown service status '{}'", other)),
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: i64,
    pub name: String,
    pub active: bool,
    /// Minutes between runs.
    pub frequency: u32,
    pub retries: u32,
    pub importance: Importance,
    pub last_run: Option<DateTime<Utc>>,
    pub calculated_status: CheckStatus,
    /// Minutes the activity-counter window is shifted by.
    pub run_delay: u32,
    pub use_activity_counter: bool,
    pub run_window: RunWindow,
    pub probe: ProbeSpec,
    /// Recent results as `1`/`-1`, oldest first.
    pub cached_health: String,
    pub runbook: Option<String>,
}

impl Default for Check {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            active: true,
            frequency: DEFAULT_CHECK_FREQUENCY,
            retries: DEFAULT_CHECK_RETRIES,
            importance: Importance::Error,
            last_run: None,
            calculated_status: CheckStatus::Passing,
            run_delay: 0,
            use_activity_counter: false,
            run_window: RunWindow::default(),
            probe: ProbeSpec::default(),
            cached_health: String::new(),
            runbook: None,
        }
    }
}

/// One execution outcome of a check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: i64,
    pub check_id: i64,
    pub time: DateTime<Utc>,
    pub time_complete: DateTime<Utc>,
    pub succeeded: bool,
    pub error: Option<String>,
    pub tags: Vec<String>,
    pub acked: bool,
    pub raw_data: Option<String>,
}

impl CheckResult {
    pub fn status(&self) -> &'static str {
        if self.succeeded {
            "succeeded"
        } else {
            "failed"
        }
    }

    /// Milliseconds between start and completion.
    pub fn took_ms(&self) -> i64 {
        (self.time_complete - self.time).num_milliseconds()
    }
}

/// External enable/disable gate for a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounter {
    pub check_id: i64,
    pub count: u32,
    pub last_enabled: Option<DateTime<Utc>>,
    pub last_disabled: Option<DateTime<Utc>>,
}

impl ActivityCounter {
    pub fn new(check_id: i64) -> Self {
        Self {
            check_id,
            count: 0,
            last_enabled: None,
            last_disabled: None,
        }
    }
}

/// How an acknowledgement decides whether it covers a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Any result of the acknowledged check.
    #[default]
    Check,
    /// Results whose tags are all among the acknowledgement's tags.
    AllTagsIn,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Check => "check",
            MatchMode::AllTagsIn => "all_tags_in",
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check" => Ok(MatchMode::Check),
            "all_tags_in" => Ok(MatchMode::AllTagsIn),
            other => Err(format!("unknown match mode '{}'", other)),
        }
    }
}

/// Operator suppression of a check's alerting. Open while `closed_at` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub id: i64,
    pub check_id: i64,
    pub match_if: MatchMode,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_reason: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
    /// Zero or `None` disables closing on success.
    pub close_after_successes: Option<u32>,
}

impl Acknowledgement {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// An aggregate over a set of checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub overall_status: ServiceStatus,
    pub old_overall_status: ServiceStatus,
    pub last_alert_sent: Option<DateTime<Utc>>,
    pub alerts_enabled: bool,
    pub check_ids: Vec<i64>,
    /// On-call schedules, in order.
    pub schedule_ids: Vec<i64>,
    /// Names of registered alert channels.
    pub channels: Vec<String>,
    pub users_to_notify: Vec<String>,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            url: String::new(),
            overall_status: ServiceStatus::Passing,
            old_overall_status: ServiceStatus::Passing,
            last_alert_sent: None,
            alerts_enabled: true,
            check_ids: Vec::new(),
            schedule_ids: Vec::new(),
            channels: Vec::new(),
            users_to_notify: Vec::new(),
        }
    }
}

/// Point-in-time record of a service's aggregate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub service_id: i64,
    pub time: DateTime<Utc>,
    pub num_checks_active: i64,
    pub num_checks_passing: i64,
    pub num_checks_failing: i64,
    pub overall_status: ServiceStatus,
    pub did_send_alert: bool,
}

/// An on-call rotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub fallback_officer: Option<String>,
}

/// A single on-call shift. Deleted shifts are kept but ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
    pub id: i64,
    pub schedule_id: i64,
    pub uid: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub user: String,
    pub deleted: bool,
}
