//! Activity counters: an external enable/disable gate for checks.
//!
//! A counter is incremented when some job starts and decremented when it
//! ends. While the count is positive the check's run window is open, shifted
//! by the check's `run_delay`.

use crate::db::{queries, ActivityCounter, Check, DbError, Store};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Check not found")]
    NotFound,
    #[error("{0}")]
    Ambiguous(String),
    #[error("invalid counter action '{0}'")]
    InvalidAction(String),
}

impl ActivityCounter {
    pub fn increment(&mut self, now: DateTime<Utc>) {
        if self.count == 0 {
            self.last_enabled = Some(now);
        }
        self.count += 1;
    }

    pub fn decrement(&mut self, now: DateTime<Utc>) {
        if self.count == 1 {
            self.last_disabled = Some(now);
        }
        self.count = self.count.saturating_sub(1);
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        if self.count > 0 {
            self.last_disabled = Some(now);
        }
        self.count = 0;
    }

    pub fn enabled(&self) -> bool {
        self.count > 0
    }
}

/// Load or create the counter of a check, apply `f` and save it, all under
/// the database write lock.
pub fn update<F>(
    store: &Store,
    check_id: i64,
    f: F,
) -> Result<ActivityCounter, DbError>
where
    F: FnOnce(&mut ActivityCounter),
{
    store.transaction(|conn| {
        let mut counter = queries::get_or_create_counter(conn, check_id)?;
        f(&mut counter);
        queries::save_counter(conn, &counter)?;
        Ok(counter)
    })
}

pub fn increment(store: &Store, check_id: i64, now: DateTime<Utc>) -> Result<ActivityCounter, DbError> {
    update(store, check_id, |c| c.increment(now))
}

pub fn decrement(store: &Store, check_id: i64, now: DateTime<Utc>) -> Result<ActivityCounter, DbError> {
    update(store, check_id, |c| c.decrement(now))
}

pub fn reset(store: &Store, check_id: i64, now: DateTime<Utc>) -> Result<ActivityCounter, DbError> {
    update(store, check_id, |c| c.reset(now))
}

/// Operator action on a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterAction {
    Read,
    Increment,
    Decrement,
    Reset,
}

impl FromStr for CounterAction {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "read" => Ok(CounterAction::Read),
            "incr" => Ok(CounterAction::Increment),
            "decr" => Ok(CounterAction::Decrement),
            "reset" => Ok(CounterAction::Reset),
            other => Err(CounterError::InvalidAction(other.to_string())),
        }
    }
}

/// State of a counter after an action, as reported back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CounterReport {
    pub check_id: i64,
    pub check_name: String,
    pub run_delay: u32,
    pub count: u32,
    pub enabled: bool,
    pub last_enabled: Option<DateTime<Utc>>,
    pub last_disabled: Option<DateTime<Utc>>,
    pub detail: String,
}

/// Resolve a check by ID, or by name when no ID is given.
pub fn lookup_check(store: &Store, id: Option<i64>, name: Option<&str>) -> Result<Check, CounterError> {
    if let Some(id) = id {
        return match store.get_check(id) {
            Ok(check) => Ok(check),
            Err(DbError::NotFound) => Err(CounterError::NotFound),
            Err(e) => Err(e.into()),
        };
    }

    let name = name.ok_or(CounterError::NotFound)?;
    let mut checks = store.find_checks_by_name(name)?;
    match checks.len() {
        0 => Err(CounterError::NotFound),
        1 => Ok(checks.remove(0)),
        _ => Err(CounterError::Ambiguous(format!(
            "Multiple checks found with name '{}'",
            name
        ))),
    }
}

/// Apply an operator action to a check's counter.
pub fn apply_action(
    store: &Store,
    check: &Check,
    action: CounterAction,
    now: DateTime<Utc>,
) -> Result<CounterReport, CounterError> {
    let (counter, detail) = match action {
        CounterAction::Read => {
            let counter = store
                .get_counter(check.id)?
                .unwrap_or_else(|| ActivityCounter::new(check.id));
            (counter, String::new())
        }
        CounterAction::Increment => {
            let counter = increment(store, check.id, now)?;
            let detail = format!("counter incremented to {}", counter.count);
            (counter, detail)
        }
        CounterAction::Decrement => {
            let counter = decrement(store, check.id, now)?;
            let detail = format!("counter decremented to {}", counter.count);
            (counter, detail)
        }
        CounterAction::Reset => {
            let counter = reset(store, check.id, now)?;
            (counter, "counter reset to 0".to_string())
        }
    };

    if action != CounterAction::Read {
        tracing::info!(check = %check.name, check_id = check.id, count = counter.count, "{}", detail);
    }

    Ok(CounterReport {
        check_id: check.id,
        check_name: check.name.clone(),
        run_delay: check.run_delay,
        count: counter.count,
        enabled: counter.enabled(),
        last_enabled: counter.last_enabled,
        last_disabled: counter.last_disabled,
        detail,
    })
}
