//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use super::queries;

/// Format used for every timestamp column. Fixed width, so text order is time order.
const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create a private in-memory store.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Run read-only queries on the shared connection.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DbError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// The store mutex serializes writers in this process and `BEGIN IMMEDIATE`
    /// takes the database write lock, so other processes wait too. The
    /// transaction commits only when `f` returns `Ok`.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DbError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DbError::from)?;
        Ok(value)
    }

    // --- Check CRUD ---

    /// Add a new check and return its ID.
    pub fn add_check(&self, check: &mut Check) -> Result<i64, DbError> {
        normalize_check(check)?;
        let id = self.transaction(|conn| {
            ensure_unique_counter_name(conn, check, 0)?;
            queries::insert_check(conn, check)
        })?;
        check.id = id;
        Ok(id)
    }

    /// Update an existing check's configuration.
    pub fn update_check(&self, check: &Check) -> Result<(), DbError> {
        let mut check = check.clone();
        normalize_check(&mut check)?;
        self.transaction(|conn| {
            ensure_unique_counter_name(conn, &check, check.id)?;
            queries::update_check(conn, &check)
        })
    }

    /// Get a check by ID.
    pub fn get_check(&self, id: i64) -> Result<Check, DbError> {
        self.read(|conn| queries::get_check(conn, id))
    }

    /// Get all checks.
    pub fn list_checks(&self) -> Result<Vec<Check>, DbError> {
        self.read(|conn| queries::list_checks(conn, false))
    }

    pub fn list_active_checks(&self) -> Result<Vec<Check>, DbError> {
        self.read(|conn| queries::list_checks(conn, true))
    }

    pub fn find_checks_by_name(&self, name: &str) -> Result<Vec<Check>, DbError> {
        self.read(|conn| queries::find_checks_by_name(conn, name))
    }

    /// Delete a check with its results, counter and acknowledgements.
    pub fn delete_check(&self, id: i64) -> Result<(), DbError> {
        self.transaction(|conn| match queries::delete_check(conn, id)? {
            0 => Err(DbError::NotFound),
            _ => Ok(()),
        })
    }

    /// Copy a check under the name `Copy of <name>`, keeping its service memberships.
    pub fn duplicate_check(&self, id: i64) -> Result<Check, DbError> {
        self.transaction(|conn| {
            let mut copy = queries::get_check(conn, id)?;
            copy.name = format!("Copy of {}", copy.name);
            copy.last_run = None;
            copy.calculated_status = CheckStatus::Passing;
            copy.cached_health = String::new();
            ensure_unique_counter_name(conn, &copy, 0)?;

            copy.id = queries::insert_check(conn, &copy)?;
            for service_id in queries::service_ids_for_check(conn, id)? {
                queries::add_check_to_service(conn, service_id, copy.id)?;
            }
            Ok(copy)
        })
    }

    /// Most recent results of a check, newest first.
    pub fn recent_results(&self, check_id: i64, limit: usize) -> Result<Vec<CheckResult>, DbError> {
        self.read(|conn| queries::recent_results(conn, check_id, limit))
    }

    pub fn get_counter(&self, check_id: i64) -> Result<Option<ActivityCounter>, DbError> {
        self.read(|conn| queries::get_counter(conn, check_id))
    }

    // --- Schedules ---

    pub fn add_schedule(&self, schedule: &mut Schedule) -> Result<i64, DbError> {
        let id = self.transaction(|conn| queries::insert_schedule(conn, schedule))?;
        schedule.id = id;
        Ok(id)
    }

    pub fn get_schedule(&self, id: i64) -> Result<Schedule, DbError> {
        self.read(|conn| queries::get_schedule(conn, id))
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>, DbError> {
        self.read(queries::list_schedules)
    }

    /// Add a shift, replacing any shift of the same schedule with the same `uid`.
    pub fn add_shift(&self, shift: &mut Shift) -> Result<i64, DbError> {
        if shift.end <= shift.start {
            return Err(DbError::Config("shift must end after it starts".to_string()));
        }
        let id = self.transaction(|conn| queries::upsert_shift(conn, shift))?;
        shift.id = id;
        Ok(id)
    }

    pub fn list_shifts(&self, schedule_id: i64) -> Result<Vec<Shift>, DbError> {
        self.read(|conn| queries::list_shifts(conn, schedule_id))
    }

    // --- Services ---

    /// Add a new service with its links and return its ID.
    pub fn add_service(&self, service: &mut Service) -> Result<i64, DbError> {
        let id = self.transaction(|conn| queries::insert_service(conn, service))?;
        service.id = id;
        Ok(id)
    }

    pub fn get_service(&self, id: i64) -> Result<Service, DbError> {
        self.read(|conn| queries::get_service(conn, id))
    }

    pub fn list_services(&self) -> Result<Vec<Service>, DbError> {
        self.read(|conn| {
            queries::list_service_ids(conn)?
                .into_iter()
                .map(|id| queries::get_service(conn, id))
                .collect()
        })
    }

    /// IDs of the services that contain a check.
    pub fn services_for_check(&self, check_id: i64) -> Result<Vec<i64>, DbError> {
        self.read(|conn| queries::service_ids_for_check(conn, check_id))
    }

    /// Delete a service together with its snapshots and links.
    pub fn delete_service(&self, id: i64) -> Result<(), DbError> {
        self.transaction(|conn| match queries::delete_service(conn, id)? {
            0 => Err(DbError::NotFound),
            _ => Ok(()),
        })
    }

    /// Snapshots of a service taken after `since`, oldest first.
    pub fn recent_snapshots(
        &self,
        service_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, DbError> {
        self.read(|conn| queries::snapshots_since(conn, service_id, since))
    }
}

fn normalize_check(check: &mut Check) -> Result<(), DbError> {
    if check.frequency == 0 {
        check.frequency = DEFAULT_CHECK_FREQUENCY;
    }
    if check.name.trim().is_empty() {
        return Err(DbError::Config("check name must not be empty".to_string()));
    }
    check
        .probe
        .validate()
        .map_err(|e| DbError::Config(e.to_string()))
}

fn ensure_unique_counter_name(conn: &Connection, check: &Check, exclude_id: i64) -> Result<(), DbError> {
    if !check.use_activity_counter {
        return Ok(());
    }
    match queries::counter_name_conflict(conn, &check.name, exclude_id)? {
        Some(other) => Err(DbError::Config(format!(
            "check name '{}' is already used by activity-counter check {}",
            check.name, other
        ))),
        None => Ok(()),
    }
}

/// Format a timestamp for storage.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
