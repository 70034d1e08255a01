//! Row-level SQL shared by the store and the engine modules.
//!
//! Every function takes a plain connection so it can run inside
//! [`Store::transaction`](super::Store::transaction) or
//! [`Store::read`](super::Store::read).

use super::models::*;
use super::store::{format_db_time, parse_db_time, DbError};
use crate::run_window::RunWindow;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::str::FromStr;

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| conversion_error(idx, format!("invalid timestamp '{}'", s)))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("invalid timestamp '{}'", s))),
    }
}

fn parsed_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| conversion_error(idx, e))
}

// --- Checks ---

const CHECK_COLUMNS: &str = "id, name, active, frequency, retries, importance, last_run, \
     calculated_status, run_delay, use_activity_counter, run_window, probe, cached_health, runbook";

fn check_from_row(row: &Row<'_>) -> SqlResult<Check> {
    let run_window: String = row.get(10)?;
    let probe: String = row.get(11)?;

    Ok(Check {
        id: row.get(0)?,
        name: row.get(1)?,
        active: row.get(2)?,
        frequency: row.get(3)?,
        retries: row.get(4)?,
        importance: parsed_col(row, 5)?,
        last_run: opt_time_col(row, 6)?,
        calculated_status: parsed_col(row, 7)?,
        run_delay: row.get(8)?,
        use_activity_counter: row.get(9)?,
        run_window: RunWindow::decode(&run_window).map_err(|e| conversion_error(10, e.to_string()))?,
        probe: serde_json::from_str(&probe).map_err(|e| conversion_error(11, e.to_string()))?,
        cached_health: row.get(12)?,
        runbook: row.get(13)?,
    })
}

/// Collect decoded checks, skipping rows whose stored values no longer parse.
/// Errors from SQLite itself still abort the query.
fn decodable_checks(rows: impl Iterator<Item = SqlResult<Check>>) -> Result<Vec<Check>, DbError> {
    let mut checks = Vec::new();
    for row in rows {
        match row {
            Ok(check) => checks.push(check),
            Err(
                e @ (rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..)
                | rusqlite::Error::IntegralValueOutOfRange(..)),
            ) => tracing::warn!("Skipping check row that cannot be decoded: {}", e),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(checks)
}

fn encode_probe(check: &Check) -> Result<String, DbError> {
    serde_json::to_string(&check.probe).map_err(|e| DbError::InvalidData(e.to_string()))
}

pub fn insert_check(conn: &Connection, check: &Check) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO checks (name, active, frequency, retries, importance, last_run, calculated_status, \
         run_delay, use_activity_counter, run_window, probe, cached_health, runbook) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            check.name,
            check.active,
            check.frequency,
            check.retries,
            check.importance.as_str(),
            check.last_run.map(format_db_time),
            check.calculated_status.as_str(),
            check.run_delay,
            check.use_activity_counter,
            check.run_window.encode(),
            encode_probe(check)?,
            check.cached_health,
            check.runbook,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Update the configuration of a check. Derived fields are left alone.
pub fn update_check(conn: &Connection, check: &Check) -> Result<(), DbError> {
    let changed = conn.execute(
        "UPDATE checks SET name=?1, active=?2, frequency=?3, retries=?4, importance=?5, run_delay=?6, \
         use_activity_counter=?7, run_window=?8, probe=?9, runbook=?10 WHERE id=?11",
        params![
            check.name,
            check.active,
            check.frequency,
            check.retries,
            check.importance.as_str(),
            check.run_delay,
            check.use_activity_counter,
            check.run_window.encode(),
            encode_probe(check)?,
            check.runbook,
            check.id,
        ],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub fn get_check(conn: &Connection, id: i64) -> Result<Check, DbError> {
    conn.query_row(
        &format!("SELECT {} FROM checks WHERE id = ?1", CHECK_COLUMNS),
        params![id],
        check_from_row,
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

pub fn list_checks(conn: &Connection, active_only: bool) -> Result<Vec<Check>, DbError> {
    let filter = if active_only { "WHERE active = 1" } else { "" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM checks {} ORDER BY name, id",
        CHECK_COLUMNS, filter
    ))?;
    let checks = decodable_checks(stmt.query_map([], check_from_row)?)?;
    Ok(checks)
}

pub fn find_checks_by_name(conn: &Connection, name: &str) -> Result<Vec<Check>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM checks WHERE name = ?1 ORDER BY id",
        CHECK_COLUMNS
    ))?;
    let checks = decodable_checks(stmt.query_map(params![name], check_from_row)?)?;
    Ok(checks)
}

/// Id of another activity-counter check that already uses `name`.
pub fn counter_name_conflict(
    conn: &Connection,
    name: &str,
    exclude_id: i64,
) -> Result<Option<i64>, DbError> {
    Ok(conn
        .query_row(
            "SELECT id FROM checks WHERE use_activity_counter = 1 AND name = ?1 AND id != ?2 LIMIT 1",
            params![name, exclude_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Store the derived status of a check. Returns the number of rows touched.
pub fn update_check_status(
    conn: &Connection,
    id: i64,
    status: CheckStatus,
    cached_health: &str,
    last_run: Option<DateTime<Utc>>,
) -> Result<usize, DbError> {
    Ok(conn.execute(
        "UPDATE checks SET calculated_status=?1, cached_health=?2, last_run=?3 WHERE id=?4",
        params![status.as_str(), cached_health, last_run.map(format_db_time), id],
    )?)
}

pub fn delete_check(conn: &Connection, id: i64) -> Result<usize, DbError> {
    Ok(conn.execute("DELETE FROM checks WHERE id = ?1", params![id])?)
}

// --- Results ---

const RESULT_COLUMNS: &str = "id, check_id, time, time_complete, succeeded, error, acked, raw_data";

fn result_from_row(row: &Row<'_>) -> SqlResult<CheckResult> {
    Ok(CheckResult {
        id: row.get(0)?,
        check_id: row.get(1)?,
        time: time_col(row, 2)?,
        time_complete: time_col(row, 3)?,
        succeeded: row.get(4)?,
        error: row.get(5)?,
        tags: Vec::new(),
        acked: row.get(6)?,
        raw_data: row.get(7)?,
    })
}

fn load_result_tags(conn: &Connection, results: &mut [CheckResult]) -> Result<(), DbError> {
    let mut stmt =
        conn.prepare("SELECT tag FROM result_tags WHERE result_id = ?1 ORDER BY position")?;
    for result in results.iter_mut() {
        result.tags = stmt
            .query_map(params![result.id], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
    }
    Ok(())
}

pub fn insert_result(conn: &Connection, result: &CheckResult) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO results (check_id, time, time_complete, succeeded, error, acked, raw_data) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            result.check_id,
            format_db_time(result.time),
            format_db_time(result.time_complete),
            result.succeeded,
            result.error,
            result.acked,
            result.raw_data,
        ],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO result_tags (result_id, position, tag) VALUES (?1, ?2, ?3)",
    )?;
    for (position, tag) in result.tags.iter().enumerate() {
        stmt.execute(params![id, position as i64, tag])?;
    }

    Ok(id)
}

/// Most recent results of a check, newest first by insertion order.
pub fn recent_results(
    conn: &Connection,
    check_id: i64,
    limit: usize,
) -> Result<Vec<CheckResult>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM results WHERE check_id = ?1 ORDER BY id DESC LIMIT ?2",
        RESULT_COLUMNS
    ))?;
    let mut results = stmt
        .query_map(params![check_id, limit as i64], result_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    load_result_tags(conn, &mut results)?;
    Ok(results)
}

/// Most recent results of a check, newest first by completion time.
pub fn latest_completed_results(
    conn: &Connection,
    check_id: i64,
    limit: usize,
) -> Result<Vec<CheckResult>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM results WHERE check_id = ?1 ORDER BY time_complete DESC, id DESC LIMIT ?2",
        RESULT_COLUMNS
    ))?;
    let results = stmt
        .query_map(params![check_id, limit as i64], result_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(results)
}

// --- Activity counters ---

fn counter_from_row(row: &Row<'_>) -> SqlResult<ActivityCounter> {
    Ok(ActivityCounter {
        check_id: row.get(0)?,
        count: row.get(1)?,
        last_enabled: opt_time_col(row, 2)?,
        last_disabled: opt_time_col(row, 3)?,
    })
}

pub fn get_counter(conn: &Connection, check_id: i64) -> Result<Option<ActivityCounter>, DbError> {
    Ok(conn
        .query_row(
            "SELECT check_id, count, last_enabled, last_disabled FROM activity_counters WHERE check_id = ?1",
            params![check_id],
            counter_from_row,
        )
        .optional()?)
}

pub fn get_or_create_counter(conn: &Connection, check_id: i64) -> Result<ActivityCounter, DbError> {
    conn.execute(
        "INSERT OR IGNORE INTO activity_counters (check_id) VALUES (?1)",
        params![check_id],
    )?;
    get_counter(conn, check_id)?.ok_or(DbError::NotFound)
}

pub fn save_counter(conn: &Connection, counter: &ActivityCounter) -> Result<(), DbError> {
    conn.execute(
        "UPDATE activity_counters SET count=?1, last_enabled=?2, last_disabled=?3 WHERE check_id=?4",
        params![
            counter.count,
            counter.last_enabled.map(format_db_time),
            counter.last_disabled.map(format_db_time),
            counter.check_id,
        ],
    )?;
    Ok(())
}

// --- Acknowledgements ---

const ACK_COLUMNS: &str = "id, check_id, match_if, created_at, created_by, closed_at, closed_reason, \
     expire_at, close_after_successes";

fn ack_from_row(row: &Row<'_>) -> SqlResult<Acknowledgement> {
    Ok(Acknowledgement {
        id: row.get(0)?,
        check_id: row.get(1)?,
        match_if: parsed_col(row, 2)?,
        tags: Vec::new(),
        created_at: time_col(row, 3)?,
        created_by: row.get(4)?,
        closed_at: opt_time_col(row, 5)?,
        closed_reason: row.get(6)?,
        expire_at: opt_time_col(row, 7)?,
        close_after_successes: row.get(8)?,
    })
}

fn query_acks(
    conn: &Connection,
    where_clause: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Acknowledgement>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM acknowledgements {}",
        ACK_COLUMNS, where_clause
    ))?;
    let mut acks = stmt
        .query_map(args, ack_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;

    let mut tag_stmt = conn.prepare("SELECT tag FROM ack_tags WHERE ack_id = ?1 ORDER BY tag")?;
    for ack in acks.iter_mut() {
        ack.tags = tag_stmt
            .query_map(params![ack.id], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
    }
    Ok(acks)
}

pub fn insert_ack(conn: &Connection, ack: &Acknowledgement) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO acknowledgements (check_id, match_if, created_at, created_by, closed_at, \
         closed_reason, expire_at, close_after_successes) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            ack.check_id,
            ack.match_if.as_str(),
            format_db_time(ack.created_at),
            ack.created_by,
            ack.closed_at.map(format_db_time),
            ack.closed_reason,
            ack.expire_at.map(format_db_time),
            ack.close_after_successes,
        ],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare("INSERT OR IGNORE INTO ack_tags (ack_id, tag) VALUES (?1, ?2)")?;
    for tag in &ack.tags {
        stmt.execute(params![id, tag])?;
    }
    Ok(id)
}

pub fn get_ack(conn: &Connection, id: i64) -> Result<Acknowledgement, DbError> {
    query_acks(conn, "WHERE id = ?1", params![id])?
        .pop()
        .ok_or(DbError::NotFound)
}

/// Acknowledgements of a check that were open at `at`.
pub fn open_acks_at(
    conn: &Connection,
    check_id: i64,
    at: DateTime<Utc>,
) -> Result<Vec<Acknowledgement>, DbError> {
    query_acks(
        conn,
        "WHERE check_id = ?1 AND created_at <= ?2 \
         AND (closed_at IS NULL OR closed_at > ?2) \
         AND (expire_at IS NULL OR expire_at > ?2) ORDER BY id",
        params![check_id, format_db_time(at)],
    )
}

/// Acknowledgements of a check that have not been closed.
pub fn unclosed_acks(conn: &Connection, check_id: i64) -> Result<Vec<Acknowledgement>, DbError> {
    query_acks(
        conn,
        "WHERE check_id = ?1 AND closed_at IS NULL ORDER BY id",
        params![check_id],
    )
}

/// Close an acknowledgement if it is still open. Returns whether it changed.
pub fn close_ack(
    conn: &Connection,
    id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let changed = conn.execute(
        "UPDATE acknowledgements SET closed_at=?1, closed_reason=?2 WHERE id=?3 AND closed_at IS NULL",
        params![format_db_time(now), reason, id],
    )?;
    Ok(changed > 0)
}

pub fn expired_open_acks(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<Acknowledgement>, DbError> {
    query_acks(
        conn,
        "WHERE closed_at IS NULL AND expire_at IS NOT NULL AND expire_at <= ?1 ORDER BY id",
        params![format_db_time(now)],
    )
}

pub fn list_open_acks(conn: &Connection) -> Result<Vec<Acknowledgement>, DbError> {
    query_acks(
        conn,
        "WHERE closed_at IS NULL ORDER BY check_id, id DESC",
        [],
    )
}

pub fn recently_closed_acks(
    conn: &Connection,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Acknowledgement>, DbError> {
    query_acks(
        conn,
        "WHERE closed_at IS NOT NULL AND closed_at >= ?1 ORDER BY closed_at DESC LIMIT ?2",
        params![format_db_time(since), limit as i64],
    )
}

// --- Services ---

const SERVICE_COLUMNS: &str =
    "id, name, url, overall_status, old_overall_status, last_alert_sent, alerts_enabled";

fn service_from_row(row: &Row<'_>) -> SqlResult<Service> {
    Ok(Service {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        overall_status: parsed_col(row, 3)?,
        old_overall_status: parsed_col(row, 4)?,
        last_alert_sent: opt_time_col(row, 5)?,
        alerts_enabled: row.get(6)?,
        ..Default::default()
    })
}

fn load_service_links(conn: &Connection, service: &mut Service) -> Result<(), DbError> {
    let id = service.id;

    let mut stmt =
        conn.prepare("SELECT check_id FROM service_checks WHERE service_id = ?1 ORDER BY check_id")?;
    service.check_ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<SqlResult<Vec<i64>>>()?;

    let mut stmt = conn.prepare(
        "SELECT schedule_id FROM service_schedules WHERE service_id = ?1 ORDER BY position",
    )?;
    service.schedule_ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<SqlResult<Vec<i64>>>()?;

    let mut stmt =
        conn.prepare("SELECT channel FROM service_channels WHERE service_id = ?1 ORDER BY rowid")?;
    service.channels = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<SqlResult<Vec<String>>>()?;

    let mut stmt =
        conn.prepare("SELECT username FROM service_users WHERE service_id = ?1 ORDER BY rowid")?;
    service.users_to_notify = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<SqlResult<Vec<String>>>()?;

    Ok(())
}

pub fn insert_service(conn: &Connection, service: &Service) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO services (name, url, overall_status, old_overall_status, last_alert_sent, alerts_enabled) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            service.name,
            service.url,
            service.overall_status.as_str(),
            service.old_overall_status.as_str(),
            service.last_alert_sent.map(format_db_time),
            service.alerts_enabled,
        ],
    )?;
    let id = conn.last_insert_rowid();

    for check_id in &service.check_ids {
        add_check_to_service(conn, id, *check_id)?;
    }
    for (position, schedule_id) in service.schedule_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO service_schedules (service_id, schedule_id, position) VALUES (?1, ?2, ?3)",
            params![id, schedule_id, position as i64],
        )?;
    }
    for channel in &service.channels {
        conn.execute(
            "INSERT OR IGNORE INTO service_channels (service_id, channel) VALUES (?1, ?2)",
            params![id, channel],
        )?;
    }
    for user in &service.users_to_notify {
        conn.execute(
            "INSERT OR IGNORE INTO service_users (service_id, username) VALUES (?1, ?2)",
            params![id, user],
        )?;
    }

    Ok(id)
}

pub fn add_check_to_service(conn: &Connection, service_id: i64, check_id: i64) -> Result<(), DbError> {
    conn.execute(
        "INSERT OR IGNORE INTO service_checks (service_id, check_id) VALUES (?1, ?2)",
        params![service_id, check_id],
    )?;
    Ok(())
}

pub fn get_service(conn: &Connection, id: i64) -> Result<Service, DbError> {
    let mut service = conn
        .query_row(
            &format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS),
            params![id],
            service_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)?;
    load_service_links(conn, &mut service)?;
    Ok(service)
}

pub fn list_service_ids(conn: &Connection) -> Result<Vec<i64>, DbError> {
    let mut stmt = conn.prepare("SELECT id FROM services ORDER BY name, id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<SqlResult<Vec<i64>>>()?;
    Ok(ids)
}

pub fn service_ids_for_check(conn: &Connection, check_id: i64) -> Result<Vec<i64>, DbError> {
    let mut stmt =
        conn.prepare("SELECT service_id FROM service_checks WHERE check_id = ?1 ORDER BY service_id")?;
    let ids = stmt
        .query_map(params![check_id], |row| row.get(0))?
        .collect::<SqlResult<Vec<i64>>>()?;
    Ok(ids)
}

pub fn service_checks(conn: &Connection, service_id: i64) -> Result<Vec<Check>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM checks WHERE id IN (SELECT check_id FROM service_checks WHERE service_id = ?1) \
         ORDER BY name, id",
        CHECK_COLUMNS
    ))?;
    let checks = decodable_checks(stmt.query_map(params![service_id], check_from_row)?)?;
    Ok(checks)
}

pub fn save_service_status(
    conn: &Connection,
    id: i64,
    overall: ServiceStatus,
    old: ServiceStatus,
) -> Result<(), DbError> {
    conn.execute(
        "UPDATE services SET overall_status=?1, old_overall_status=?2 WHERE id=?3",
        params![overall.as_str(), old.as_str(), id],
    )?;
    Ok(())
}

pub fn set_last_alert_sent(
    conn: &Connection,
    id: i64,
    at: Option<DateTime<Utc>>,
) -> Result<(), DbError> {
    conn.execute(
        "UPDATE services SET last_alert_sent=?1 WHERE id=?2",
        params![at.map(format_db_time), id],
    )?;
    Ok(())
}

/// Remove a service, its snapshots and its links, row by row.
pub fn delete_service(conn: &Connection, id: i64) -> Result<usize, DbError> {
    conn.execute("DELETE FROM snapshots WHERE service_id = ?1", params![id])?;
    conn.execute("DELETE FROM service_checks WHERE service_id = ?1", params![id])?;
    conn.execute("DELETE FROM service_schedules WHERE service_id = ?1", params![id])?;
    conn.execute("DELETE FROM service_channels WHERE service_id = ?1", params![id])?;
    conn.execute("DELETE FROM service_users WHERE service_id = ?1", params![id])?;
    Ok(conn.execute("DELETE FROM services WHERE id = ?1", params![id])?)
}

// --- Snapshots ---

fn snapshot_from_row(row: &Row<'_>) -> SqlResult<Snapshot> {
    Ok(Snapshot {
        id: row.get(0)?,
        service_id: row.get(1)?,
        time: time_col(row, 2)?,
        num_checks_active: row.get(3)?,
        num_checks_passing: row.get(4)?,
        num_checks_failing: row.get(5)?,
        overall_status: parsed_col(row, 6)?,
        did_send_alert: row.get(7)?,
    })
}

pub fn insert_snapshot(conn: &Connection, snapshot: &Snapshot) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO snapshots (service_id, time, num_checks_active, num_checks_passing, \
         num_checks_failing, overall_status, did_send_alert) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            snapshot.service_id,
            format_db_time(snapshot.time),
            snapshot.num_checks_active,
            snapshot.num_checks_passing,
            snapshot.num_checks_failing,
            snapshot.overall_status.as_str(),
            snapshot.did_send_alert,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn mark_snapshot_alerted(conn: &Connection, id: i64) -> Result<(), DbError> {
    conn.execute("UPDATE snapshots SET did_send_alert = 1 WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn snapshots_since(
    conn: &Connection,
    service_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<Snapshot>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, service_id, time, num_checks_active, num_checks_passing, num_checks_failing, \
         overall_status, did_send_alert FROM snapshots WHERE service_id = ?1 AND time > ?2 ORDER BY time, id",
    )?;
    let snapshots = stmt
        .query_map(params![service_id, format_db_time(since)], snapshot_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(snapshots)
}

// --- Schedules and shifts ---

pub fn insert_schedule(conn: &Connection, schedule: &Schedule) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO schedules (name, fallback_officer) VALUES (?1, ?2)",
        params![schedule.name, schedule.fallback_officer],
    )?;
    Ok(conn.last_insert_rowid())
}

fn schedule_from_row(row: &Row<'_>) -> SqlResult<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        fallback_officer: row.get(2)?,
    })
}

pub fn get_schedule(conn: &Connection, id: i64) -> Result<Schedule, DbError> {
    conn.query_row(
        "SELECT id, name, fallback_officer FROM schedules WHERE id = ?1",
        params![id],
        schedule_from_row,
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

pub fn list_schedules(conn: &Connection) -> Result<Vec<Schedule>, DbError> {
    let mut stmt = conn.prepare("SELECT id, name, fallback_officer FROM schedules ORDER BY name")?;
    let schedules = stmt
        .query_map([], schedule_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(schedules)
}

fn shift_from_row(row: &Row<'_>) -> SqlResult<Shift> {
    Ok(Shift {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        uid: row.get(2)?,
        start: time_col(row, 3)?,
        end: time_col(row, 4)?,
        user: row.get(5)?,
        deleted: row.get(6)?,
    })
}

/// Insert a shift, or refresh the existing one with the same `uid`.
pub fn upsert_shift(conn: &Connection, shift: &Shift) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO shifts (schedule_id, uid, starts_at, ends_at, username, deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(schedule_id, uid) DO UPDATE SET \
         starts_at=excluded.starts_at, ends_at=excluded.ends_at, username=excluded.username, deleted=excluded.deleted",
        params![
            shift.schedule_id,
            shift.uid,
            format_db_time(shift.start),
            format_db_time(shift.end),
            shift.user,
            shift.deleted,
        ],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM shifts WHERE schedule_id = ?1 AND uid = ?2",
        params![shift.schedule_id, shift.uid],
        |row| row.get(0),
    )?)
}

pub fn soft_delete_shifts(conn: &Connection, schedule_id: i64) -> Result<(), DbError> {
    conn.execute(
        "UPDATE shifts SET deleted = 1 WHERE schedule_id = ?1",
        params![schedule_id],
    )?;
    Ok(())
}

pub fn list_shifts(conn: &Connection, schedule_id: i64) -> Result<Vec<Shift>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, schedule_id, uid, starts_at, ends_at, username, deleted FROM shifts \
         WHERE schedule_id = ?1 ORDER BY starts_at, id",
    )?;
    let shifts = stmt
        .query_map(params![schedule_id], shift_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(shifts)
}

/// Users with a live shift strictly spanning `at`.
pub fn covering_shift_users(
    conn: &Connection,
    schedule_id: i64,
    at: DateTime<Utc>,
) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT username FROM shifts WHERE schedule_id = ?1 AND deleted = 0 \
         AND starts_at < ?2 AND ends_at > ?2 ORDER BY starts_at, id",
    )?;
    let users = stmt
        .query_map(params![schedule_id, format_db_time(at)], |row| row.get(0))?
        .collect::<SqlResult<Vec<String>>>()?;
    Ok(users)
}
