//! On-call resolution: who is on duty for a schedule right now.

use crate::db::{queries, DbError, Shift, Store};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::BTreeMap;

/// A shift as delivered by an external calendar feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftEvent {
    pub uid: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub user: String,
}

/// Users whose live shift strictly spans `now`, or the schedule's fallback
/// officer when nobody is on shift.
pub fn duty_officers(
    conn: &Connection,
    schedule_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<String>, DbError> {
    let on_shift = queries::covering_shift_users(conn, schedule_id, now)?;
    if !on_shift.is_empty() {
        return Ok(on_shift);
    }
    fallback_officers(conn, schedule_id)
}

pub fn fallback_officers(conn: &Connection, schedule_id: i64) -> Result<Vec<String>, DbError> {
    let schedule = queries::get_schedule(conn, schedule_id)?;
    Ok(schedule.fallback_officer.into_iter().collect())
}

/// Every duty officer across all schedules, mapped to the schedules they cover.
pub fn all_duty_officers(
    store: &Store,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, Vec<String>>, DbError> {
    store.read(|conn| {
        let mut officers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for schedule in queries::list_schedules(conn)? {
            for user in duty_officers(conn, schedule.id, now)? {
                officers.entry(user).or_default().push(schedule.name.clone());
            }
        }
        Ok(officers)
    })
}

/// Replace a schedule's shifts with `events`.
///
/// Existing shifts are soft-deleted and the incoming events upserted by
/// `uid`, so shifts that vanished from the feed stay deleted. Returns the
/// number of live shifts afterwards.
pub fn replace_shifts(
    store: &Store,
    schedule_id: i64,
    events: &[ShiftEvent],
) -> Result<usize, DbError> {
    store.transaction(|conn| {
        queries::get_schedule(conn, schedule_id)?;
        queries::soft_delete_shifts(conn, schedule_id)?;

        let mut live = 0;
        for event in events {
            if event.end <= event.start {
                tracing::warn!(
                    "Schedule {}: skipping shift {} that ends before it starts",
                    schedule_id,
                    event.uid
                );
                continue;
            }
            queries::upsert_shift(
                conn,
                &Shift {
                    id: 0,
                    schedule_id,
                    uid: event.uid.clone(),
                    start: event.start,
                    end: event.end,
                    user: event.user.clone(),
                    deleted: false,
                },
            )?;
            live += 1;
        }
        tracing::info!("Schedule {}: loaded {} shifts", schedule_id, live);
        Ok(live)
    })
}
