//! Acknowledgements: operator suppression of failing checks.
//!
//! An acknowledgement is open while `closed_at` is unset. It stops matching
//! once its `expire_at` passes, and the sweeper closes it for good. It is
//! also closed after the check succeeds `close_after_successes` times in a
//! row. A check has at most one open acknowledgement; creating a new one
//! supersedes the rest.

use crate::db::{queries, Acknowledgement, CheckResult, DbError, MatchMode, Store};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub const REASON_EXPIRED: &str = "expired";
pub const REASON_SUPERSEDED: &str = "superseded";
/// How many closed acknowledgements operators are shown by default.
pub const RECENTLY_CLOSED_LIMIT: usize = 12;

/// Parameters of a new acknowledgement.
#[derive(Debug, Clone)]
pub struct NewAcknowledgement {
    pub check_id: i64,
    pub match_if: MatchMode,
    pub tags: Vec<String>,
    pub created_by: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
    pub close_after_successes: Option<u32>,
}

impl NewAcknowledgement {
    /// Acknowledge every failure of a check until it passes once.
    pub fn for_check(check_id: i64) -> Self {
        Self {
            check_id,
            match_if: MatchMode::Check,
            tags: Vec::new(),
            created_by: None,
            expire_at: None,
            close_after_successes: Some(1),
        }
    }
}

/// Whether `ack` covers `result`.
pub fn matches(ack: &Acknowledgement, result: &CheckResult) -> bool {
    if ack.check_id != result.check_id {
        return false;
    }
    match ack.match_if {
        MatchMode::Check => true,
        MatchMode::AllTagsIn => result.tags.iter().all(|tag| ack.tags.contains(tag)),
    }
}

/// Acknowledgements of a check that were open at `at`.
pub fn get_open_acks(
    conn: &Connection,
    check_id: i64,
    at: DateTime<Utc>,
) -> Result<Vec<Acknowledgement>, DbError> {
    queries::open_acks_at(conn, check_id, at)
}

/// Open acknowledgements at `at` that cover `result`.
pub fn matching_acks(
    conn: &Connection,
    result: &CheckResult,
    at: DateTime<Utc>,
) -> Result<Vec<Acknowledgement>, DbError> {
    Ok(get_open_acks(conn, result.check_id, at)?
        .into_iter()
        .filter(|ack| matches(ack, result))
        .collect())
}

/// Create an acknowledgement, closing any other open one on the same check.
pub fn create(
    store: &Store,
    new: NewAcknowledgement,
    now: DateTime<Utc>,
) -> Result<Acknowledgement, DbError> {
    let mut tags = new.tags;
    tags.sort();
    tags.dedup();

    let mut ack = Acknowledgement {
        id: 0,
        check_id: new.check_id,
        match_if: new.match_if,
        tags,
        created_at: now,
        created_by: new.created_by,
        closed_at: None,
        closed_reason: None,
        expire_at: new.expire_at,
        close_after_successes: new.close_after_successes,
    };

    store.transaction(|conn| {
        queries::get_check(conn, ack.check_id)?;
        for other in queries::unclosed_acks(conn, ack.check_id)? {
            queries::close_ack(conn, other.id, REASON_SUPERSEDED, now)?;
            tracing::info!("Ack {} on check {} superseded", other.id, other.check_id);
        }
        ack.id = queries::insert_ack(conn, &ack)?;
        Ok::<_, DbError>(())
    })?;

    tracing::info!(
        "Check {} acknowledged by {} (ack {})",
        ack.check_id,
        ack.created_by.as_deref().unwrap_or("unknown"),
        ack.id
    );
    Ok(ack)
}

/// Close an acknowledgement. Returns false when it was already closed.
pub fn close(store: &Store, ack_id: i64, reason: &str, now: DateTime<Utc>) -> Result<bool, DbError> {
    store.transaction(|conn| {
        queries::get_ack(conn, ack_id)?;
        queries::close_ack(conn, ack_id, reason, now)
    })
}

/// Close every open acknowledgement whose expiry has passed.
pub fn sweep_expired(store: &Store, now: DateTime<Utc>) -> Result<usize, DbError> {
    store.transaction(|conn| {
        let mut closed = 0;
        for ack in queries::expired_open_acks(conn, now)? {
            if queries::close_ack(conn, ack.id, REASON_EXPIRED, now)? {
                tracing::info!("Ack {} on check {} expired", ack.id, ack.check_id);
                closed += 1;
            }
        }
        Ok(closed)
    })
}

/// Close acknowledgements of a check that has now succeeded enough times in a row.
pub fn close_succeeding_acks(
    conn: &Connection,
    check_id: i64,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let mut closed = 0;
    for ack in get_open_acks(conn, check_id, at)? {
        let needed = match ack.close_after_successes {
            Some(n) if n > 0 => n as usize,
            _ => continue,
        };

        let results = queries::latest_completed_results(conn, check_id, needed)?;
        let passed = results.iter().filter(|r| r.succeeded).count();
        if passed >= needed {
            let reason = if passed == 1 {
                "check passed".to_string()
            } else {
                format!("check passed {} times", passed)
            };
            if queries::close_ack(conn, ack.id, &reason, now)? {
                tracing::info!("Ack {} on check {} closed: {}", ack.id, check_id, reason);
                closed += 1;
            }
        }
    }
    Ok(closed)
}

/// Re-issue an acknowledgement with the same scope. A set expiry keeps its
/// original duration, counted from `now`.
pub fn clone_ack(
    store: &Store,
    ack_id: i64,
    created_by: Option<String>,
    now: DateTime<Utc>,
) -> Result<Acknowledgement, DbError> {
    let original = store.read(|conn| queries::get_ack(conn, ack_id))?;
    let new = NewAcknowledgement {
        check_id: original.check_id,
        match_if: original.match_if,
        tags: original.tags.clone(),
        created_by,
        expire_at: original
            .expire_at
            .map(|expire_at| now + (expire_at - original.created_at)),
        close_after_successes: original.close_after_successes,
    };
    create(store, new, now)
}

/// Every open acknowledgement, grouped by check.
pub fn list_open(store: &Store) -> Result<Vec<Acknowledgement>, DbError> {
    store.read(queries::list_open_acks)
}

/// Acknowledgements closed since `since`, most recent first.
pub fn recently_closed(
    store: &Store,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Acknowledgement>, DbError> {
    store.read(|conn| queries::recently_closed_acks(conn, since, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Check;
    use crate::probe::ProbeSpec;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
    }

    fn setup() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let mut check = Check {
            name: "api".to_string(),
            probe: ProbeSpec::http("http://example.com"),
            ..Default::default()
        };
        let id = store.add_check(&mut check).unwrap();
        (store, id)
    }

    fn result(check_id: i64, succeeded: bool, tags: &[&str], at: DateTime<Utc>) -> CheckResult {
        CheckResult {
            id: 0,
            check_id,
            time: at,
            time_complete: at,
            succeeded,
            error: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            acked: false,
            raw_data: None,
        }
    }

    fn insert(store: &Store, r: &CheckResult) {
        store.transaction(|conn| queries::insert_result(conn, r)).unwrap();
    }

    #[test]
    fn test_matches_by_check_and_tags() {
        let ack = Acknowledgement {
            id: 1,
            check_id: 7,
            match_if: MatchMode::AllTagsIn,
            tags: vec!["status:500".to_string(), "status:503".to_string()],
            created_at: t0(),
            created_by: None,
            closed_at: None,
            closed_reason: None,
            expire_at: None,
            close_after_successes: None,
        };

        assert!(matches(&ack, &result(7, false, &["status:503"], t0())));
        assert!(matches(&ack, &result(7, false, &[], t0())));
        assert!(!matches(&ack, &result(7, false, &["text_match_failed"], t0())));
        assert!(!matches(&ack, &result(8, false, &["status:503"], t0())));

        let by_check = Acknowledgement {
            match_if: MatchMode::Check,
            ..ack
        };
        assert!(matches(&by_check, &result(7, false, &["text_match_failed"], t0())));
    }

    #[test]
    fn test_create_supersedes_open_ack() {
        let (store, check_id) = setup();
        let first = create(&store, NewAcknowledgement::for_check(check_id), t0()).unwrap();
        let second = create(
            &store,
            NewAcknowledgement::for_check(check_id),
            t0() + Duration::minutes(1),
        )
        .unwrap();

        let open = list_open(&store).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second.id);

        let first = store.read(|conn| queries::get_ack(conn, first.id)).unwrap();
        assert_eq!(first.closed_reason.as_deref(), Some(REASON_SUPERSEDED));
    }

    #[test]
    fn test_create_for_missing_check() {
        let (store, _) = setup();
        assert!(matches!(
            create(&store, NewAcknowledgement::for_check(999), t0()),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_open_window_respects_expiry() {
        let (store, check_id) = setup();
        let ack = create(
            &store,
            NewAcknowledgement {
                expire_at: Some(t0() + Duration::minutes(30)),
                ..NewAcknowledgement::for_check(check_id)
            },
            t0(),
        )
        .unwrap();

        let open_at = |at| store.read(|conn| get_open_acks(conn, check_id, at)).unwrap();
        assert!(open_at(t0() - Duration::minutes(1)).is_empty());
        assert_eq!(open_at(t0() + Duration::minutes(29))[0].id, ack.id);
        assert!(open_at(t0() + Duration::minutes(30)).is_empty());
    }

    #[test]
    fn test_sweep_expired() {
        let (store, check_id) = setup();
        create(
            &store,
            NewAcknowledgement {
                expire_at: Some(t0() + Duration::minutes(30)),
                ..NewAcknowledgement::for_check(check_id)
            },
            t0(),
        )
        .unwrap();

        assert_eq!(sweep_expired(&store, t0() + Duration::minutes(29)).unwrap(), 0);
        assert_eq!(sweep_expired(&store, t0() + Duration::minutes(30)).unwrap(), 1);
        assert_eq!(sweep_expired(&store, t0() + Duration::minutes(31)).unwrap(), 0);

        let closed = recently_closed(&store, t0(), RECENTLY_CLOSED_LIMIT).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].closed_reason.as_deref(), Some(REASON_EXPIRED));
        assert!(list_open(&store).unwrap().is_empty());
    }

    #[test]
    fn test_close_after_successes() {
        let (store, check_id) = setup();
        let ack = create(
            &store,
            NewAcknowledgement {
                close_after_successes: Some(3),
                ..NewAcknowledgement::for_check(check_id)
            },
            t0(),
        )
        .unwrap();

        let sweep = |at| {
            store
                .transaction(|conn| close_succeeding_acks(conn, check_id, at, at))
                .unwrap()
        };

        for i in 1..=2 {
            let at = t0() + Duration::minutes(i);
            insert(&store, &result(check_id, true, &[], at));
            assert_eq!(sweep(at), 0);
        }

        let at = t0() + Duration::minutes(3);
        insert(&store, &result(check_id, true, &[], at));
        assert_eq!(sweep(at), 1);

        let ack = store.read(|conn| queries::get_ack(conn, ack.id)).unwrap();
        assert_eq!(ack.closed_reason.as_deref(), Some("check passed 3 times"));
    }

    #[test]
    fn test_failure_resets_success_streak() {
        let (store, check_id) = setup();
        create(
            &store,
            NewAcknowledgement {
                close_after_successes: Some(2),
                ..NewAcknowledgement::for_check(check_id)
            },
            t0(),
        )
        .unwrap();

        insert(&store, &result(check_id, true, &[], t0() + Duration::minutes(1)));
        insert(&store, &result(check_id, false, &[], t0() + Duration::minutes(2)));
        insert(&store, &result(check_id, true, &[], t0() + Duration::minutes(3)));

        let at = t0() + Duration::minutes(3);
        let closed = store
            .transaction(|conn| close_succeeding_acks(conn, check_id, at, at))
            .unwrap();
        assert_eq!(closed, 0);
    }

    #[test]
    fn test_zero_successes_never_closes() {
        let (store, check_id) = setup();
        create(
            &store,
            NewAcknowledgement {
                close_after_successes: Some(0),
                ..NewAcknowledgement::for_check(check_id)
            },
            t0(),
        )
        .unwrap();
        let at = t0() + Duration::minutes(1);
        insert(&store, &result(check_id, true, &[], at));
        let closed = store
            .transaction(|conn| close_succeeding_acks(conn, check_id, at, at))
            .unwrap();
        assert_eq!(closed, 0);
    }

    #[test]
    fn test_clone_keeps_duration() {
        let (store, check_id) = setup();
        let original = create(
            &store,
            NewAcknowledgement {
                match_if: MatchMode::AllTagsIn,
                tags: vec!["status:502".to_string()],
                expire_at: Some(t0() + Duration::hours(2)),
                close_after_successes: Some(4),
                ..NewAcknowledgement::for_check(check_id)
            },
            t0(),
        )
        .unwrap();
        close(&store, original.id, "manual", t0() + Duration::minutes(5)).unwrap();

        let later = t0() + Duration::days(1);
        let copy = clone_ack(&store, original.id, Some("alice".to_string()), later).unwrap();
        assert_eq!(copy.expire_at, Some(later + Duration::hours(2)));
        assert_eq!(copy.tags, vec!["status:502".to_string()]);
        assert_eq!(copy.match_if, MatchMode::AllTagsIn);
        assert_eq!(copy.close_after_successes, Some(4));
        assert_eq!(copy.created_by.as_deref(), Some("alice"));
        assert!(copy.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (store, check_id) = setup();
        let ack = create(&store, NewAcknowledgement::for_check(check_id), t0()).unwrap();
        assert!(close(&store, ack.id, "manual", t0()).unwrap());
        assert!(!close(&store, ack.id, "again", t0()).unwrap());
        assert!(matches!(close(&store, 12345, "x", t0()), Err(DbError::NotFound)));
    }
}
