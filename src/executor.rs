//! Runs checks and records their results.
//!
//! The probe runs with no database lock held. Its outcome is then written in
//! one transaction together with acknowledgement matching, the
//! auto-close sweep and the derived check status.

use crate::ack;
use crate::clock::Clock;
use crate::db::{queries, Check, CheckResult, CheckStatus, DbError, Store, RAW_DATA_LIMIT};
use crate::probe::{execute_with_timeout, Probe};

use std::time::Duration;

/// Results kept in a check's cached health string.
pub const HEALTH_HISTORY: usize = 10;

/// Run `check` once and record the result.
pub async fn run_check(
    store: &Store,
    probe: &dyn Probe,
    check: &Check,
    timeout: Duration,
    clock: &dyn Clock,
) -> Result<CheckResult, DbError> {
    let start = clock.now();
    let outcome = execute_with_timeout(probe, check, timeout).await;
    let completion = clock.now();

    let mut result = CheckResult {
        id: 0,
        check_id: check.id,
        time: start,
        time_complete: completion,
        succeeded: outcome.succeeded,
        error: outcome.error,
        tags: dedup_tags(outcome.tags),
        acked: false,
        raw_data: outcome.raw_data.map(truncate_raw_data),
    };

    let status = record_result(store, check, &mut result)?;
    tracing::debug!(
        "Check {} {} in {}ms, now {}",
        check.name,
        result.status(),
        result.took_ms(),
        status.as_str()
    );
    Ok(result)
}

/// Store a finished result and refresh the check's derived status.
pub fn record_result(
    store: &Store,
    check: &Check,
    result: &mut CheckResult,
) -> Result<CheckStatus, DbError> {
    let at = result.time_complete;
    store.transaction(|conn| {
        if !result.succeeded && !ack::matching_acks(conn, result, at)?.is_empty() {
            result.acked = true;
        }
        result.id = queries::insert_result(conn, result)?;

        if result.succeeded {
            ack::close_succeeding_acks(conn, check.id, at, at)?;
        }

        let window = HEALTH_HISTORY.max(check.retries as usize + 1);
        let recent = queries::recent_results(conn, check.id, window)?;
        let status = derive_status(&recent, check.retries);
        let health = serialize_recent_results(&recent[..recent.len().min(HEALTH_HISTORY)]);
        queries::update_check_status(conn, check.id, status, &health, Some(at))?;
        Ok(status)
    })
}

/// Derive a check's status from its recent results, newest first.
///
/// Any success among the newest `retries + 1` results means passing.
/// Otherwise the newest result decides between acked and failing.
pub fn derive_status(recent: &[CheckResult], retries: u32) -> CheckStatus {
    let window = &recent[..recent.len().min(retries as usize + 1)];
    let Some(newest) = window.first() else {
        return CheckStatus::Passing;
    };
    if window.iter().any(|r| r.succeeded) {
        CheckStatus::Passing
    } else if newest.acked {
        CheckStatus::Acked
    } else {
        CheckStatus::Failing
    }
}

/// Encode results (newest first) as `1`/`-1`, oldest first.
pub fn serialize_recent_results(recent: &[CheckResult]) -> String {
    recent
        .iter()
        .rev()
        .map(|r| if r.succeeded { "1" } else { "-1" })
        .collect::<Vec<_>>()
        .join(",")
}

fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(tags.len());
    for tag in tags {
        if !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}

fn truncate_raw_data(mut raw: String) -> String {
    if raw.len() > RAW_DATA_LIMIT {
        let mut cut = RAW_DATA_LIMIT;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        raw.truncate(cut);
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::NewAcknowledgement;
    use crate::clock::ManualClock;
    use crate::probe::{ProbeError, ProbeOutcome, ProbeSpec, SOFT_TIME_LIMIT_ERROR};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    /// Replays a fixed sequence of outcomes.
    struct Scripted(Mutex<Vec<ProbeOutcome>>);

    impl Scripted {
        fn new(mut outcomes: Vec<ProbeOutcome>) -> Self {
            outcomes.reverse();
            Self(Mutex::new(outcomes))
        }
    }

    #[async_trait]
    impl Probe for Scripted {
        async fn execute(&self, _check: &Check) -> Result<ProbeOutcome, ProbeError> {
            self.0
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ProbeError::Config("script exhausted".to_string()))
        }
    }

    struct Hangs;

    #[async_trait]
    impl Probe for Hangs {
        async fn execute(&self, _check: &Check) -> Result<ProbeOutcome, ProbeError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ProbeOutcome::success())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap()
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::failure("boom", vec!["status:500".to_string()])
    }

    fn setup(retries: u32) -> (Store, Check) {
        let store = Store::open_in_memory().unwrap();
        let mut check = Check {
            name: "api".to_string(),
            retries,
            probe: ProbeSpec::http("http://example.com"),
            ..Default::default()
        };
        store.add_check(&mut check).unwrap();
        (store, check)
    }

    async fn run_all(store: &Store, check: &Check, probe: &Scripted, clock: &ManualClock, n: usize) {
        for _ in 0..n {
            clock.advance(chrono::Duration::minutes(1));
            run_check(store, probe, check, Duration::from_secs(1), clock)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_retries_tolerate_failures() {
        let (store, check) = setup(2);
        let clock = ManualClock::new(t0());
        let probe = Scripted::new(vec![
            ProbeOutcome::success(),
            fail(),
            fail(),
            fail(),
            ProbeOutcome::success(),
        ]);

        run_all(&store, &check, &probe, &clock, 3).await;
        assert_eq!(store.get_check(check.id).unwrap().calculated_status, CheckStatus::Passing);

        run_all(&store, &check, &probe, &clock, 1).await;
        let stored = store.get_check(check.id).unwrap();
        assert_eq!(stored.calculated_status, CheckStatus::Failing);
        assert_eq!(stored.cached_health, "1,-1,-1,-1");
        assert_eq!(stored.last_run, Some(clock.now()));

        run_all(&store, &check, &probe, &clock, 1).await;
        assert_eq!(store.get_check(check.id).unwrap().calculated_status, CheckStatus::Passing);
    }

    #[tokio::test]
    async fn test_single_retry() {
        let (store, check) = setup(1);
        let clock = ManualClock::new(t0());
        let probe = Scripted::new(vec![fail(), fail(), ProbeOutcome::success()]);

        run_all(&store, &check, &probe, &clock, 1).await;
        assert_eq!(store.get_check(check.id).unwrap().calculated_status, CheckStatus::Failing);
        run_all(&store, &check, &probe, &clock, 1).await;
        assert_eq!(store.get_check(check.id).unwrap().calculated_status, CheckStatus::Failing);
        run_all(&store, &check, &probe, &clock, 1).await;
        let stored = store.get_check(check.id).unwrap();
        assert_eq!(stored.calculated_status, CheckStatus::Passing);
        assert_eq!(stored.cached_health, "-1,-1,1");
    }

    #[tokio::test]
    async fn test_acked_failure() {
        let (store, check) = setup(0);
        let clock = ManualClock::new(t0());
        ack::create(&store, NewAcknowledgement::for_check(check.id), t0()).unwrap();

        let probe = Scripted::new(vec![fail()]);
        run_all(&store, &check, &probe, &clock, 1).await;

        let results = store.recent_results(check.id, 1).unwrap();
        assert!(results[0].acked);
        assert_eq!(results[0].tags, vec!["status:500".to_string()]);
        assert_eq!(store.get_check(check.id).unwrap().calculated_status, CheckStatus::Acked);
    }

    #[tokio::test]
    async fn test_success_closes_ack() {
        let (store, check) = setup(0);
        let clock = ManualClock::new(t0());
        ack::create(&store, NewAcknowledgement::for_check(check.id), t0()).unwrap();

        let probe = Scripted::new(vec![fail(), ProbeOutcome::success()]);
        run_all(&store, &check, &probe, &clock, 2).await;

        assert!(ack::list_open(&store).unwrap().is_empty());
        let closed = ack::recently_closed(&store, t0(), 12).unwrap();
        assert_eq!(closed[0].closed_reason.as_deref(), Some("check passed"));
    }

    #[tokio::test]
    async fn test_timeout_recorded_as_failure() {
        let (store, check) = setup(0);
        let clock = ManualClock::new(t0());
        let result = run_check(&store, &Hangs, &check, Duration::from_millis(20), &clock)
            .await
            .unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.error.as_deref(), Some(SOFT_TIME_LIMIT_ERROR));
        assert_eq!(result.tags, vec!["probe_timeout".to_string()]);
        assert_eq!(store.get_check(check.id).unwrap().calculated_status, CheckStatus::Failing);
    }

    #[tokio::test]
    async fn test_deleted_check_rolls_back() {
        let (store, check) = setup(0);
        store.delete_check(check.id).unwrap();

        let clock = ManualClock::new(t0());
        let probe = Scripted::new(vec![fail()]);
        let outcome = run_check(&store, &probe, &check, Duration::from_secs(1), &clock).await;
        assert!(outcome.is_err());
    }

    #[test]
    fn test_derive_status_without_results() {
        assert_eq!(derive_status(&[], 3), CheckStatus::Passing);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(
            dedup_tags(vec!["a".to_string(), "b".to_string(), "a".to_string()]),
            vec!["a".to_string(), "b".to_string()]
        );

        let long = "é".repeat(RAW_DATA_LIMIT);
        let cut = truncate_raw_data(long);
        assert!(cut.len() <= RAW_DATA_LIMIT);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
