//! Decides whether a check is due to run.

use crate::db::{queries, ActivityCounter, Check, DbError, Store};

use chrono::{DateTime, Duration, Utc};

/// Whether `check` should run at `now`.
///
/// Inactive checks are filtered out by the caller. The activity counter is
/// consulted first, then the run window, then the frequency.
pub fn should_run(store: &Store, check: &Check, now: DateTime<Utc>) -> Result<bool, DbError> {
    if check.use_activity_counter {
        let Some(counter) = load_counter(store, check.id, now)? else {
            tracing::debug!("Gate: {} has no activity counter", check.name);
            return Ok(false);
        };
        if !counter_window_open(&counter, check.run_delay, now) {
            tracing::debug!(
                "Gate: {} outside activity window (count={})",
                check.name,
                counter.count
            );
            return Ok(false);
        }
    }

    if !check.run_window.active(now) {
        tracing::debug!("Gate: {} outside run window", check.name);
        return Ok(false);
    }

    Ok(match check.last_run {
        None => true,
        Some(last_run) => now > last_run + Duration::minutes(check.frequency as i64),
    })
}

/// Load the counter, back-filling `last_enabled` when the count is positive
/// but the enable time was never recorded.
fn load_counter(
    store: &Store,
    check_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<ActivityCounter>, DbError> {
    let counter = store.read(|conn| queries::get_counter(conn, check_id))?;
    match counter {
        Some(c) if c.last_enabled.is_none() && c.count > 0 => store.transaction(|conn| {
            let Some(mut counter) = queries::get_counter(conn, check_id)? else {
                return Ok(None);
            };
            if counter.last_enabled.is_none() && counter.count > 0 {
                counter.last_enabled = Some(now);
                queries::save_counter(conn, &counter)?;
            }
            Ok(Some(counter))
        }),
        other => Ok(other),
    }
}

fn counter_window_open(counter: &ActivityCounter, run_delay: u32, now: DateTime<Utc>) -> bool {
    let Some(last_enabled) = counter.last_enabled else {
        return false;
    };
    let delay = Duration::minutes(run_delay as i64);
    let window_start = last_enabled + delay;
    if now < window_start {
        return false;
    }
    if let Some(last_disabled) = counter.last_disabled {
        let window_end = last_disabled + delay;
        if window_end > window_start && now > window_end {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter;
    use crate::probe::ProbeSpec;
    use crate::run_window::{Recurrence, RunWindow, Window};
    use chrono::{NaiveTime, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
    }

    fn add_check(store: &Store, mut check: Check) -> Check {
        check.probe = ProbeSpec::http("http://example.com");
        store.add_check(&mut check).unwrap();
        check
    }

    #[test]
    fn test_frequency_gate() {
        let store = Store::open_in_memory().unwrap();
        let mut check = add_check(
            &store,
            Check {
                name: "freq".to_string(),
                frequency: 5,
                ..Default::default()
            },
        );
        assert!(should_run(&store, &check, t0()).unwrap());

        check.last_run = Some(t0());
        assert!(!should_run(&store, &check, t0() + Duration::minutes(5)).unwrap());
        assert!(should_run(&store, &check, t0() + Duration::minutes(5) + Duration::seconds(1)).unwrap());
    }

    #[test]
    fn test_counter_window_with_run_delay() {
        let store = Store::open_in_memory().unwrap();
        let check = add_check(
            &store,
            Check {
                name: "job".to_string(),
                use_activity_counter: true,
                run_delay: 30,
                ..Default::default()
            },
        );

        counter::increment(&store, check.id, t0()).unwrap();
        counter::decrement(&store, check.id, t0() + Duration::minutes(60)).unwrap();

        assert!(!should_run(&store, &check, t0() + Duration::minutes(10)).unwrap());
        assert!(should_run(&store, &check, t0() + Duration::minutes(40)).unwrap());
        assert!(should_run(&store, &check, t0() + Duration::minutes(89)).unwrap());
        assert!(!should_run(&store, &check, t0() + Duration::minutes(91)).unwrap());
    }

    #[test]
    fn test_counter_missing_or_idle() {
        let store = Store::open_in_memory().unwrap();
        let check = add_check(
            &store,
            Check {
                name: "idle".to_string(),
                use_activity_counter: true,
                ..Default::default()
            },
        );
        assert!(!should_run(&store, &check, t0()).unwrap());

        counter::reset(&store, check.id, t0()).unwrap();
        assert!(!should_run(&store, &check, t0()).unwrap());
    }

    #[test]
    fn test_reenabled_counter_ignores_old_disable() {
        let store = Store::open_in_memory().unwrap();
        let check = add_check(
            &store,
            Check {
                name: "again".to_string(),
                use_activity_counter: true,
                ..Default::default()
            },
        );
        counter::increment(&store, check.id, t0()).unwrap();
        counter::decrement(&store, check.id, t0() + Duration::minutes(10)).unwrap();
        counter::increment(&store, check.id, t0() + Duration::minutes(20)).unwrap();

        assert!(should_run(&store, &check, t0() + Duration::minutes(25)).unwrap());
    }

    #[test]
    fn test_last_enabled_backfilled() {
        let store = Store::open_in_memory().unwrap();
        let check = add_check(
            &store,
            Check {
                name: "legacy".to_string(),
                use_activity_counter: true,
                ..Default::default()
            },
        );
        store
            .transaction(|conn| {
                let mut counter = queries::get_or_create_counter(conn, check.id)?;
                counter.count = 2;
                queries::save_counter(conn, &counter)
            })
            .unwrap();

        assert!(should_run(&store, &check, t0()).unwrap());
        let counter = store.get_counter(check.id).unwrap().unwrap();
        assert_eq!(counter.last_enabled, Some(t0()));
    }

    #[test]
    fn test_run_window_gate() {
        let store = Store::open_in_memory().unwrap();
        let window = Window::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            Recurrence::daily(),
        );
        let check = add_check(
            &store,
            Check {
                name: "windowed".to_string(),
                run_window: RunWindow::new(vec![window]),
                ..Default::default()
            },
        );

        let morning = Utc.with_ymd_and_hms(2024, 5, 6, 9, 30, 0).unwrap();
        assert!(should_run(&store, &check, morning).unwrap());
        assert!(!should_run(&store, &check, t0()).unwrap());
    }
}
