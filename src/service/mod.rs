//! Service aggregation.
//!
//! A service's status is the most severe status among its active, non-passing
//! checks. Every recomputation appends a snapshot and may escalate.

pub mod escalate;
pub mod oncall;

pub use escalate::{decide, AlertDecision, AlertIntervals, Dispatch, Escalator};
pub use oncall::{all_duty_officers, duty_officers, replace_shifts, ShiftEvent};

use crate::db::{queries, Check, CheckStatus, DbError, ServiceStatus, Snapshot, Store};
use crate::notify::{FailingCheck, ServiceAlert};

use chrono::{DateTime, Utc};

/// Severity a failing check contributes: its importance, or `Acked` when acknowledged.
pub fn check_severity(check: &Check) -> ServiceStatus {
    if check.calculated_status == CheckStatus::Acked {
        ServiceStatus::Acked
    } else {
        check.importance.into()
    }
}

/// Most severe status among `failing`, `Passing` when empty.
pub fn most_severe<'a>(failing: impl IntoIterator<Item = &'a Check>) -> ServiceStatus {
    failing
        .into_iter()
        .map(check_severity)
        .max()
        .unwrap_or(ServiceStatus::Passing)
}

/// Recompute a service's status, record a snapshot and escalate if needed.
///
/// Status, snapshot and the alert bookkeeping are written in one
/// transaction. Channels are called after it commits.
pub async fn update_status(
    store: &Store,
    escalator: &Escalator,
    service_id: i64,
    now: DateTime<Utc>,
) -> Result<ServiceStatus, DbError> {
    let (status, dispatch) = store.transaction(|conn| -> Result<_, DbError> {
        let service = queries::get_service(conn, service_id)?;
        let checks = queries::service_checks(conn, service_id)?;

        let active: Vec<&Check> = checks.iter().filter(|c| c.active).collect();
        let failing: Vec<&Check> = active
            .iter()
            .copied()
            .filter(|c| c.calculated_status != CheckStatus::Passing)
            .collect();

        let old = service.overall_status;
        let new = most_severe(failing.iter().copied());

        let snapshot_id = queries::insert_snapshot(
            conn,
            &Snapshot {
                id: 0,
                service_id,
                time: now,
                num_checks_active: active.len() as i64,
                num_checks_passing: (active.len() - failing.len()) as i64,
                num_checks_failing: failing.len() as i64,
                overall_status: new,
                did_send_alert: false,
            },
        )?;
        queries::save_service_status(conn, service_id, new, old)?;

        let decision = escalate::decide(&service, old, new, now, escalator.intervals());
        let AlertDecision::Notify { last_alert_sent } = decision else {
            return Ok((new, None));
        };

        queries::set_last_alert_sent(conn, service_id, last_alert_sent)?;
        queries::mark_snapshot_alerted(conn, snapshot_id)?;

        let alert = ServiceAlert {
            service_id,
            service_name: service.name.clone(),
            url: service.url.clone(),
            status: new,
            previous_status: old,
            failing_checks: failing
                .iter()
                .map(|c| FailingCheck {
                    id: c.id,
                    name: c.name.clone(),
                    importance: c.importance,
                    status: c.calculated_status,
                    runbook: c.runbook.clone(),
                })
                .collect(),
            time: now,
        };
        let dispatch = Dispatch {
            alert,
            users: service.users_to_notify.clone(),
            channels: service.channels.clone(),
            recipient_groups: escalator.recipient_groups(conn, &service, now)?,
        };
        Ok((new, Some(dispatch)))
    })?;

    if let Some(dispatch) = dispatch {
        escalator.dispatch(&dispatch).await;
    }
    Ok(status)
}

/// Recompute every service containing a check. Errors are logged per service.
pub async fn update_services_for_check(
    store: &Store,
    escalator: &Escalator,
    check_id: i64,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    for service_id in store.services_for_check(check_id)? {
        if let Err(e) = update_status(store, escalator, service_id, now).await {
            tracing::error!("Failed to update service {}: {}", service_id, e);
        }
    }
    Ok(())
}
