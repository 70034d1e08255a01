//! Escalation: whether a service status change is worth telling someone
//! about, who to tell, and the actual channel dispatch.

use super::oncall;
use crate::db::{DbError, Service, ServiceStatus};
use crate::notify::{ChannelRegistry, ServiceAlert};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

/// Re-notification cooldowns for a sustained non-passing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertIntervals {
    /// Cooldown for a sustained `Warning`.
    pub notification_interval: Duration,
    /// Cooldown for a sustained `Error` or `Critical`.
    pub alert_interval: Duration,
}

impl Default for AlertIntervals {
    fn default() -> Self {
        Self {
            notification_interval: Duration::minutes(120),
            alert_interval: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    Skip,
    /// Send an alert and store `last_alert_sent`.
    Notify { last_alert_sent: Option<DateTime<Utc>> },
}

/// Decide whether a transition from `old` to `new` should alert.
pub fn decide(
    service: &Service,
    old: ServiceStatus,
    new: ServiceStatus,
    now: DateTime<Utc>,
    intervals: &AlertIntervals,
) -> AlertDecision {
    if !service.alerts_enabled {
        return AlertDecision::Skip;
    }

    if new == ServiceStatus::Passing {
        if old == ServiceStatus::Passing {
            return AlertDecision::Skip;
        }
        // Recovery is announced but does not start a cooldown.
        return AlertDecision::Notify { last_alert_sent: None };
    }

    if new == old {
        let cooldown = match new {
            ServiceStatus::Acked => return AlertDecision::Skip,
            ServiceStatus::Warning => intervals.notification_interval,
            _ => intervals.alert_interval,
        };
        if let Some(last) = service.last_alert_sent {
            if now < last + cooldown {
                return AlertDecision::Skip;
            }
        }
    }

    AlertDecision::Notify {
        last_alert_sent: Some(now),
    }
}

/// An alert ready to go out once the status transaction has committed.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub alert: ServiceAlert,
    pub users: Vec<String>,
    pub channels: Vec<String>,
    /// One group per on-call schedule, in schedule order.
    pub recipient_groups: Vec<Vec<String>>,
}

/// Holds the channel registry and the escalation policy.
#[derive(Clone)]
pub struct Escalator {
    registry: ChannelRegistry,
    intervals: AlertIntervals,
    default_recipients: Vec<String>,
}

impl Escalator {
    pub fn new(
        registry: ChannelRegistry,
        intervals: AlertIntervals,
        default_recipients: Vec<String>,
    ) -> Self {
        Self {
            registry,
            intervals,
            default_recipients,
        }
    }

    pub fn intervals(&self) -> &AlertIntervals {
        &self.intervals
    }

    /// Duty officers per schedule, or the default recipients when the
    /// service has no schedules.
    pub fn recipient_groups(
        &self,
        conn: &Connection,
        service: &Service,
        now: DateTime<Utc>,
    ) -> Result<Vec<Vec<String>>, DbError> {
        if service.schedule_ids.is_empty() {
            return Ok(vec![self.default_recipients.clone()]);
        }
        service
            .schedule_ids
            .iter()
            .map(|schedule_id| oncall::duty_officers(conn, *schedule_id, now))
            .collect()
    }

    /// Send through every channel of the service, once per recipient group.
    ///
    /// Failures are logged per channel and never abort the dispatch.
    /// Returns the number of successful sends.
    pub async fn dispatch(&self, dispatch: &Dispatch) -> usize {
        let alert = &dispatch.alert;
        let mut sent = 0;

        for group in &dispatch.recipient_groups {
            if group.is_empty() {
                tracing::warn!(
                    "Service {}: nobody on call, skipping a recipient group",
                    alert.service_name
                );
                continue;
            }

            for name in &dispatch.channels {
                let channel = match self.registry.get(name) {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::error!("Service {}: {}", alert.service_name, e);
                        continue;
                    }
                };

                match channel.send(alert, &dispatch.users, group).await {
                    Ok(()) => sent += 1,
                    Err(e) => tracing::error!(
                        "Service {}: could not send {} alert: {}",
                        alert.service_name,
                        name,
                        e
                    ),
                }
            }
        }

        tracing::info!(
            "Service {}: {} alert sent through {} channel deliveries",
            alert.service_name,
            alert.status,
            sent
        );
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{BrokenChannel, RecordingChannel};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
    }

    fn service(last_alert_sent: Option<DateTime<Utc>>) -> Service {
        Service {
            name: "web".to_string(),
            last_alert_sent,
            ..Default::default()
        }
    }

    fn notify_now() -> AlertDecision {
        AlertDecision::Notify {
            last_alert_sent: Some(t0()),
        }
    }

    #[test]
    fn test_transition_always_notifies() {
        let intervals = AlertIntervals::default();
        let svc = service(Some(t0() - Duration::minutes(1)));
        assert_eq!(
            decide(&svc, ServiceStatus::Warning, ServiceStatus::Error, t0(), &intervals),
            notify_now()
        );
        assert_eq!(
            decide(&svc, ServiceStatus::Passing, ServiceStatus::Acked, t0(), &intervals),
            notify_now()
        );
    }

    #[test]
    fn test_sustained_cooldowns() {
        let intervals = AlertIntervals::default();

        let recent = service(Some(t0() - Duration::minutes(5)));
        assert_eq!(
            decide(&recent, ServiceStatus::Error, ServiceStatus::Error, t0(), &intervals),
            AlertDecision::Skip
        );

        let stale = service(Some(t0() - Duration::minutes(11)));
        assert_eq!(
            decide(&stale, ServiceStatus::Critical, ServiceStatus::Critical, t0(), &intervals),
            notify_now()
        );
        assert_eq!(
            decide(&stale, ServiceStatus::Warning, ServiceStatus::Warning, t0(), &intervals),
            AlertDecision::Skip
        );

        let old = service(Some(t0() - Duration::minutes(121)));
        assert_eq!(
            decide(&old, ServiceStatus::Warning, ServiceStatus::Warning, t0(), &intervals),
            notify_now()
        );

        let never = service(None);
        assert_eq!(
            decide(&never, ServiceStatus::Error, ServiceStatus::Error, t0(), &intervals),
            notify_now()
        );
    }

    #[test]
    fn test_sustained_acked_is_quiet() {
        let intervals = AlertIntervals::default();
        let svc = service(Some(t0() - Duration::days(1)));
        assert_eq!(
            decide(&svc, ServiceStatus::Acked, ServiceStatus::Acked, t0(), &intervals),
            AlertDecision::Skip
        );
    }

    #[test]
    fn test_recovery_clears_last_alert() {
        let intervals = AlertIntervals::default();
        let svc = service(Some(t0() - Duration::minutes(1)));
        assert_eq!(
            decide(&svc, ServiceStatus::Error, ServiceStatus::Passing, t0(), &intervals),
            AlertDecision::Notify {
                last_alert_sent: None
            }
        );
        assert_eq!(
            decide(&svc, ServiceStatus::Passing, ServiceStatus::Passing, t0(), &intervals),
            AlertDecision::Skip
        );
    }

    #[test]
    fn test_disabled_alerts() {
        let svc = Service {
            alerts_enabled: false,
            ..service(None)
        };
        assert_eq!(
            decide(&svc, ServiceStatus::Passing, ServiceStatus::Critical, t0(), &AlertIntervals::default()),
            AlertDecision::Skip
        );
    }

    #[tokio::test]
    async fn test_dispatch_isolates_channel_failures() {
        let recorder = Arc::new(RecordingChannel::default());
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(BrokenChannel));
        registry.register(recorder.clone());
        let escalator = Escalator::new(registry, AlertIntervals::default(), Vec::new());

        let dispatch = Dispatch {
            alert: ServiceAlert {
                service_id: 1,
                service_name: "web".to_string(),
                url: String::new(),
                status: ServiceStatus::Critical,
                previous_status: ServiceStatus::Passing,
                failing_checks: Vec::new(),
                time: t0(),
            },
            users: vec!["watcher".to_string()],
            channels: vec![
                "broken".to_string(),
                "missing".to_string(),
                "recording".to_string(),
            ],
            recipient_groups: vec![vec!["alice".to_string()], Vec::new()],
        };

        assert_eq!(escalator.dispatch(&dispatch).await, 1);
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec!["watcher".to_string()]);
        assert_eq!(sent[0].2, vec!["alice".to_string()]);
    }
}
