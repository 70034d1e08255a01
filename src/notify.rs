//! Alert channels and their registry.
//!
//! Channels are registered by name at start-up. Services refer to them by
//! that name, so an unknown name is reported at dispatch time rather than
//! failing the whole cycle.

use crate::db::{CheckStatus, Importance, ServiceStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("unknown alert channel: {0}")]
    UnknownChannel(String),
}

/// A check that contributed to a service's status.
#[derive(Debug, Clone, Serialize)]
pub struct FailingCheck {
    pub id: i64,
    pub name: String,
    pub importance: Importance,
    pub status: CheckStatus,
    pub runbook: Option<String>,
}

/// What a channel is asked to deliver.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceAlert {
    pub service_id: i64,
    pub service_name: String,
    pub url: String,
    pub status: ServiceStatus,
    pub previous_status: ServiceStatus,
    pub failing_checks: Vec<FailingCheck>,
    pub time: DateTime<Utc>,
}

impl ServiceAlert {
    pub fn is_recovery(&self) -> bool {
        self.status == ServiceStatus::Passing
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        if self.is_recovery() {
            return format!(
                "Service {} is back to normal (was {})",
                self.service_name, self.previous_status
            );
        }
        let names: Vec<&str> = self.failing_checks.iter().map(|c| c.name.as_str()).collect();
        format!(
            "Service {} reporting {} status: {}",
            self.service_name,
            self.status,
            names.join(", ")
        )
    }
}

/// A way of delivering alerts to people.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Registry name, e.g. `"log"` or `"email"`.
    fn name(&self) -> &str;

    /// Deliver an alert. `users` are the service's subscribers, `duty_officers`
    /// the on-call recipients for this dispatch.
    async fn send(
        &self,
        alert: &ServiceAlert,
        users: &[String],
        duty_officers: &[String],
    ) -> Result<(), NotifyError>;
}

/// Channels available to services, by name.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn AlertChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Arc<dyn AlertChannel>) {
        let name = channel.name().to_string();
        tracing::info!("Registered alert channel: {}", name);
        self.channels.insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AlertChannel>, NotifyError> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| NotifyError::UnknownChannel(name.to_string()))
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Registered channel names, sorted.
    pub fn channel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        alert: &ServiceAlert,
        users: &[String],
        duty_officers: &[String],
    ) -> Result<(), NotifyError> {
        if alert.is_recovery() {
            tracing::info!(
                service = %alert.service_name,
                users = ?users,
                duty_officers = ?duty_officers,
                "{}",
                alert.summary()
            );
        } else {
            tracing::warn!(
                service = %alert.service_name,
                status = %alert.status,
                users = ?users,
                duty_officers = ?duty_officers,
                "{}",
                alert.summary()
            );
        }
        Ok(())
    }
}
