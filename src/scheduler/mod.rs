//! Scheduler module: the tick loop that gates, runs and aggregates checks.

pub mod gate;
mod sweeper;

pub use gate::should_run;
pub use sweeper::*;

use crate::clock::Clock;
use crate::db::{queries, Check, CheckResult, DbError, Store};
use crate::executor::run_check;
use crate::probe::Probe;
use crate::service::{self, Escalator};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_checks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(60),
            max_concurrent_checks: 8,
        }
    }
}

struct Shared {
    store: Arc<Store>,
    probe: Arc<dyn Probe>,
    escalator: Escalator,
    clock: Arc<dyn Clock>,
    probe_timeout: Duration,
    semaphore: Semaphore,
    in_flight: Mutex<HashSet<i64>>,
}

/// Removes a check from the in-flight set when its task ends, panics included.
struct InFlight {
    shared: Arc<Shared>,
    check_id: i64,
}

impl InFlight {
    fn claim(shared: &Arc<Shared>, check_id: i64) -> Option<Self> {
        let mut running = shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(check_id) {
            return None;
        }
        Some(Self {
            shared: shared.clone(),
            check_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut running = self.shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.check_id);
    }
}

/// Runs due checks every tick, then recomputes every service.
pub struct Scheduler {
    shared: Arc<Shared>,
    tick: Duration,
    stop: tokio::sync::Mutex<Option<broadcast::Sender<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        probe: Arc<dyn Probe>,
        escalator: Escalator,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = config.max_concurrent_checks.max(1);
        Self {
            shared: Arc::new(Shared {
                store,
                probe,
                escalator,
                clock,
                probe_timeout: config.probe_timeout,
                semaphore: Semaphore::new(permits),
                in_flight: Mutex::new(HashSet::new()),
            }),
            tick: config.tick,
            stop: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the background tick loop.
    pub async fn start(&self) {
        let (tx, mut rx) = broadcast::channel(1);
        {
            let mut stop = self.stop.lock().await;
            if stop.is_some() {
                return; // Already running
            }
            *stop = Some(tx);
        }

        tracing::info!("Starting scheduler, tick every {:?}", self.tick);

        let shared = self.shared.clone();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        run_tick(&shared).await;
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        });
    }

    /// Stop the tick loop. Checks already running finish on their own.
    pub async fn stop(&self) {
        let mut stop = self.stop.lock().await;
        if let Some(tx) = stop.take() {
            let _ = tx.send(());
        }
    }

    /// Run one tick in the foreground. Returns the number of checks run.
    pub async fn tick(&self) -> usize {
        run_tick(&self.shared).await
    }

    /// Run a check immediately, ignoring the gate, then refresh its services.
    ///
    /// Returns `None` when the check is already running.
    pub async fn run_now(&self, check_id: i64) -> Result<Option<CheckResult>, DbError> {
        let shared = &self.shared;
        let check = shared.store.get_check(check_id)?;
        let Some(_guard) = InFlight::claim(shared, check_id) else {
            tracing::warn!("Check {} is already running", check.name);
            return Ok(None);
        };

        let result = execute(shared, &check).await?;
        service::update_services_for_check(
            &shared.store,
            &shared.escalator,
            check_id,
            shared.clock.now(),
        )
        .await?;
        Ok(Some(result))
    }
}

async fn execute(shared: &Shared, check: &Check) -> Result<CheckResult, DbError> {
    // The semaphore is never closed.
    let _permit = shared.semaphore.acquire().await.ok();
    run_check(
        &shared.store,
        shared.probe.as_ref(),
        check,
        shared.probe_timeout,
        shared.clock.as_ref(),
    )
    .await
}

async fn run_tick(shared: &Arc<Shared>) -> usize {
    let now = shared.clock.now();
    let checks = match shared.store.list_active_checks() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Scheduler: Failed to list checks: {}", e);
            return 0;
        }
    };

    let mut tasks = JoinSet::new();
    for check in checks {
        match should_run(&shared.store, &check, now) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!("Scheduler: Gate failed for {}: {}", check.name, e);
                continue;
            }
        }

        let Some(guard) = InFlight::claim(shared, check.id) else {
            tracing::warn!("Skipping {}, previous run still in flight", check.name);
            continue;
        };

        let shared = shared.clone();
        tasks.spawn(async move {
            let _guard = guard;
            if let Err(e) = execute(&shared, &check).await {
                tracing::error!("Scheduler: Failed to record result for {}: {}", check.name, e);
            }
        });
    }

    let mut ran = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(()) => ran += 1,
            Err(e) => tracing::error!("Scheduler: Check task failed: {}", e),
        }
    }

    update_all_services(shared).await;
    ran
}

async fn update_all_services(shared: &Shared) {
    let service_ids = match shared.store.read(queries::list_service_ids) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!("Scheduler: Failed to list services: {}", e);
            return;
        }
    };

    let now = shared.clock.now();
    for service_id in service_ids {
        if let Err(e) = service::update_status(&shared.store, &shared.escalator, service_id, now).await {
            tracing::error!("Scheduler: Failed to update service {}: {}", service_id, e);
        }
    }
}
