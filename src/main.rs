//! Vigil - service monitoring engine.

use vigil::clock::{Clock, SystemClock};
use vigil::config::EngineConfig;
use vigil::db::Store;
use vigil::notify::{ChannelRegistry, LogChannel};
use vigil::probe::ProbeRunner;
use vigil::scheduler::{AckSweeper, Scheduler, SchedulerConfig};
use vigil::service::Escalator;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("vigil=info".parse()?))
        .init();

    // Load configuration
    let cfg = EngineConfig::load();
    tracing::info!("Starting Vigil...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let mut registry = ChannelRegistry::new();
    registry.register(Arc::new(LogChannel));
    tracing::info!("Alert channels: {}", registry.channel_names().join(", "));
    let escalator = Escalator::new(registry, cfg.intervals(), cfg.default_recipients.clone());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(ProbeRunner::new().with_jitter(1000)),
        escalator,
        clock.clone(),
        SchedulerConfig {
            tick: cfg.tick(),
            probe_timeout: cfg.probe_timeout(),
            max_concurrent_checks: cfg.max_concurrent_checks,
        },
    );
    let sweeper = AckSweeper::new(store, clock, cfg.ack_sweep());

    scheduler.start().await;
    sweeper.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop().await;
    sweeper.stop().await;

    Ok(())
}
