//! Background task closing expired acknowledgements.

use crate::ack;
use crate::clock::Clock;
use crate::db::{DbError, Store};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Periodically closes acknowledgements whose expiry has passed.
pub struct AckSweeper {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    period: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl AckSweeper {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            store,
            clock,
            period,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the sweeper background task.
    pub async fn start(&self) {
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        {
            let mut stop_guard = self.stop.lock().await;
            *stop_guard = Some(tx);
        }

        let store = self.store.clone();
        let clock = self.clock.clone();
        let mut interval = tokio::time::interval(self.period);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = sweep_once(&store, clock.as_ref()) {
                            tracing::error!("AckSweeper: Failed to close expired acknowledgements: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the sweeper.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Close every expired acknowledgement as of the clock's current time.
pub fn sweep_once(store: &Store, clock: &dyn Clock) -> Result<usize, DbError> {
    let closed = ack::sweep_expired(store, clock.now())?;
    if closed > 0 {
        tracing::info!("AckSweeper: Closed {} expired acknowledgements", closed);
    }
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::NewAcknowledgement;
    use crate::clock::ManualClock;
    use crate::db::Check;
    use crate::probe::ProbeSpec;
    use chrono::{TimeZone, Utc};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_sweeper_closes_expired() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut check = Check {
            name: "queue".to_string(),
            probe: ProbeSpec::tcp("localhost", 5672),
            ..Default::default()
        };
        let check_id = store.add_check(&mut check).unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let new = NewAcknowledgement {
            expire_at: Some(t0 + chrono::Duration::hours(1)),
            ..NewAcknowledgement::for_check(check_id)
        };
        assert_ok!(ack::create(&store, new, t0));

        let clock = Arc::new(ManualClock::new(t0));
        assert_eq!(assert_ok!(sweep_once(&store, clock.as_ref())), 0);

        clock.advance(chrono::Duration::hours(2));
        let sweeper = AckSweeper::new(store.clone(), clock.clone(), Duration::from_millis(10));
        sweeper.start().await;
        for _ in 0..50 {
            if ack::list_open(&store).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.stop().await;

        assert!(ack::list_open(&store).unwrap().is_empty());
        let closed = ack::recently_closed(&store, t0, 12).unwrap();
        assert_eq!(closed[0].closed_reason.as_deref(), Some(ack::REASON_EXPIRED));
    }
}
