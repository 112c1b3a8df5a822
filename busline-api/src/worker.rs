use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::state::AppState;

/// Run the expiration sweeper every `every` until shutdown is signalled.
pub async fn run_sweeper(state: AppState, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval = ?every, "Expiration sweeper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = state.sweeper.sweep().await;
                state.metrics.record_sweep(&report);
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Expiration sweeper stopped");
}

/// Poll the reminder queue every `every` until shutdown is signalled.
/// A full batch is followed by an immediate re-poll.
pub async fn run_reminder_dispatcher(state: AppState, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval = ?every, "Reminder dispatcher started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                loop {
                    match state.dispatcher.dispatch_once().await {
                        Ok(report) => {
                            state.metrics.record_dispatch(&report);
                            if report.claimed < state.dispatcher.batch_size() || *shutdown.borrow() {
                                break;
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "Reminder poll failed");
                            break;
                        }
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Reminder dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use busline_booking::{BookingSettings, DispatchSettings, Services};
    use busline_core::clock::SystemClock;
    use busline_core::memory::{
        InMemoryBookingRepository, InMemoryDelayedQueue, InMemoryPaymentGateway, InMemorySeatLockStore,
        InMemoryTripCatalog, InMemoryUserDirectory, RecordingNotifier,
    };
    use std::sync::Arc;

    fn state() -> AppState {
        let services = Services {
            bookings: Arc::new(InMemoryBookingRepository::new()),
            locks: Arc::new(InMemorySeatLockStore::new()),
            queue: Arc::new(InMemoryDelayedQueue::new()),
            trips: Arc::new(InMemoryTripCatalog::new()),
            users: Arc::new(InMemoryUserDirectory::new()),
            payments: Arc::new(InMemoryPaymentGateway::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            clock: Arc::new(SystemClock),
        };
        AppState::new(
            services,
            BookingSettings::default(),
            DispatchSettings::default(),
            Metrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let state = state();
        let (tx, rx) = watch::channel(false);

        let sweeper = tokio::spawn(run_sweeper(state.clone(), Duration::from_millis(10), rx.clone()));
        let dispatcher = tokio::spawn(run_reminder_dispatcher(state.clone(), Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), sweeper).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), dispatcher).await.unwrap().unwrap();

        let text = state.metrics.render().unwrap();
        assert!(!text.contains("busline_sweeper_runs_total 0"));
    }
}
