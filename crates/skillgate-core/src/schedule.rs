//! Fixed-cadence background loops with cooperative shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::metrics::METRICS;

/// Call `tick` every `period` until `shutdown` flips to `true` or its sender
/// is dropped. The first tick runs immediately. A tick that overruns delays
/// the next one instead of bursting.
pub(crate) async fn run_every<F, Fut>(
    task: &str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(task = %task, period_secs = period.as_secs(), "background task started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                debug!(task = %task, "tick");
                tick().await;
                METRICS.flush();
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(task = %task, "background task stopped");
}
