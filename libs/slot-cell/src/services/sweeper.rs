use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::services::hold::HoldManager;

/// Background task returning abandoned checkouts to the pool. Runs until the runtime stops.
pub fn spawn_hold_sweeper(holds: HoldManager, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Hold sweeper started, interval {:?}", every);
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match holds.sweep_expired().await {
                Ok(0) => debug!("Hold sweep found nothing to clear"),
                Ok(cleared) => debug!("Hold sweep cleared {} holds", cleared),
                Err(e) => error!("Hold sweep failed: {}", e),
            }
        }
    })
}
