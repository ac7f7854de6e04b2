//! Background maintenance for the databus server.

use databus_core::Databus;
use tokio::time::{sleep, Duration};

/// Starts the periodic sweep of expired subscriptions, expired events,
/// aged-out mutation history and finished jobs.
///
/// Runs until the process exits. An interval of 0 disables the task.
pub async fn start_sweep_task(bus: Databus, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::warn!("sweep task disabled (interval=0)");
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    tracing::info!(interval_secs, "starting sweep task");

    loop {
        sleep(interval).await;

        match bus.sweep().await {
            Ok(report) => {
                if report.subscriptions + report.events + report.mutations + report.jobs > 0 {
                    tracing::info!(
                        subscriptions = report.subscriptions,
                        events = report.events,
                        mutations = report.mutations,
                        jobs = report.jobs,
                        "swept expired bus state"
                    );
                }
            }
            Err(e) => {
                tracing::error!("sweep failed: {}", e);
            }
        }
    }
}
