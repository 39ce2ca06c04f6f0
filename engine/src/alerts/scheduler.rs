//! Periodic detection loop

use super::AnomalyDetector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run detection every `interval` until `shutdown` flips to `true`
///
/// The first run happens immediately. Missed ticks are skipped rather than
/// replayed back to back.
pub fn spawn_detection_loop(
    detector: Arc<AnomalyDetector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Anomaly detection running every {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = detector.run_anomaly_detection().await;
                    if report.success {
                        debug!("Detection pass raised {} alert(s)", report.alerts_created.len());
                    } else {
                        warn!(
                            "Detection pass failed: {}",
                            report.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Anomaly detection stopped");
    })
}
