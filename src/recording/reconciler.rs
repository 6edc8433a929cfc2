//! Background reconciliation and retention pass

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::SessionManager;

/// Run [`SessionManager::reconcile`] on the configured interval until
/// `shutdown` fires
pub fn spawn_reconciler(
    manager: Arc<SessionManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let period = manager.config().retention.reconcile_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Reconciler running every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => manager.reconcile().await,
                _ = shutdown.recv() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    })
}
