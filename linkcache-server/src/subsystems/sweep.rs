//! Background expiry sweep
//!
//! Request paths already prune before they read, so this loop only bounds
//! memory for agents that stopped polling.

use std::sync::Arc;

use linkcache_core::config::StoreConfig;
use linkcache_core::SessionStore;
use tokio::sync::broadcast;

/// Drop expired records once, returning how many were removed.
pub fn sweep_once(store: &SessionStore, max_age: chrono::Duration) -> usize {
    let before = store.len();
    store.prune(max_age);
    before.saturating_sub(store.len())
}

pub async fn run_sweep_loop(
    store: Arc<SessionStore>,
    config: StoreConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    if config.sweep_interval_seconds == 0 {
        tracing::info!("Expiry sweep disabled (sweep_interval_seconds = 0)");
        return;
    }

    let max_age = config.max_entry_age();
    let interval = tokio::time::Duration::from_secs(config.sweep_interval_seconds);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        "Expiry sweep started (interval: {}s, max age: {}s)",
        config.sweep_interval_seconds,
        config.max_entry_age_seconds
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = sweep_once(&store, max_age);
                if removed > 0 {
                    tracing::debug!(removed, remaining = store.len(), "Expired sessions swept");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Expiry sweep shutting down");
                break;
            }
        }
    }
}
