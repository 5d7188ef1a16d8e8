//! Background polling that keeps the routing engine in step with its file.

use super::engine::RoutingEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Poll the engine's script source every `interval` and reload on change.
///
/// Reads and compiles run on the blocking pool so a large script never stalls
/// the I/O workers. The task runs until aborted.
pub fn spawn_reload_watcher(engine: Arc<RoutingEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(
            "watching {} every {}ms",
            engine.describe_source(),
            interval.as_millis()
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the script was just loaded.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let engine = Arc::clone(&engine);
            if let Err(e) = tokio::task::spawn_blocking(move || engine.reload_if_changed()).await {
                error!("routing script reload task failed: {}", e);
            }
        }
    })
}
