//! Background loops owned by the orchestrator.
//!
//! Each loop is its own tokio task with its own interval. A panic inside a
//! tick is caught and logged; the loop keeps running. All loops stop on the
//! shared cancellation token.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::orchestrator::pipeline::PipelineOrchestrator;

/// Shortest allowed loop period.
const MIN_PERIOD: Duration = Duration::from_millis(10);

pub struct BackgroundTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn health, metrics, drain, housekeeping, and configuration-watch
    /// loops for `orchestrator`.
    pub fn spawn(orchestrator: &Arc<PipelineOrchestrator>) -> Self {
        let token = CancellationToken::new();
        let config = orchestrator.config().clone();

        let health = {
            let o = Arc::clone(orchestrator);
            spawn_loop("health", config.health_check_interval, token.clone(), move || {
                let o = Arc::clone(&o);
                async move {
                    o.run_health_check().await;
                }
            })
        };
        let metrics = {
            let o = Arc::clone(orchestrator);
            spawn_loop("metrics", config.metrics_interval, token.clone(), move || {
                let o = Arc::clone(&o);
                async move { o.log_metrics().await }
            })
        };
        let drain = {
            let o = Arc::clone(orchestrator);
            spawn_loop("drain", config.drain_interval, token.clone(), move || {
                let o = Arc::clone(&o);
                async move {
                    o.drain_once().await;
                }
            })
        };
        let housekeeping = {
            let o = Arc::clone(orchestrator);
            spawn_loop(
                "housekeeping",
                config.housekeeping_interval,
                token.clone(),
                move || {
                    let o = Arc::clone(&o);
                    async move {
                        o.housekeeping().await;
                    }
                },
            )
        };
        // Subscribe before spawning so no change is missed.
        let changes = orchestrator.tenants().subscribe();
        let watcher = spawn_config_watcher(Arc::clone(orchestrator), changes, token.clone());

        info!("Background loops started");
        Self {
            token,
            handles: vec![health, metrics, drain, housekeeping, watcher],
        }
    }

    /// Cancel every loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background loop ended abnormally");
            }
        }
        info!("Background loops stopped");
    }
}

/// Run `tick` every `period` until cancelled. The first tick is skipped.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if AssertUnwindSafe(tick()).catch_unwind().await.is_err() {
                error!(task = name, "Background tick panicked");
            }
        }
        debug!(task = name, "Background loop exited");
    })
}

/// Apply configuration changes to the orchestrator's tenant policies.
fn spawn_config_watcher(
    orchestrator: Arc<PipelineOrchestrator>,
    mut changes: broadcast::Receiver<crate::tenant::ConfigurationChange>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = changes.recv() => received,
            };
            match received {
                Ok(change) => orchestrator.apply_change(&change).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Configuration watcher lagged, resyncing tenants");
                    orchestrator.sync_tenants().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(task = "config_watcher", "Background loop exited");
    })
}
