//! Graceful shutdown, in six bounded phases:
//! 1. stop accepting new surface requests
//! 2. drain in-flight surface requests
//! 3. stop auxiliary subscriptions (registry ingestion, timers)
//! 4. flush outstanding publishes
//! 5. close the results subscription
//! 6. close backend connections
//!
//! A phase that exceeds its deadline is abandoned and logged; shutdown
//! always makes forward progress.

use crate::state::AppState;
use message_bus::{BufferedPublisher, SubscriptionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    pub state: AppState,
    /// Subscriptions closed in phase 3 (everything but results).
    pub aux_subscriptions: Vec<SubscriptionHandle>,
    /// The results subscription, closed last among consumers (phase 5).
    pub results_subscription: Option<SubscriptionHandle>,
    pub publisher: Option<Arc<BufferedPublisher>>,
    /// Periodic background loops, aborted in phase 3.
    pub background: Vec<JoinHandle<()>>,
    pub phase_timeout: Duration,
}

impl ShutdownCoordinator {
    async fn bounded<F: std::future::Future<Output = ()>>(&self, phase: &str, f: F) {
        if tokio::time::timeout(self.phase_timeout, f).await.is_err() {
            warn!(phase, "shutdown phase exceeded its deadline, forcing close");
        }
    }

    pub async fn run(mut self) {
        info!("graceful shutdown started");

        // Phase 1: no new surface requests.
        self.state.stop_accepting();
        info!(phase = 1, "stopped accepting surface requests");

        // Phase 2: drain in-flight surface requests. The HTTP server has
        // already stopped accepting; give handlers a moment to finish.
        self.bounded("drain_http", async {
            tokio::time::sleep(Duration::from_millis(250)).await;
        })
        .await;
        info!(phase = 2, "surface requests drained");

        // Phase 3: stop auxiliary consumption and timers, keep results.
        for handle in self.background.drain(..) {
            handle.abort();
        }
        let aux = std::mem::take(&mut self.aux_subscriptions);
        self.bounded("aux_subscriptions", async {
            for subscription in aux {
                subscription.shutdown().await;
            }
        })
        .await;
        info!(phase = 3, "auxiliary subscriptions closed");

        // Phase 4: flush outstanding publishes.
        if let Some(publisher) = self.publisher.take() {
            self.bounded("flush_publishes", publisher.shutdown()).await;
        }
        info!(phase = 4, "outbound publishes flushed");

        // Phase 5: close the results subscription.
        if let Some(results) = self.results_subscription.take() {
            self.bounded("results_subscription", results.shutdown()).await;
        }
        info!(phase = 5, "results subscription closed");

        // Phase 6: connections close when their owners drop.
        info!(phase = 6, "closing backend connections");
        info!("graceful shutdown complete");
    }
}
