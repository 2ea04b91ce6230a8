//! Per-task timeout watchdog.
//!
//! A timer is armed when a task envelope is published and disarmed when its
//! result arrives. Expired timers emit a fire record on a channel; the
//! service turns it into a synthetic stage failure. A periodic overdue scan
//! over the store covers timers lost to a restart. Double fires are
//! harmless: the dedup record makes the second application a no-op.

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TimeoutFire {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub stage: String,
}

pub struct Watchdog {
    timers: DashMap<Uuid, CancellationToken>,
    by_workflow: DashMap<Uuid, Vec<Uuid>>,
    tx: mpsc::UnboundedSender<TimeoutFire>,
}

impl Watchdog {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimeoutFire>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { timers: DashMap::new(), by_workflow: DashMap::new(), tx }, rx)
    }

    pub fn arm(&self, task_id: Uuid, workflow_id: Uuid, stage: String, timeout: Duration) {
        let token = CancellationToken::new();
        self.timers.insert(task_id, token.clone());
        self.by_workflow.entry(workflow_id).or_default().push(task_id);

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(%task_id, "watchdog disarmed");
                }
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(TimeoutFire { task_id, workflow_id, stage });
                }
            }
        });
    }

    pub fn disarm(&self, task_id: Uuid) {
        if let Some((_, token)) = self.timers.remove(&task_id) {
            token.cancel();
        }
    }

    pub fn disarm_workflow(&self, workflow_id: Uuid) {
        if let Some((_, task_ids)) = self.by_workflow.remove(&workflow_id) {
            for task_id in task_ids {
                self.disarm(task_id);
            }
        }
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_timer_fires_once() {
        let (watchdog, mut rx) = Watchdog::new();
        let task_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();

        watchdog.arm(task_id, workflow_id, "scaffold".to_string(), Duration::from_millis(10));
        let fire = rx.recv().await.unwrap();
        assert_eq!(fire.task_id, task_id);
        assert_eq!(fire.stage, "scaffold");
    }

    #[tokio::test]
    async fn disarmed_timer_does_not_fire() {
        let (watchdog, mut rx) = Watchdog::new();
        let task_id = Uuid::new_v4();

        watchdog.arm(task_id, Uuid::new_v4(), "scaffold".to_string(), Duration::from_millis(30));
        watchdog.disarm(task_id);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn workflow_disarm_cancels_all_timers() {
        let (watchdog, mut rx) = Watchdog::new();
        let workflow_id = Uuid::new_v4();

        watchdog.arm(Uuid::new_v4(), workflow_id, "a".to_string(), Duration::from_millis(30));
        watchdog.arm(Uuid::new_v4(), workflow_id, "b".to_string(), Duration::from_millis(30));
        watchdog.disarm_workflow(workflow_id);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
