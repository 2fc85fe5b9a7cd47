//! Async simulation tasks wrapping backtest runs.
//!
//! Pending -> Running -> (Completed | Failed | Cancelled). The cancel flag is
//! checked by the engine at every per-candle step; terminal tasks are never
//! revived.

use crate::application::backtest::{BacktestEngine, BacktestError, BacktestRequest};
use crate::domain::errors::StoreError;
use crate::domain::ports::{Clock, SimulationTaskStore};
use crate::domain::types::{SimulationTask, SimulationTaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

pub struct SimulationTaskManager {
    engine: Arc<BacktestEngine>,
    store: Arc<dyn SimulationTaskStore>,
    clock: Arc<dyn Clock>,
    cancel_flags: RwLock<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl SimulationTaskManager {
    pub fn new(
        engine: Arc<BacktestEngine>,
        store: Arc<dyn SimulationTaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            store,
            clock,
            cancel_flags: RwLock::new(HashMap::new()),
        }
    }

    /// Queue a backtest and return its task id immediately.
    pub async fn submit(self: &Arc<Self>, request: BacktestRequest) -> Result<Uuid, StoreError> {
        let now = self.clock.now();
        let task = SimulationTask {
            id: Uuid::new_v4(),
            kind: format!("backtest:{}:{}", request.market, request.selection.label()),
            status: SimulationTaskStatus::Pending,
            progress: 0,
            step: "queued".to_string(),
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        };
        self.store.create(&task).await?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .write()
            .await
            .insert(task.id, cancel.clone());

        let manager = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            manager.drive(task, request, cancel).await;
            manager.cancel_flags.write().await.remove(&task_id);
        });
        Ok(task_id)
    }

    /// Request cancellation; the worker observes the flag at its next
    /// per-candle step boundary.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let flags = self.cancel_flags.read().await;
        match flags.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn status(&self, id: Uuid) -> Result<Option<SimulationTask>, StoreError> {
        self.store.get(id).await
    }

    async fn drive(&self, mut task: SimulationTask, request: BacktestRequest, cancel: Arc<AtomicBool>) {
        task.status = SimulationTaskStatus::Running;
        task.step = "starting".to_string();
        task.updated_at = self.clock.now();
        if let Err(err) = self.store.update(&task).await {
            error!(task = %task.id, %err, "failed to mark task running");
            return;
        }

        // Progress flows through a watch channel; a forwarder throttles the
        // store writes so the per-candle callback stays cheap.
        let (progress_tx, mut progress_rx) =
            tokio::sync::watch::channel((0u8, "starting".to_string()));
        let store = self.store.clone();
        let clock = self.clock.clone();
        let mut progress_task = task.clone();
        let forwarder = tokio::spawn(async move {
            while progress_rx.changed().await.is_ok() {
                let (pct, step) = progress_rx.borrow_and_update().clone();
                progress_task.progress = pct.min(100);
                progress_task.step = step;
                progress_task.updated_at = clock.now();
                let _ = store.update(&progress_task).await;
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        });

        let outcome = self
            .engine
            .run_cancellable(&request, &cancel, |pct, step| {
                let _ = progress_tx.send((pct, step.to_string()));
            })
            .await;
        drop(progress_tx);
        forwarder.abort();

        task.updated_at = self.clock.now();
        match outcome {
            Ok(report) => {
                task.status = SimulationTaskStatus::Completed;
                task.progress = 100;
                task.step = "done".to_string();
                task.result = serde_json::to_value(&report).ok();
                info!(task = %task.id, "simulation task completed");
            }
            Err(BacktestError::Cancelled) => {
                task.status = SimulationTaskStatus::Cancelled;
                task.step = "cancelled".to_string();
                info!(task = %task.id, "simulation task cancelled");
            }
            Err(err) => {
                task.status = SimulationTaskStatus::Failed;
                task.step = "failed".to_string();
                task.error = Some(err.to_string());
                error!(task = %task.id, %err, "simulation task failed");
            }
        }
        if let Err(err) = self.store.update(&task).await {
            error!(task = %task.id, %err, "failed to persist terminal task state");
        }
    }
}
