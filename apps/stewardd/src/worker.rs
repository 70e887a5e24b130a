use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::FutureExt;
use serde_json::json;
use tokio::time;
use tracing::warn;

use steward_core::retry::RetryPolicy;
use steward_topics as topics;

use crate::state::AppState;
use crate::tasks::TaskHandle;
use crate::util;

/// What a single worker tick did. Callers and tests can tell "nothing to
/// do" apart from "refused to run" and "ran and failed".
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WorkerTick {
    /// The tick did not run: emergency stop, or another tick in flight.
    Skipped(&'static str),
    /// Nothing was due.
    Idle,
    Completed(String),
    Failed { id: String, terminal: bool },
}

/// Pulls one reserved task per tick and dispatches it to a registered
/// handler. Handler errors and panics become failure outcomes; a handler
/// can never crash the worker.
pub(crate) struct TaskWorker {
    state: AppState,
    retry: RetryPolicy,
    in_flight: Arc<AtomicBool>,
}

impl TaskWorker {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            retry: RetryPolicy,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run_once(&self) -> Result<WorkerTick> {
        if steward_core::emergency::active() {
            return Ok(WorkerTick::Skipped("emergency-stop"));
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Ok(WorkerTick::Skipped("tick-in-flight"));
        }
        let tick = self.tick_inner().await;
        self.in_flight.store(false, Ordering::SeqCst);
        tick
    }

    async fn tick_inner(&self) -> Result<WorkerTick> {
        let kernel = self.state.kernel();
        let Some(task) = kernel.reserve_next_task_async().await? else {
            return Ok(WorkerTick::Idle);
        };
        let bus = self.state.bus();
        bus.publish(
            topics::TOPIC_TASKS_RUNNING,
            &json!({"id": task.id, "action": task.action, "attempt": task.attempts + 1}),
        );

        let outcome = match self.state.handlers().get(&task.action) {
            None => Err(anyhow!("no handler registered for action '{}'", task.action)),
            Some(handler) => match AssertUnwindSafe(handler.run(&task)).catch_unwind().await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("handler for '{}' panicked", task.action)),
            },
        };

        match outcome {
            Ok(()) => {
                kernel.complete_task_async(&task.id).await?;
                bus.publish(
                    topics::TOPIC_TASKS_COMPLETED,
                    &json!({"id": task.id, "action": task.action}),
                );
                Ok(WorkerTick::Completed(task.id))
            }
            Err(err) => {
                // attempts on the row predates this failure
                let attempt = (task.attempts as u32).saturating_add(1);
                let delay = self.retry.next_delay(attempt);
                let status = kernel
                    .fail_task_async(&task.id, &err.to_string(), delay)
                    .await?;
                let terminal = status.as_deref() == Some("failed");
                if terminal {
                    warn!(id = %task.id, action = %task.action, %err, "task failed terminally");
                    bus.publish(
                        topics::TOPIC_TASKS_FAILED,
                        &json!({"id": task.id, "action": task.action, "error": err.to_string()}),
                    );
                } else {
                    bus.publish(
                        topics::TOPIC_TASKS_RETRY_SCHEDULED,
                        &json!({
                            "id": task.id,
                            "action": task.action,
                            "attempt": attempt,
                            "delay_secs": delay.as_secs(),
                        }),
                    );
                }
                Ok(WorkerTick::Failed {
                    id: task.id,
                    terminal,
                })
            }
        }
    }
}

pub(crate) fn start_task_worker(state: AppState) -> TaskHandle {
    TaskHandle::new(
        "worker.tasks",
        tokio::spawn(async move {
            let worker = TaskWorker::new(state);
            let idle = Duration::from_millis(util::env_u64("STEWARD_WORKER_IDLE_MS", 1000));
            loop {
                match worker.run_once().await {
                    Ok(WorkerTick::Completed(_)) | Ok(WorkerTick::Failed { .. }) => {}
                    Ok(_) => time::sleep(idle).await,
                    Err(err) => {
                        warn!(%err, "worker tick errored");
                        time::sleep(idle).await;
                    }
                }
            }
        }),
    )
}
