use std::borrow::Cow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A named supervised background loop.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_inner(self) -> (Cow<'static, str>, JoinHandle<()>) {
        (self.name, self.handle)
    }
}

#[derive(Default)]
pub(crate) struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    /// Give each loop `grace` to wind down on its own, then abort it.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            let (name, mut handle) = task.into_inner();
            if grace.is_zero() {
                handle.abort();
                let _ = handle.await;
                debug!(task = %name, "task aborted");
                continue;
            }
            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    } else {
                        debug!(task = %name, "task completed");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    let _ = handle.await;
                    debug!(task = %name, "task aborted after grace period");
                }
            }
        }
    }
}
