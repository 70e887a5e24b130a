use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use steward_kernel::TaskRow;

/// One unit of background work, resolved by a task's action name.
///
/// A handler owns its side effects and reports success or failure through
/// its `Result`; the worker turns errors (and panics) into failure outcomes
/// and never lets them escape the tick.
#[async_trait]
pub(crate) trait TaskHandler: Send + Sync {
    async fn run(&self, task: &TaskRow) -> Result<()>;
}

/// Action-name registry, resolved once at startup so the set of runnable
/// actions is explicit rather than discovered by convention.
#[derive(Default)]
pub(crate) struct TaskHandlers {
    map: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: &str, handler: Arc<dyn TaskHandler>) {
        self.map.insert(action.to_string(), handler);
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn TaskHandler>> {
        self.map.get(action).cloned()
    }

    pub fn actions(&self) -> Vec<String> {
        let mut out: Vec<String> = self.map.keys().cloned().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn run(&self, _task: &TaskRow) -> Result<()> {
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn run(&self, _task: &TaskRow) -> Result<()> {
            Err(anyhow!("always fails"))
        }
    }

    #[test]
    fn registry_resolves_by_action_name() {
        let mut handlers = TaskHandlers::new();
        handlers.register("notify", Arc::new(NoopHandler));
        handlers.register("cleanup", Arc::new(FailingHandler));
        assert!(handlers.get("notify").is_some());
        assert!(handlers.get("unknown").is_none());
        assert_eq!(handlers.actions(), vec!["cleanup", "notify"]);
    }
}
