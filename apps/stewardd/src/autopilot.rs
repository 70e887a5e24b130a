use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::time;
use tracing::{debug, warn};

use steward_kernel::IntentRow;
use steward_topics as topics;

use crate::state::AppState;
use crate::tasks::TaskHandle;
use crate::util;

/// Result of routing one intent through a handler.
#[derive(Debug, Clone)]
pub(crate) struct HandlerOutcome {
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerOutcome {
    #[allow(dead_code)]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Executes one governed intent. Handlers must be safe to re-run: the
/// queue guarantees at-least-once, not exactly-once.
#[async_trait]
pub(crate) trait IntentHandler: Send + Sync {
    async fn execute(&self, intent: &IntentRow) -> Result<HandlerOutcome>;
}

/// Typed intent-type registry, resolved at startup. Type keys are
/// case-normalized; an unknown type is a failed outcome, never an error,
/// and handler errors and panics are contained here.
#[derive(Default)]
pub(crate) struct IntentDispatcher {
    // BTreeMap keeps claim polling order deterministic across ticks
    handlers: BTreeMap<String, Arc<dyn IntentHandler>>,
}

impl IntentDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, intent_type: &str, handler: Arc<dyn IntentHandler>) {
        self.handlers
            .insert(intent_type.to_ascii_lowercase(), handler);
    }

    pub fn types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub async fn dispatch(&self, intent: &IntentRow) -> HandlerOutcome {
        let key = intent.intent_type.to_ascii_lowercase();
        let Some(handler) = self.handlers.get(&key) else {
            return HandlerOutcome::failed(format!(
                "no handler registered for intent type '{}'",
                intent.intent_type
            ));
        };
        match AssertUnwindSafe(handler.execute(intent)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => HandlerOutcome::failed(err.to_string()),
            Err(_) => HandlerOutcome::failed(format!(
                "handler for intent type '{}' panicked",
                intent.intent_type
            )),
        }
    }
}

/// What a single autopilot tick did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AutopilotTick {
    /// Emergency stop active; no repository call was made.
    Stopped,
    /// Governance flag off; no repository call was made.
    Disabled,
    /// Nothing pending.
    Idle,
    Completed(String),
    Failed(String),
}

/// One-tick orchestration: governance gate, claim, execute, close.
///
/// Exactly one intent per tick. That bounds per-tick latency and gives
/// natural backpressure; draining a backlog is the periodic trigger's job.
pub(crate) struct AutopilotLoop {
    state: AppState,
}

impl AutopilotLoop {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run_once(&self) -> Result<AutopilotTick> {
        if steward_core::emergency::active() {
            return Ok(AutopilotTick::Stopped);
        }
        if !self.state.governance().execution_enabled().await? {
            return Ok(AutopilotTick::Disabled);
        }
        let kernel = self.state.kernel();
        let worker_id = self.state.worker_id();
        for intent_type in self.state.dispatcher().types() {
            let Some(intent) = kernel.claim_next_intent_async(&intent_type, worker_id).await?
            else {
                continue;
            };
            self.state.bus().publish(
                topics::TOPIC_INTENT_CLAIMED,
                &json!({
                    "intent_id": intent.id,
                    "intent_type": intent.intent_type,
                    "worker": worker_id,
                }),
            );
            let ok = self.execute_claimed_intent(&intent.id).await?;
            return Ok(if ok {
                AutopilotTick::Completed(intent.id)
            } else {
                AutopilotTick::Failed(intent.id)
            });
        }
        Ok(AutopilotTick::Idle)
    }

    /// Reload, re-check ownership, dispatch, close. The ownership re-check
    /// after claim should never fail; when it does, the intent is left
    /// untouched and `false` is returned silently.
    pub async fn execute_claimed_intent(&self, id: &str) -> Result<bool> {
        let kernel = self.state.kernel();
        let worker_id = self.state.worker_id();
        let Some(intent) = kernel.get_intent_async(id).await? else {
            debug!(intent_id = %id, "claimed intent vanished before execution");
            return Ok(false);
        };
        if intent.status != "running" || intent.claimed_by.as_deref() != Some(worker_id) {
            debug!(
                intent_id = %id,
                status = %intent.status,
                claimed_by = ?intent.claimed_by,
                "ownership re-check failed; leaving intent untouched"
            );
            return Ok(false);
        }

        let bus = self.state.bus();
        // Risk-bearing intents also need a live human approval token.
        let requires_approval = intent
            .payload
            .get("requires_approval")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if requires_approval
            && !self
                .state
                .approvals()
                .is_approved(&intent.decision_id)
                .await?
        {
            let message = "decision not approved";
            if kernel.mark_intent_failed_async(id, worker_id, message).await? {
                bus.publish(
                    topics::TOPIC_INTENT_FAILED,
                    &json!({
                        "intent_id": id,
                        "intent_type": intent.intent_type,
                        "error": message,
                    }),
                );
            }
            return Ok(false);
        }

        let outcome = self.state.dispatcher().dispatch(&intent).await;
        if outcome.success {
            let marked = kernel.mark_intent_completed_async(id, worker_id).await?;
            if marked {
                bus.publish(
                    topics::TOPIC_INTENT_COMPLETED,
                    &json!({
                        "intent_id": id,
                        "intent_type": intent.intent_type,
                        "message": outcome.message,
                    }),
                );
            } else {
                warn!(intent_id = %id, "claim lost between dispatch and completion");
            }
            Ok(marked)
        } else {
            let marked = kernel
                .mark_intent_failed_async(id, worker_id, &outcome.message)
                .await?;
            if marked {
                bus.publish(
                    topics::TOPIC_INTENT_FAILED,
                    &json!({
                        "intent_id": id,
                        "intent_type": intent.intent_type,
                        "error": outcome.message,
                    }),
                );
            } else {
                warn!(intent_id = %id, "claim lost between dispatch and failure record");
            }
            Ok(false)
        }
    }
}

pub(crate) fn start_autopilot(state: AppState) -> TaskHandle {
    TaskHandle::new(
        "autopilot.loop",
        tokio::spawn(async move {
            let looper = AutopilotLoop::new(state);
            let tick = Duration::from_millis(util::env_u64("STEWARD_AUTOPILOT_TICK_MS", 5000));
            loop {
                if let Err(err) = looper.run_once().await {
                    warn!(%err, "autopilot tick errored");
                }
                time::sleep(tick).await;
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::TaskHandlers;
    use crate::snapshot::SnapshotService;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use steward_events::Bus;
    use steward_kernel::Kernel;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        outcome: HandlerOutcome,
    }

    #[async_trait]
    impl IntentHandler for CountingHandler {
        async fn execute(&self, _intent: &IntentRow) -> Result<HandlerOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }
    }

    struct ErroringHandler;

    #[async_trait]
    impl IntentHandler for ErroringHandler {
        async fn execute(&self, _intent: &IntentRow) -> Result<HandlerOutcome> {
            Err(anyhow!("store unavailable"))
        }
    }

    fn state_with(dispatcher: IntentDispatcher) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let bus = Bus::new(64);
        let snapshots = SnapshotService::new(kernel.clone(), bus.clone());
        let state = AppState::new(kernel, bus, TaskHandlers::new(), dispatcher, snapshots);
        (dir, state)
    }

    fn counting_dispatcher(
        outcome: HandlerOutcome,
    ) -> (IntentDispatcher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = IntentDispatcher::new();
        dispatcher.register(
            "analysis",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                outcome,
            }),
        );
        (dispatcher, calls)
    }

    #[tokio::test]
    async fn disabled_governance_makes_no_repository_calls() {
        let _gate = crate::test_support::emergency_clear();
        let (dispatcher, calls) = counting_dispatcher(HandlerOutcome::ok("done"));
        let (_dir, state) = state_with(dispatcher);
        state
            .kernel()
            .insert_intent("dec-1", "analysis", &json!({}))
            .unwrap();

        let looper = AutopilotLoop::new(state.clone());
        assert_eq!(looper.run_once().await.unwrap(), AutopilotTick::Disabled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // The pending intent was never claimed.
        let row = &state.kernel().list_intents(Some("pending"), 10).unwrap()[0];
        assert!(row.claimed_by.is_none());
    }

    #[tokio::test]
    async fn emergency_stop_halts_ticks_before_any_claim() {
        let _gate = crate::test_support::emergency_exclusive();
        let (dispatcher, calls) = counting_dispatcher(HandlerOutcome::ok("done"));
        let (_dir, state) = state_with(dispatcher);
        state.governance().set_execution_enabled(true).await.unwrap();
        state
            .kernel()
            .insert_intent("dec-1", "analysis", &json!({}))
            .unwrap();

        let looper = AutopilotLoop::new(state.clone());
        steward_core::emergency::trip("test");
        assert_eq!(looper.run_once().await.unwrap(), AutopilotTick::Stopped);
        steward_core::emergency::reset();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.kernel().count_intents_by_state("pending").unwrap(), 1);
    }

    #[tokio::test]
    async fn tick_claims_executes_and_completes_one_intent() {
        let _gate = crate::test_support::emergency_clear();
        let (dispatcher, calls) =
            counting_dispatcher(HandlerOutcome::ok_with("analysed", json!({"words": 10})));
        let (_dir, state) = state_with(dispatcher);
        state.governance().set_execution_enabled(true).await.unwrap();
        let first = state
            .kernel()
            .insert_intent("dec-1", "analysis", &json!({}))
            .unwrap();
        state
            .kernel()
            .insert_intent("dec-2", "analysis", &json!({}))
            .unwrap();

        let looper = AutopilotLoop::new(state.clone());
        let mut rx = state.bus().subscribe();

        // Exactly one intent per tick.
        assert_eq!(
            looper.run_once().await.unwrap(),
            AutopilotTick::Completed(first.clone())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.kernel().count_intents_by_state("pending").unwrap(), 1);

        let claimed = rx.recv().await.unwrap();
        assert_eq!(claimed.kind, topics::TOPIC_INTENT_CLAIMED);
        assert_eq!(claimed.payload["intent_id"], first.as_str());
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.kind, topics::TOPIC_INTENT_COMPLETED);

        // Second tick drains the second intent, third is idle.
        assert!(matches!(
            looper.run_once().await.unwrap(),
            AutopilotTick::Completed(_)
        ));
        assert_eq!(looper.run_once().await.unwrap(), AutopilotTick::Idle);
    }

    #[tokio::test]
    async fn failed_outcome_records_message() {
        let _gate = crate::test_support::emergency_clear();
        let (dispatcher, _calls) = counting_dispatcher(HandlerOutcome::failed("target rejected"));
        let (_dir, state) = state_with(dispatcher);
        state.governance().set_execution_enabled(true).await.unwrap();
        let id = state
            .kernel()
            .insert_intent("dec-1", "analysis", &json!({}))
            .unwrap();

        let looper = AutopilotLoop::new(state.clone());
        assert_eq!(
            looper.run_once().await.unwrap(),
            AutopilotTick::Failed(id.clone())
        );
        let row = state.kernel().get_intent(&id).unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error.as_deref(), Some("target rejected"));
    }

    #[tokio::test]
    async fn handler_error_becomes_failed_intent() {
        let _gate = crate::test_support::emergency_clear();
        let mut dispatcher = IntentDispatcher::new();
        dispatcher.register("analysis", Arc::new(ErroringHandler));
        let (_dir, state) = state_with(dispatcher);
        state.governance().set_execution_enabled(true).await.unwrap();
        let id = state
            .kernel()
            .insert_intent("dec-1", "analysis", &json!({}))
            .unwrap();

        let looper = AutopilotLoop::new(state.clone());
        assert_eq!(looper.run_once().await.unwrap(), AutopilotTick::Failed(id.clone()));
        let row = state.kernel().get_intent(&id).unwrap().unwrap();
        assert_eq!(row.error.as_deref(), Some("store unavailable"));
    }

    #[tokio::test]
    async fn unknown_intent_type_is_failed_not_thrown() {
        let (dispatcher, _calls) = counting_dispatcher(HandlerOutcome::ok("done"));
        let (_dir, state) = state_with(dispatcher);
        let id = state
            .kernel()
            .insert_intent("dec-1", "mystery", &json!({}))
            .unwrap();
        let intent = state
            .kernel()
            .claim_next_intent("mystery", state.worker_id())
            .unwrap()
            .unwrap();
        assert_eq!(intent.id, id);

        let outcome = state.dispatcher().dispatch(&intent).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("no handler registered"));
    }

    #[tokio::test]
    async fn unapproved_risky_intent_is_failed_before_dispatch() {
        let _gate = crate::test_support::emergency_clear();
        let (dispatcher, calls) = counting_dispatcher(HandlerOutcome::ok("done"));
        let (_dir, state) = state_with(dispatcher);
        state.governance().set_execution_enabled(true).await.unwrap();
        let looper = AutopilotLoop::new(state.clone());

        let first = state
            .kernel()
            .insert_intent("dec-1", "analysis", &json!({"requires_approval": true}))
            .unwrap();
        assert_eq!(
            looper.run_once().await.unwrap(),
            AutopilotTick::Failed(first.clone())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let row = state.kernel().get_intent(&first).unwrap().unwrap();
        assert_eq!(row.error.as_deref(), Some("decision not approved"));

        // With a live token the same decision executes.
        state
            .approvals()
            .approve("dec-2", "editor@example.com")
            .await
            .unwrap();
        let second = state
            .kernel()
            .insert_intent("dec-2", "analysis", &json!({"requires_approval": true}))
            .unwrap();
        assert_eq!(
            looper.run_once().await.unwrap(),
            AutopilotTick::Completed(second)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execution_is_noop_when_claim_is_foreign() {
        let _gate = crate::test_support::emergency_clear();
        let (dispatcher, calls) = counting_dispatcher(HandlerOutcome::ok("done"));
        let (_dir, state) = state_with(dispatcher);
        let id = state
            .kernel()
            .insert_intent("dec-1", "analysis", &json!({}))
            .unwrap();
        // Another worker identity holds the claim.
        state
            .kernel()
            .claim_next_intent("analysis", "w-somebody-else")
            .unwrap()
            .unwrap();

        let looper = AutopilotLoop::new(state.clone());
        assert!(!looper.execute_claimed_intent(&id).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Intent untouched.
        let row = state.kernel().get_intent(&id).unwrap().unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.claimed_by.as_deref(), Some("w-somebody-else"));
    }
}
