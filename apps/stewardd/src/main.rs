mod analysis;
mod approval;
mod autopilot;
mod governance;
mod handlers;
mod maintenance;
mod snapshot;
mod state;
mod tasks;
#[cfg(test)]
mod test_support;
mod util;
mod worker;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use steward_events::Bus;
use steward_kernel::Kernel;
use steward_topics as topics;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    steward_otel::init();
    steward_core::emergency::init_from_env();
    if steward_core::emergency::active() {
        warn!(
            reason = ?steward_core::emergency::reason(),
            "emergency stop active at startup; no new work will start"
        );
    }

    let state_dir = std::env::var("STEWARD_STATE_DIR").unwrap_or_else(|_| "state".to_string());
    tokio::fs::create_dir_all(&state_dir).await?;
    let kernel = Kernel::open(Path::new(&state_dir))?;
    let bus = Bus::new(256);

    // Entity restorers are registered by the feature modules that own the
    // entities; the core daemon ships none.
    let snapshots = snapshot::SnapshotService::new(kernel.clone(), bus.clone());

    let approvals = approval::ApprovalService::new(kernel.clone(), bus.clone());

    let mut handlers = handlers::TaskHandlers::new();
    handlers.register(
        snapshot::SnapshotCaptureTask::ACTION,
        Arc::new(snapshot::SnapshotCaptureTask::new(snapshots.clone())),
    );
    handlers.register(
        approval::ApprovalGrantTask::ACTION,
        Arc::new(approval::ApprovalGrantTask::new(approvals.clone())),
    );
    handlers.register(
        approval::ApprovalRevokeTask::ACTION,
        Arc::new(approval::ApprovalRevokeTask::new(approvals)),
    );

    let mut dispatcher = autopilot::IntentDispatcher::new();
    dispatcher.register(
        analysis::INTENT_TYPE,
        Arc::new(analysis::AnalysisHandler::new(kernel.clone())),
    );

    let state = AppState::new(kernel, bus.clone(), handlers, dispatcher, snapshots);
    seed_governance(&state).await?;

    let rollout = state.governance().rollout().await?;
    info!(
        worker = %state.worker_id(),
        state_dir = %state_dir,
        actions = ?state.handlers().actions(),
        intent_types = ?state.dispatcher().types(),
        execution_enabled = state.governance().execution_enabled().await?,
        learning_enabled = state.governance().learning_enabled().await?,
        rollout_mode = rollout.mode.as_str(),
        rollout_percent = rollout.percent,
        "stewardd starting"
    );
    bus.publish(
        topics::TOPIC_SERVICE_START,
        &json!({"worker": state.worker_id()}),
    );

    let mut supervisor = tasks::TaskManager::new();
    supervisor.push(worker::start_task_worker(state.clone()));
    supervisor.push(autopilot::start_autopilot(state.clone()));
    supervisor.push(maintenance::start_maintenance(state.clone()));
    supervisor.push(maintenance::start_health(state.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    bus.publish(
        topics::TOPIC_SERVICE_STOP,
        &json!({"worker": state.worker_id()}),
    );
    supervisor.shutdown_with_grace(Duration::from_secs(3)).await;
    Ok(())
}

/// Apply one-shot governance overrides from the environment. The flags are
/// normally edited by the external admin surface; these make bootstrapping
/// and recovery possible without one.
async fn seed_governance(state: &AppState) -> Result<()> {
    let governance = state.governance();
    if let Some(enabled) = util::env_bool("STEWARD_EXECUTION_ENABLED") {
        governance.set_execution_enabled(enabled).await?;
    }
    if let Some(enabled) = util::env_bool("STEWARD_LEARNING_ENABLED") {
        governance.set_learning_enabled(enabled).await?;
    }
    let percent = std::env::var("STEWARD_ROLLOUT_PERCENT")
        .ok()
        .and_then(|s| s.trim().parse::<u8>().ok());
    let mode = std::env::var("STEWARD_ROLLOUT_MODE")
        .ok()
        .and_then(|s| s.parse::<steward_core::rollout::RolloutMode>().ok());
    if percent.is_some() || mode.is_some() {
        let mut rollout = governance.rollout().await?;
        if let Some(p) = percent {
            rollout.percent = p.min(100);
        }
        if let Some(m) = mode {
            rollout.mode = m;
        }
        governance.set_rollout(rollout).await?;
    }
    Ok(())
}
