use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio::time;
use tracing::{debug, warn};

use steward_topics as topics;

use crate::state::AppState;
use crate::tasks::TaskHandle;
use crate::util;

const SWEEP_LOCK: &str = "maintenance.sweep";

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct SweepSummary {
    pub locks: usize,
    pub approvals: usize,
    pub snapshots: usize,
}

/// One housekeeping pass: reap expired locks and approvals, prune
/// snapshots past retention.
pub(crate) async fn run_sweep(state: &AppState, retention_days: u64) -> Result<SweepSummary> {
    let kernel = state.kernel();
    let locks = kernel.cleanup_expired_locks_async().await?;
    let approvals = kernel.purge_expired_approvals_async().await?;
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(retention_days as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let snapshots = kernel.prune_snapshots_async(&cutoff).await?;
    let summary = SweepSummary {
        locks,
        approvals,
        snapshots,
    };
    state
        .bus()
        .publish(topics::TOPIC_MAINTENANCE_SWEPT, &json!(&summary));
    Ok(summary)
}

/// Counts by state for the diagnostic health event.
pub(crate) async fn health_payload(state: &AppState) -> Result<serde_json::Value> {
    let kernel = state.kernel().clone();
    let counts = tokio::task::spawn_blocking(move || -> Result<serde_json::Value> {
        Ok(json!({
            "tasks": {
                "pending": kernel.count_tasks_by_state("pending")?,
                "reserved": kernel.count_tasks_by_state("reserved")?,
                "failed": kernel.count_tasks_by_state("failed")?,
            },
            "intents": {
                "pending": kernel.count_intents_by_state("pending")?,
                "running": kernel.count_intents_by_state("running")?,
                "failed": kernel.count_intents_by_state("failed")?,
            },
        }))
    })
    .await
    .map_err(|e| anyhow::anyhow!("join error: {}", e))??;
    let mut payload = counts;
    payload["worker"] = json!(state.worker_id());
    payload["emergency_stop"] = json!(steward_core::emergency::active());
    payload["events"] = json!(state.bus().stats());
    Ok(payload)
}

pub(crate) fn start_health(state: AppState) -> TaskHandle {
    TaskHandle::new(
        "maintenance.health",
        tokio::spawn(async move {
            let interval = Duration::from_secs(util::env_u64("STEWARD_HEALTH_INTERVAL_SECS", 60));
            let mut was_stopped = steward_core::emergency::active();
            loop {
                time::sleep(interval).await;
                let stopped = steward_core::emergency::active();
                if stopped && !was_stopped {
                    warn!(
                        target: steward_otel::AUDIT_TARGET,
                        reason = ?steward_core::emergency::reason(),
                        "emergency stop tripped"
                    );
                    state.bus().publish(
                        topics::TOPIC_EMERGENCY_TRIPPED,
                        &json!({"reason": steward_core::emergency::reason()}),
                    );
                }
                was_stopped = stopped;
                match health_payload(&state).await {
                    Ok(payload) => state.bus().publish(topics::TOPIC_SERVICE_HEALTH, &payload),
                    Err(err) => warn!(%err, "health snapshot failed"),
                }
            }
        }),
    )
}

pub(crate) fn start_maintenance(state: AppState) -> TaskHandle {
    TaskHandle::new(
        "maintenance.sweep",
        tokio::spawn(async move {
            let interval =
                Duration::from_secs(util::env_u64("STEWARD_MAINTENANCE_INTERVAL_SECS", 300));
            let retention_days = util::env_u64("STEWARD_SNAPSHOT_RETENTION_DAYS", 30);
            loop {
                time::sleep(interval).await;
                if steward_core::emergency::active() {
                    continue;
                }
                // The lock keeps concurrent daemons from double-sweeping.
                let ttl = Duration::from_secs(steward_kernel::DEFAULT_LOCK_TTL_SECS);
                match state.kernel().acquire_lock_async(SWEEP_LOCK, ttl).await
                {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(%err, "maintenance lock acquisition failed");
                        continue;
                    }
                }
                match run_sweep(&state, retention_days).await {
                    Ok(summary) => debug!(?summary, "maintenance sweep finished"),
                    Err(err) => warn!(%err, "maintenance sweep failed"),
                }
                if let Err(err) = state.kernel().release_lock_async(SWEEP_LOCK).await {
                    warn!(%err, "maintenance lock release failed");
                }
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autopilot::IntentDispatcher;
    use crate::handlers::TaskHandlers;
    use crate::snapshot::SnapshotService;
    use steward_events::Bus;
    use steward_kernel::Kernel;

    fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let bus = Bus::new(16);
        let snapshots = SnapshotService::new(kernel.clone(), bus.clone());
        let state = AppState::new(
            kernel,
            bus,
            TaskHandlers::new(),
            IntentDispatcher::new(),
            snapshots,
        );
        (dir, state)
    }

    #[tokio::test]
    async fn sweep_reaps_expired_rows() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, state) = state();
        let kernel = state.kernel();
        // "held" goes first: each acquire reaps expired rows, so the stale
        // lock must still be on the table when the sweep runs.
        assert!(kernel.acquire_lock("held", Duration::from_secs(300)).unwrap());
        assert!(kernel.acquire_lock("stale", Duration::from_secs(0)).unwrap());
        kernel.insert_snapshot("post", "1", &json!({})).unwrap();

        // Zero retention prunes everything created before the sweep.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let summary = run_sweep(&state, 0).await.unwrap();
        assert_eq!(summary.locks, 1);
        assert_eq!(summary.approvals, 0);
        assert_eq!(summary.snapshots, 1);
        assert!(kernel.is_locked("held").unwrap());
    }

    #[tokio::test]
    async fn health_payload_reports_counts_by_state() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, state) = state();
        let kernel = state.kernel();
        kernel
            .enqueue_task(
                "notify",
                &json!({}),
                None,
                steward_kernel::TaskPriority::Medium,
                3,
            )
            .unwrap();
        kernel.insert_intent("dec-1", "analysis", &json!({})).unwrap();

        let payload = health_payload(&state).await.unwrap();
        assert_eq!(payload["tasks"]["pending"], 1);
        assert_eq!(payload["tasks"]["failed"], 0);
        assert_eq!(payload["intents"]["pending"], 1);
        assert_eq!(payload["emergency_stop"], false);
        assert_eq!(payload["worker"], state.worker_id());
        assert_eq!(payload["events"]["lagged"], 0);
    }

    #[tokio::test]
    async fn sweep_is_a_noop_when_nothing_expired() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, state) = state();
        state.kernel().insert_snapshot("post", "1", &json!({})).unwrap();
        let summary = run_sweep(&state, 30).await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                locks: 0,
                approvals: 0,
                snapshots: 0
            }
        );
    }
}
