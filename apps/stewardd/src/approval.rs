use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use steward_events::Bus;
use steward_kernel::Kernel;
use steward_topics as topics;

/// Manual, per-decision human gate. Distinct from the governance flag:
/// some actions need a human click in addition to the system being
/// enabled. Tokens expire after 48 hours.
#[derive(Clone)]
pub(crate) struct ApprovalService {
    kernel: Kernel,
    bus: Bus,
}

impl ApprovalService {
    pub fn new(kernel: Kernel, bus: Bus) -> Self {
        Self { kernel, bus }
    }

    /// Returns false (and records nothing) while the emergency stop is
    /// active.
    pub async fn approve(&self, decision_id: &str, user: &str) -> Result<bool> {
        if steward_core::emergency::active() {
            warn!(decision_id, "approval refused: emergency stop active");
            return Ok(false);
        }
        self.kernel.insert_approval_async(decision_id, user).await?;
        info!(
            target: steward_otel::AUDIT_TARGET,
            decision_id,
            approved_by = user,
            "decision approved"
        );
        self.bus.publish(
            topics::TOPIC_APPROVAL_GRANTED,
            &json!({"decision_id": decision_id, "approved_by": user}),
        );
        Ok(true)
    }

    pub async fn is_approved(&self, decision_id: &str) -> Result<bool> {
        Ok(self
            .kernel
            .find_valid_approval_async(decision_id)
            .await?
            .is_some())
    }

    pub async fn revoke(&self, decision_id: &str) -> Result<bool> {
        let removed = self.kernel.delete_approval_async(decision_id).await?;
        if removed {
            info!(
                target: steward_otel::AUDIT_TARGET,
                decision_id,
                "approval revoked"
            );
            self.bus.publish(
                topics::TOPIC_APPROVAL_REVOKED,
                &json!({"decision_id": decision_id}),
            );
        }
        Ok(removed)
    }
}

// Admin surfaces are queue producers, not linked callers: approvals arrive
// as tasks and these handlers bridge them onto the service.

pub(crate) struct ApprovalGrantTask {
    approvals: ApprovalService,
}

impl ApprovalGrantTask {
    pub const ACTION: &'static str = "approval.grant";

    pub fn new(approvals: ApprovalService) -> Self {
        Self { approvals }
    }
}

#[async_trait::async_trait]
impl crate::handlers::TaskHandler for ApprovalGrantTask {
    async fn run(&self, task: &steward_kernel::TaskRow) -> anyhow::Result<()> {
        let decision_id = payload_str(task, "decision_id")?;
        let user = payload_str(task, "user")?;
        if !self.approvals.approve(&decision_id, &user).await? {
            anyhow::bail!("approval refused");
        }
        Ok(())
    }
}

pub(crate) struct ApprovalRevokeTask {
    approvals: ApprovalService,
}

impl ApprovalRevokeTask {
    pub const ACTION: &'static str = "approval.revoke";

    pub fn new(approvals: ApprovalService) -> Self {
        Self { approvals }
    }
}

#[async_trait::async_trait]
impl crate::handlers::TaskHandler for ApprovalRevokeTask {
    async fn run(&self, task: &steward_kernel::TaskRow) -> anyhow::Result<()> {
        let decision_id = payload_str(task, "decision_id")?;
        // Revoking an absent token is fine; the intent is "make sure it's gone".
        self.approvals.revoke(&decision_id).await?;
        Ok(())
    }
}

fn payload_str(task: &steward_kernel::TaskRow, key: &str) -> anyhow::Result<String> {
    task.payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("payload missing {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::TaskHandler as _;

    fn service() -> (tempfile::TempDir, ApprovalService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        (dir, ApprovalService::new(kernel, Bus::new(16)))
    }

    #[tokio::test]
    async fn approve_then_revoke_round_trip() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, svc) = service();
        let mut rx = svc.bus.subscribe();

        assert!(!svc.is_approved("dec-1").await.unwrap());
        assert!(svc.approve("dec-1", "editor@example.com").await.unwrap());
        assert!(svc.is_approved("dec-1").await.unwrap());
        assert_eq!(rx.recv().await.unwrap().kind, topics::TOPIC_APPROVAL_GRANTED);

        assert!(svc.revoke("dec-1").await.unwrap());
        assert!(!svc.is_approved("dec-1").await.unwrap());
        assert_eq!(rx.recv().await.unwrap().kind, topics::TOPIC_APPROVAL_REVOKED);
        // Revoking twice is a quiet no-op.
        assert!(!svc.revoke("dec-1").await.unwrap());
    }

    #[tokio::test]
    async fn grant_and_revoke_tasks_bridge_onto_the_service() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, svc) = service();
        let kernel = svc.kernel.clone();
        let grant = ApprovalGrantTask::new(svc.clone());
        let revoke = ApprovalRevokeTask::new(svc.clone());

        kernel
            .enqueue_task(
                ApprovalGrantTask::ACTION,
                &serde_json::json!({"decision_id": "dec-1", "user": "editor@example.com"}),
                None,
                steward_kernel::TaskPriority::High,
                3,
            )
            .unwrap();
        let task = kernel.reserve_next_task().unwrap().unwrap();
        grant.run(&task).await.unwrap();
        assert!(svc.is_approved("dec-1").await.unwrap());

        kernel
            .enqueue_task(
                ApprovalRevokeTask::ACTION,
                &serde_json::json!({"decision_id": "dec-1"}),
                None,
                steward_kernel::TaskPriority::High,
                3,
            )
            .unwrap();
        let task = kernel.reserve_next_task().unwrap().unwrap();
        revoke.run(&task).await.unwrap();
        assert!(!svc.is_approved("dec-1").await.unwrap());

        // A grant without a user is a task failure, not a silent grant.
        kernel
            .enqueue_task(
                ApprovalGrantTask::ACTION,
                &serde_json::json!({"decision_id": "dec-2"}),
                None,
                steward_kernel::TaskPriority::High,
                3,
            )
            .unwrap();
        let task = kernel.reserve_next_task().unwrap().unwrap();
        assert!(grant.run(&task).await.is_err());
    }

    #[tokio::test]
    async fn emergency_stop_refuses_new_approvals() {
        let _gate = crate::test_support::emergency_exclusive();
        let (_dir, svc) = service();
        steward_core::emergency::trip("test");
        assert!(!svc.approve("dec-1", "editor@example.com").await.unwrap());
        steward_core::emergency::reset();
        assert!(!svc.is_approved("dec-1").await.unwrap());
    }
}
