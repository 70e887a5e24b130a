use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use steward_events::Bus;
use steward_kernel::Kernel;
use steward_topics as topics;

/// Reapplies captured state to an entity. One restorer per entity type,
/// registered at startup by the module that owns the entity.
#[async_trait]
pub(crate) trait SnapshotRestorer: Send + Sync {
    async fn restore(&self, entity_id: &str, data: &Value) -> Result<()>;
}

/// Undo support: capture prior state before any destructive apply, restore
/// it later. Snapshots are append-only; retention pruning is the only
/// deletion path and lives in the maintenance loop.
#[derive(Clone)]
pub(crate) struct SnapshotService {
    kernel: Kernel,
    bus: Bus,
    restorers: HashMap<String, Arc<dyn SnapshotRestorer>>,
}

impl SnapshotService {
    pub fn new(kernel: Kernel, bus: Bus) -> Self {
        Self {
            kernel,
            bus,
            restorers: HashMap::new(),
        }
    }

    pub fn register_restorer(&mut self, entity_type: &str, restorer: Arc<dyn SnapshotRestorer>) {
        self.restorers.insert(entity_type.to_string(), restorer);
    }

    /// Capture the entity's current state. Returns the snapshot id, or
    /// `None` when the emergency stop refused the write.
    pub async fn capture(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: &Value,
    ) -> Result<Option<String>> {
        if steward_core::emergency::active() {
            debug!(entity_type, entity_id, "snapshot capture refused: emergency stop");
            return Ok(None);
        }
        let id = self
            .kernel
            .insert_snapshot_async(entity_type, entity_id, data)
            .await?;
        self.bus.publish(
            topics::TOPIC_SNAPSHOT_CAPTURED,
            &json!({"snapshot_id": id, "entity_type": entity_type, "entity_id": entity_id}),
        );
        Ok(Some(id))
    }

    /// Restore the latest (or a specified) snapshot through the registered
    /// restorer for the entity type. Returns false when there is nothing to
    /// restore or the write was refused.
    pub async fn restore(
        &self,
        entity_type: &str,
        entity_id: &str,
        snapshot_id: Option<&str>,
    ) -> Result<bool> {
        if steward_core::emergency::active() {
            debug!(entity_type, entity_id, "snapshot restore refused: emergency stop");
            return Ok(false);
        }
        let row = match snapshot_id {
            Some(id) => self.kernel.get_snapshot_async(id).await?,
            None => self.kernel.latest_snapshot_async(entity_type, entity_id).await?,
        };
        let Some(row) = row else {
            return Ok(false);
        };
        if row.entity_type != entity_type || row.entity_id != entity_id {
            warn!(
                snapshot_id = %row.id,
                expected = %entity_type,
                actual = %row.entity_type,
                "snapshot does not belong to the requested entity"
            );
            return Ok(false);
        }
        let restorer = self
            .restorers
            .get(entity_type)
            .ok_or_else(|| anyhow!("no restorer registered for entity type '{}'", entity_type))?;
        restorer.restore(entity_id, &row.data).await?;
        self.bus.publish(
            topics::TOPIC_SNAPSHOT_RESTORED,
            &json!({"snapshot_id": row.id, "entity_type": entity_type, "entity_id": entity_id}),
        );
        Ok(true)
    }
}

/// Built-in task handler (`snapshot.capture`): captures the entity state
/// described by the task payload, so any producer can request a capture by
/// enqueuing a task instead of linking the service.
pub(crate) struct SnapshotCaptureTask {
    snapshots: SnapshotService,
}

impl SnapshotCaptureTask {
    pub const ACTION: &'static str = "snapshot.capture";

    pub fn new(snapshots: SnapshotService) -> Self {
        Self { snapshots }
    }
}

#[async_trait]
impl crate::handlers::TaskHandler for SnapshotCaptureTask {
    async fn run(&self, task: &steward_kernel::TaskRow) -> Result<()> {
        let entity_type = task
            .payload
            .get("entity_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("payload missing entity_type"))?;
        let entity_id = task
            .payload
            .get("entity_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("payload missing entity_id"))?;
        let data = task.payload.get("data").cloned().unwrap_or_else(|| json!({}));
        self.snapshots
            .capture(entity_type, entity_id, &data)
            .await?
            .ok_or_else(|| anyhow!("capture refused"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingRestorer {
        applied: Arc<Mutex<Vec<(String, Value)>>>,
    }

    #[async_trait]
    impl SnapshotRestorer for RecordingRestorer {
        async fn restore(&self, entity_id: &str, data: &Value) -> Result<()> {
            self.applied
                .lock()
                .unwrap()
                .push((entity_id.to_string(), data.clone()));
            Ok(())
        }
    }

    fn service() -> (
        tempfile::TempDir,
        SnapshotService,
        Arc<Mutex<Vec<(String, Value)>>>,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let bus = Bus::new(16);
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut svc = SnapshotService::new(kernel, bus);
        svc.register_restorer(
            "post",
            Arc::new(RecordingRestorer {
                applied: applied.clone(),
            }),
        );
        (dir, svc, applied)
    }

    #[tokio::test]
    async fn restore_applies_the_latest_capture() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, svc, applied) = service();
        svc.capture("post", "42", &json!({"title": "v1"}))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        svc.capture("post", "42", &json!({"title": "v2"}))
            .await
            .unwrap()
            .unwrap();

        assert!(svc.restore("post", "42", None).await.unwrap());
        let applied = applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, "42");
        assert_eq!(applied[0].1["title"], "v2");
    }

    #[tokio::test]
    async fn restore_by_id_picks_the_named_capture() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, svc, applied) = service();
        let first = svc
            .capture("post", "42", &json!({"title": "v1"}))
            .await
            .unwrap()
            .unwrap();
        svc.capture("post", "42", &json!({"title": "v2"}))
            .await
            .unwrap()
            .unwrap();

        assert!(svc.restore("post", "42", Some(&first)).await.unwrap());
        assert_eq!(applied.lock().unwrap()[0].1["title"], "v1");
        // A snapshot of another entity is never applied.
        assert!(!svc.restore("post", "43", Some(&first)).await.unwrap());
    }

    #[tokio::test]
    async fn restore_without_snapshots_is_false() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, svc, applied) = service();
        assert!(!svc.restore("post", "42", None).await.unwrap());
        assert!(applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_restorer_is_an_error() {
        let _gate = crate::test_support::emergency_clear();
        let (_dir, svc, _applied) = service();
        svc.capture("page", "1", &json!({})).await.unwrap().unwrap();
        assert!(svc.restore("page", "1", None).await.is_err());
    }

    #[tokio::test]
    async fn capture_task_handler_records_a_snapshot() {
        use crate::handlers::TaskHandler as _;
        let _gate = crate::test_support::emergency_clear();
        let (_dir, svc, _applied) = service();
        let kernel = svc.kernel.clone();
        let handler = SnapshotCaptureTask::new(svc);

        kernel
            .enqueue_task(
                SnapshotCaptureTask::ACTION,
                &json!({"entity_type": "post", "entity_id": "42", "data": {"title": "v1"}}),
                None,
                steward_kernel::TaskPriority::Medium,
                3,
            )
            .unwrap();
        let task = kernel.reserve_next_task().unwrap().unwrap();
        handler.run(&task).await.unwrap();

        let snap = kernel.latest_snapshot("post", "42").unwrap().unwrap();
        assert_eq!(snap.data["title"], "v1");
        // Malformed payloads fail the task rather than capturing garbage.
        kernel
            .enqueue_task(
                SnapshotCaptureTask::ACTION,
                &json!({"entity_id": "42"}),
                None,
                steward_kernel::TaskPriority::Medium,
                3,
            )
            .unwrap();
        let bad = kernel.reserve_next_task().unwrap().unwrap();
        assert!(handler.run(&bad).await.is_err());
    }

    #[tokio::test]
    async fn emergency_stop_blocks_capture_and_restore() {
        let _gate = crate::test_support::emergency_exclusive();
        let (_dir, svc, applied) = service();
        svc.capture("post", "42", &json!({"title": "v1"}))
            .await
            .unwrap()
            .unwrap();

        steward_core::emergency::trip("test");
        assert!(svc
            .capture("post", "42", &json!({"title": "v2"}))
            .await
            .unwrap()
            .is_none());
        assert!(!svc.restore("post", "42", None).await.unwrap());
        steward_core::emergency::reset();
        assert!(applied.lock().unwrap().is_empty());
    }
}
