use anyhow::Result;
use serde_json::json;
use tracing::info;

use steward_core::rollout::RolloutConfig;
use steward_events::Bus;
use steward_kernel::Kernel;
use steward_topics as topics;

const KEY_EXECUTION_ENABLED: &str = "autopilot.execution_enabled";
const KEY_LEARNING_ENABLED: &str = "autopilot.learning_enabled";
const KEY_ROLLOUT: &str = "autopilot.rollout";

/// Typed view over the persisted governance flags.
///
/// `execution_enabled` is the single switch for all autonomous mutation;
/// everything the autopilot does is downstream of it. Changes are published
/// on the bus and mirrored to the audit log target.
#[derive(Clone)]
pub(crate) struct Governance {
    kernel: Kernel,
    bus: Bus,
}

impl Governance {
    pub fn new(kernel: Kernel, bus: Bus) -> Self {
        Self { kernel, bus }
    }

    pub async fn execution_enabled(&self) -> Result<bool> {
        let v = self.kernel.get_state_async(KEY_EXECUTION_ENABLED).await?;
        Ok(v.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn set_execution_enabled(&self, enabled: bool) -> Result<()> {
        self.kernel
            .set_state_async(KEY_EXECUTION_ENABLED, &json!(enabled))
            .await?;
        self.publish_change(KEY_EXECUTION_ENABLED, &json!(enabled));
        Ok(())
    }

    /// Reserved flag; read but not yet acted on.
    pub async fn learning_enabled(&self) -> Result<bool> {
        let v = self.kernel.get_state_async(KEY_LEARNING_ENABLED).await?;
        Ok(v.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn set_learning_enabled(&self, enabled: bool) -> Result<()> {
        self.kernel
            .set_state_async(KEY_LEARNING_ENABLED, &json!(enabled))
            .await?;
        self.publish_change(KEY_LEARNING_ENABLED, &json!(enabled));
        Ok(())
    }

    pub async fn rollout(&self) -> Result<RolloutConfig> {
        let v = self.kernel.get_state_async(KEY_ROLLOUT).await?;
        Ok(v.and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    pub async fn set_rollout(&self, cfg: RolloutConfig) -> Result<()> {
        let value = serde_json::to_value(cfg)?;
        self.kernel.set_state_async(KEY_ROLLOUT, &value).await?;
        self.publish_change(KEY_ROLLOUT, &value);
        Ok(())
    }

    fn publish_change(&self, key: &str, value: &serde_json::Value) {
        info!(
            target: steward_otel::AUDIT_TARGET,
            key,
            %value,
            "governance flag changed"
        );
        self.bus.publish(
            topics::TOPIC_GOVERNANCE_CHANGED,
            &json!({"key": key, "value": value}),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::rollout::RolloutMode;

    fn governance() -> (tempfile::TempDir, Governance) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let bus = Bus::new(16);
        (dir, Governance::new(kernel, bus))
    }

    #[tokio::test]
    async fn flags_default_to_disabled() {
        let (_dir, gov) = governance();
        assert!(!gov.execution_enabled().await.unwrap());
        assert!(!gov.learning_enabled().await.unwrap());
        let rollout = gov.rollout().await.unwrap();
        assert_eq!(rollout.percent, 0);
        assert_eq!(rollout.mode, RolloutMode::Manual);
    }

    #[tokio::test]
    async fn flags_round_trip_and_publish() {
        let (_dir, gov) = governance();
        let mut rx = gov.bus.subscribe();

        gov.set_execution_enabled(true).await.unwrap();
        assert!(gov.execution_enabled().await.unwrap());
        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, topics::TOPIC_GOVERNANCE_CHANGED);
        assert_eq!(env.payload["key"], "autopilot.execution_enabled");

        gov.set_learning_enabled(true).await.unwrap();
        assert!(gov.learning_enabled().await.unwrap());

        gov.set_rollout(RolloutConfig {
            mode: RolloutMode::Auto,
            percent: 25,
        })
        .await
        .unwrap();
        let rollout = gov.rollout().await.unwrap();
        assert_eq!(rollout.percent, 25);
        assert_eq!(rollout.mode, RolloutMode::Auto);
    }
}
