use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// How the rollout percentage is managed. `Auto` means an external control
/// loop may adjust the percentage; `Manual` means an operator owns it.
/// The sampler itself does not interpret the mode.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RolloutMode {
    Auto,
    #[default]
    Manual,
}

impl RolloutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutMode::Auto => "auto",
            RolloutMode::Manual => "manual",
        }
    }
}

impl std::str::FromStr for RolloutMode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "automatic" => Ok(RolloutMode::Auto),
            "manual" => Ok(RolloutMode::Manual),
            _ => Err(()),
        }
    }
}

/// Staged-exposure configuration. Inclusion is computed, never stored:
/// an entity's bucket is a stable hash, so raising the percentage only
/// ever adds entities.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutConfig {
    #[serde(default)]
    pub mode: RolloutMode,
    #[serde(default)]
    pub percent: u8,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            mode: RolloutMode::Manual,
            percent: 0,
        }
    }
}

impl RolloutConfig {
    pub fn allows(&self, salt: &str, tenant: &str, entity_id: &str) -> bool {
        if self.percent == 0 {
            return false;
        }
        if self.percent >= 100 {
            return true;
        }
        bucket(salt, tenant, entity_id) < self.percent
    }
}

/// Deterministic bucket in [0,100) for an entity under a salt and tenant.
pub fn bucket(salt: &str, tenant: &str, entity_id: &str) -> u8 {
    let mut h = sha2::Sha256::new();
    h.update(salt.as_bytes());
    h.update(b"|");
    h.update(tenant.as_bytes());
    h.update(b"|");
    h.update(entity_id.as_bytes());
    let digest = h.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % 100) as u8
}
