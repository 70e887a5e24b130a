//! Canonical event topic constants shared across services.
//!
//! This crate centralizes the string constants used when publishing events
//! so producers and diagnostic consumers stay in sync. Keep this list
//! alphabetized within sections and favor dot.case names.

// Task queue
pub const TOPIC_TASKS_COMPLETED: &str = "tasks.completed";
pub const TOPIC_TASKS_FAILED: &str = "tasks.failed";
pub const TOPIC_TASKS_RETRY_SCHEDULED: &str = "tasks.retry.scheduled";
pub const TOPIC_TASKS_RUNNING: &str = "tasks.running";

// Autopilot intents
pub const TOPIC_INTENT_CLAIMED: &str = "autopilot.intent.claimed";
pub const TOPIC_INTENT_COMPLETED: &str = "autopilot.intent.completed";
pub const TOPIC_INTENT_FAILED: &str = "autopilot.intent.failed";

// Governance / approvals
pub const TOPIC_APPROVAL_GRANTED: &str = "approvals.granted";
pub const TOPIC_APPROVAL_REVOKED: &str = "approvals.revoked";
pub const TOPIC_EMERGENCY_TRIPPED: &str = "emergency.tripped";
pub const TOPIC_GOVERNANCE_CHANGED: &str = "governance.changed";

// Snapshots
pub const TOPIC_SNAPSHOT_CAPTURED: &str = "snapshots.captured";
pub const TOPIC_SNAPSHOT_RESTORED: &str = "snapshots.restored";

// Maintenance
pub const TOPIC_MAINTENANCE_SWEPT: &str = "maintenance.swept";

// Service lifecycle
pub const TOPIC_SERVICE_HEALTH: &str = "service.health";
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";
