use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

static TRIPPED: AtomicBool = AtomicBool::new(false);
static REASON: OnceCell<RwLock<Option<String>>> = OnceCell::new();

fn reason_cell() -> &'static RwLock<Option<String>> {
    REASON.get_or_init(|| RwLock::new(None))
}

/// Seed the kill switch from the environment (`STEWARD_EMERGENCY_STOP=1`).
/// Called once at startup; a seeded stop can still be reset at runtime by
/// an operator action.
pub fn init_from_env() {
    if matches!(
        std::env::var("STEWARD_EMERGENCY_STOP").ok().as_deref(),
        Some("1") | Some("true")
    ) {
        trip("seeded from environment");
    }
}

/// Whether the emergency stop is active. Read-mostly; every mutating entry
/// point checks this before starting new work. Work already in flight is
/// not interrupted.
pub fn active() -> bool {
    TRIPPED.load(Ordering::Relaxed)
}

pub fn trip(reason: &str) {
    if let Ok(mut r) = reason_cell().write() {
        *r = Some(reason.to_string());
    }
    TRIPPED.store(true, Ordering::Relaxed);
}

pub fn reset() {
    TRIPPED.store(false, Ordering::Relaxed);
    if let Ok(mut r) = reason_cell().write() {
        *r = None;
    }
}

pub fn reason() -> Option<String> {
    reason_cell().read().ok().and_then(|r| r.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trip_and_reset_round_trip() {
        reset();
        assert!(!active());
        trip("operator pressed the big red button");
        assert!(active());
        assert_eq!(
            reason().as_deref(),
            Some("operator pressed the big red button")
        );
        reset();
        assert!(!active());
        assert!(reason().is_none());
    }
}
