use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// The emergency stop is process-wide; tests that trip it take the write
// side, tests that rely on it being clear take the read side.
static EMERGENCY_GATE: RwLock<()> = RwLock::new(());

pub(crate) fn emergency_clear() -> RwLockReadGuard<'static, ()> {
    EMERGENCY_GATE.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn emergency_exclusive() -> RwLockWriteGuard<'static, ()> {
    EMERGENCY_GATE.write().unwrap_or_else(|e| e.into_inner())
}
