//! Pure domain leaves shared by the kernel and the daemon: retry backoff,
//! deterministic worker identity, staged rollout sampling, and the
//! process-wide emergency stop.

pub mod emergency;
pub mod identity;
pub mod retry;
pub mod rollout;
