//! Injected clock / background-scheduling collaborator.
//!
//! Request transport, config loading, and logging wiring are all kept
//! outside this crate; the one ambient runtime concern the engine cannot
//! avoid owning a seam for is *when things happen* — the current time,
//! and background deletion of orphaned blobs. Both are expressed here so
//! callers can inject deterministic behavior in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Clock and background-task scheduling, injected into the coordinator.
pub trait Timers: Send + Sync + 'static {
    /// Current time, milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Schedule `task` to run in the background. The coordinator uses this
    /// to fire-and-forget orphaned-blob deletion after a transaction
    /// commits; failures inside `task` must be handled by the task itself
    /// (the coordinator does not await this).
    fn spawn_background(&self, task: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Default `Timers` backed by the system clock and a tokio task spawn.
pub struct SystemTimers;

impl Timers for SystemTimers {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }

    fn spawn_background(&self, task: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tokio::spawn(task);
    }
}

/// Convenience constructor used by the coordinator's default wiring.
pub fn system_timers() -> Arc<dyn Timers> {
    Arc::new(SystemTimers)
}
