//! Write fault injection for in-memory devices.

use crate::error::{DeviceError, DeviceResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

/// Controls the outcome and timing of writes on an in-memory device.
///
/// Used to simulate failing media and slow completions:
/// - `fail_next_writes(n)` makes the next `n` writes fail with an I/O error
/// - `hold_writes()` parks every write until `release_writes()` is called
#[derive(Debug)]
pub struct FaultInjector {
    failing_writes: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl Default for FaultInjector {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            failing_writes: AtomicUsize::new(0),
            gate,
        }
    }
}

impl FaultInjector {
    /// Creates an injector that lets every write through.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Parks writes until [`Self::release_writes`] is called.
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    /// Lets parked and future writes proceed.
    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Waits for the gate, then consumes one injected failure if any.
    pub(crate) async fn before_write(&self) -> DeviceResult<()> {
        let mut gate = self.gate.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = gate.wait_for(|open| *open).await;

        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(DeviceError::InjectedFault);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let faults = FaultInjector::new();
        faults.fail_next_writes(2);
        assert!(faults.before_write().await.is_err());
        assert!(faults.before_write().await.is_err());
        assert!(faults.before_write().await.is_ok());
    }

    #[tokio::test]
    async fn held_writes_resume_after_release() {
        let faults = std::sync::Arc::new(FaultInjector::new());
        faults.hold_writes();

        let waiter = {
            let faults = std::sync::Arc::clone(&faults);
            tokio::spawn(async move { faults.before_write().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        faults.release_writes();
        assert!(waiter.await.unwrap().is_ok());
    }
}
