//! Waiting out "no data yet" reads without spinning

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared stop flag checked once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Exponential back-off between retries of a non-blocking read.
///
/// Every delay is bounded by `max`; `reset` goes back to `initial` once data flows.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        // A zero delay would turn the wait into a spin
        let initial = initial.max(Duration::from_micros(100));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay for this retry; the following one doubles up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(20))
    }
}

/// Blocks the loop for up to `timeout` while the source has nothing to give
pub trait Waiter {
    fn wait(&mut self, timeout: Duration);
}

/// Parks the capture thread for the whole delay
#[derive(Debug, Default)]
pub struct SleepWaiter;

impl Waiter for SleepWaiter {
    fn wait(&mut self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}
