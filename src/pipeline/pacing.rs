//! Process-wide pacing of outgoing LLM calls.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket with burst 1: at most one call may start per interval,
/// measured across all workers. Every LLM call acquires before sending.
pub struct RateGate {
    interval: Duration,
    next_ready: Mutex<Instant>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_ready: Mutex::new(Instant::now()),
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::new(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Wait until a token is available, then claim it. The mutex is held
    /// across the sleep so waiters serialise in arrival order.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut next_ready = self.next_ready.lock().await;
        let now = Instant::now();
        if *next_ready > now {
            tokio::time::sleep_until(*next_ready).await;
        }
        *next_ready = Instant::now() + self.interval;
    }
}
