//! Shared cooldown gate used when an upstream starts throttling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Once tripped, every caller of [`RateGate::wait`] blocks until the single
/// armed cooldown elapses. Trips while a cooldown is armed are absorbed.
#[derive(Debug, Default)]
pub struct RateGate {
    deadline: Mutex<Option<Instant>>,
    armed: AtomicU64,
}

impl RateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the gate for `cooldown` unless a cooldown is already pending.
    /// Returns `true` when this call armed the timer.
    pub async fn trip(&self, cooldown: Duration) -> bool {
        let mut deadline = self.deadline.lock().await;
        let now = Instant::now();
        if matches!(*deadline, Some(until) if until > now) {
            debug!("rate gate already armed");
            return false;
        }
        *deadline = Some(now + cooldown);
        self.armed.fetch_add(1, Ordering::Relaxed);
        warn!(cooldown_secs = cooldown.as_secs_f64(), "rate gate armed");
        true
    }

    /// Blocks until the armed cooldown, if any, has elapsed.
    pub async fn wait(&self) {
        let until = {
            let mut deadline = self.deadline.lock().await;
            match *deadline {
                Some(until) if until > Instant::now() => Some(until),
                Some(_) => {
                    *deadline = None;
                    None
                }
                None => None,
            }
        };
        if let Some(until) = until {
            sleep_until(until).await;
        }
    }

    pub async fn is_armed(&self) -> bool {
        matches!(*self.deadline.lock().await, Some(until) if until > Instant::now())
    }

    /// Number of cooldown timers armed over the gate's lifetime.
    pub fn times_armed(&self) -> u64 {
        self.armed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn concurrent_trips_share_one_cooldown() {
        let gate = Arc::new(RateGate::new());
        let cooldown = Duration::from_secs(30);
        let start = Instant::now();

        let mut handles = Vec::new();
        for offset in 0..5u64 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(offset)).await;
                gate.trip(cooldown).await;
                gate.wait().await;
                Instant::now()
            }));
        }

        for handle in handles {
            let released = handle.await.expect("caller task");
            assert_eq!(released.duration_since(start), cooldown);
        }
        assert_eq!(gate.times_armed(), 1);
        assert!(!gate.is_armed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_gate_does_not_block() {
        let gate = RateGate::new();
        let start = Instant::now();
        gate.wait().await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_rearms_after_cooldown_elapses() {
        let gate = RateGate::new();
        assert!(gate.trip(Duration::from_secs(5)).await);
        assert!(!gate.trip(Duration::from_secs(5)).await);
        gate.wait().await;
        assert!(gate.trip(Duration::from_secs(5)).await);
        assert_eq!(gate.times_armed(), 2);
    }
}
