//! Per-item attempt bookkeeping with a bounded retry ceiling.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gamepick_core::EntryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failed attempt.
    pub ceiling: u32,
    /// Cooldown applied through the rate gate when a retryable failure shows up.
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn new(ceiling: u32, cooldown: Duration) -> Self {
        Self { ceiling, cooldown }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Default)]
struct LedgerState {
    attempts: HashMap<EntryId, u32>,
    exhausted: BTreeSet<EntryId>,
}

/// Tracks retryable failures per item for the lifetime of one job pass.
#[derive(Debug)]
pub struct RetryLedger {
    policy: RetryPolicy,
    state: Mutex<LedgerState>,
}

impl RetryLedger {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `false` once `attempt_count` failed attempts exceed the ceiling.
    pub fn should_retry(&self, _id: EntryId, attempt_count: u32) -> bool {
        attempt_count <= self.policy.ceiling
    }

    /// Counts one more retryable failure for `id` and decides whether it gets
    /// another attempt. Exhausted items stay exhausted for the rest of the pass.
    pub fn record_failure(&self, id: EntryId) -> RetryDecision {
        let mut state = self.state();
        if state.exhausted.contains(&id) {
            let attempts = state.attempts.get(&id).copied().unwrap_or(0);
            return RetryDecision::Exhausted { attempts };
        }
        let attempt = {
            let count = state.attempts.entry(id).or_insert(0);
            *count += 1;
            *count
        };
        if self.should_retry(id, attempt) {
            RetryDecision::Retry { attempt }
        } else {
            state.exhausted.insert(id);
            RetryDecision::Exhausted { attempts: attempt }
        }
    }

    pub fn attempts(&self, id: EntryId) -> u32 {
        self.state().attempts.get(&id).copied().unwrap_or(0)
    }

    pub fn is_exhausted(&self, id: EntryId) -> bool {
        self.state().exhausted.contains(&id)
    }

    pub fn exhausted(&self) -> Vec<EntryId> {
        self.state().exhausted.iter().copied().collect()
    }

    /// Ids that failed at least once and are still eligible for another attempt.
    pub fn outstanding(&self) -> usize {
        let state = self.state();
        state
            .attempts
            .keys()
            .filter(|id| !state.exhausted.contains(id))
            .count()
    }
}
