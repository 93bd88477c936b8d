use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Consecutive failures that force a server restart.
pub const RESTART_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    Ok,
    Escalating(u32),
    Restarting,
}

/// What the retry loop should do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    Restart,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureState {
    pub consecutive_failures: u32,
    pub restarts: u64,
}

/// Turns repeated soft failures into a server restart.
#[derive(Debug)]
pub struct EscalationPolicy {
    state: EscalationState,
    failures: FailureState,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationPolicy {
    pub fn new() -> Self {
        Self {
            state: EscalationState::Ok,
            failures: FailureState::default(),
        }
    }

    pub fn state(&self) -> EscalationState {
        self.state
    }

    pub fn failures(&self) -> FailureState {
        self.failures
    }

    pub fn record_success(&mut self) {
        if self.failures.consecutive_failures > 0 {
            info!(
                "Vision server recovered after {} failed attempts",
                self.failures.consecutive_failures
            );
        }
        self.failures.consecutive_failures = 0;
        self.state = EscalationState::Ok;
    }

    pub fn record_failure(&mut self) -> Verdict {
        self.failures.consecutive_failures += 1;
        let n = self.failures.consecutive_failures;
        if n >= RESTART_THRESHOLD {
            warn!("{n} consecutive failures, restarting vision server");
            self.state = EscalationState::Restarting;
            Verdict::Restart
        } else {
            warn!("Escalation level {n}/{RESTART_THRESHOLD}");
            self.state = EscalationState::Escalating(n);
            Verdict::Retry
        }
    }

    /// Called once the restart triggered by `Verdict::Restart` has run,
    /// whether or not the new server came up.
    pub fn restart_completed(&mut self) {
        self.failures.restarts += 1;
        self.failures.consecutive_failures = 0;
        self.state = EscalationState::Ok;
    }
}

/// Exponential backoff for callers that would rather skip a cycle than wait.
#[derive(Debug)]
pub struct SoftBackoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
    disabled_until: Option<Instant>,
}

impl SoftBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: None,
            disabled_until: None,
        }
    }

    /// Time left before analysis may be tried again, if any.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.disabled_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    pub fn on_failure(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        self.disabled_until = Some(Instant::now() + next);
        warn!("Vision analysis disabled for {}s", next.as_secs());
        next
    }

    pub fn on_success(&mut self) {
        self.current = None;
        self.disabled_until = None;
    }
}
