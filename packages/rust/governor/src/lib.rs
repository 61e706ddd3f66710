//! Per-target adaptive rate governor with circuit breaking.
//!
//! Every external call goes through [`RateGovernor::wait_for_slot`] first.
//! Failures widen a target's pacing delay multiplicatively; successes relax
//! it. After enough consecutive failures the target enters a cooldown window
//! during which no call is dispatched at all — a circuit breaker, not
//! infinite backoff, so a target is eventually retried rather than abandoned.
//!
//! State is per-target and shared process-wide across all workers. The
//! governor serializes its own updates; callers never coordinate.

pub mod classifier;

pub use classifier::{FailureClassifier, Signature};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use ditta_shared::RateConfig;

// ---------------------------------------------------------------------------
// GovernorConfig
// ---------------------------------------------------------------------------

/// Pacing parameters for the governor.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Starting and minimum inter-call delay per target.
    pub min_delay: Duration,
    /// Cap on the per-target delay.
    pub max_delay: Duration,
    /// Delay multiplier on failure (>= 1.5).
    pub backoff_factor: f64,
    /// Delay multiplier on success (< 1).
    pub recovery_factor: f64,
    /// Upper bound on random jitter added to each wait.
    pub jitter: Duration,
    /// Consecutive failures before the circuit opens.
    pub cooldown_threshold: u32,
    /// Absolute cap on a cooldown window.
    pub cooldown_cap: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::from(&RateConfig::default())
    }
}

impl From<&RateConfig> for GovernorConfig {
    fn from(config: &RateConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor.max(1.5),
            recovery_factor: config.recovery_factor.clamp(0.1, 0.99),
            jitter: Duration::from_millis(config.jitter_ms),
            cooldown_threshold: config.cooldown_threshold.max(1),
            cooldown_cap: Duration::from_secs(config.cooldown_cap_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-target state
// ---------------------------------------------------------------------------

/// Pacing state for one rate-limited target. Lives for the worker process;
/// never persisted.
#[derive(Debug, Clone)]
struct TargetState {
    current_delay: Duration,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    last_access: Option<Instant>,
}

impl TargetState {
    fn new(min_delay: Duration) -> Self {
        Self {
            current_delay: min_delay,
            consecutive_failures: 0,
            cooldown_until: None,
            last_access: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RateGovernor
// ---------------------------------------------------------------------------

/// Process-wide pacing authority for all external targets.
pub struct RateGovernor {
    config: GovernorConfig,
    targets: Mutex<HashMap<String, TargetState>>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Suspend the caller until it is safe to contact `target`, then claim
    /// the slot. Enforces cooldown windows, minimum inter-call spacing since
    /// the target's last access, and small random jitter so parallel workers
    /// never synchronize into a thundering herd.
    pub async fn wait_for_slot(&self, target: &str) {
        loop {
            let wait = self.try_claim(target);
            let Some(wait) = wait else {
                return;
            };

            let jitter = self.sample_jitter();
            debug!(target, wait_ms = wait.as_millis() as u64, "waiting for slot");
            tokio::time::sleep(wait + jitter).await;
        }
    }

    /// Claim a slot if one is free right now. Returns `None` on success, or
    /// the remaining wait otherwise. The lock is never held across an await.
    fn try_claim(&self, target: &str) -> Option<Duration> {
        let mut targets = self.targets.lock().expect("governor lock poisoned");
        let state = targets
            .entry(target.to_string())
            .or_insert_with(|| TargetState::new(self.config.min_delay));

        let now = Instant::now();

        if let Some(until) = state.cooldown_until {
            if until > now {
                return Some(until - now);
            }
            // Cooldown elapsed; the circuit half-opens and the next call probes.
            state.cooldown_until = None;
        }

        if let Some(last) = state.last_access {
            let due = last + state.current_delay;
            if due > now {
                return Some(due - now);
            }
        }

        state.last_access = Some(now);
        None
    }

    /// Record a successful call: relax the delay toward the floor and close
    /// the circuit.
    pub fn report_success(&self, target: &str) {
        let mut targets = self.targets.lock().expect("governor lock poisoned");
        let state = targets
            .entry(target.to_string())
            .or_insert_with(|| TargetState::new(self.config.min_delay));

        state.consecutive_failures = 0;
        state.cooldown_until = None;
        let relaxed = state.current_delay.mul_f64(self.config.recovery_factor);
        state.current_delay = relaxed.max(self.config.min_delay);
    }

    /// Record a failed call: widen the delay and, past the threshold, open
    /// the circuit for a cooldown window that scales with the current delay.
    pub fn report_failure(&self, target: &str) {
        let mut targets = self.targets.lock().expect("governor lock poisoned");
        let state = targets
            .entry(target.to_string())
            .or_insert_with(|| TargetState::new(self.config.min_delay));

        state.consecutive_failures += 1;
        let widened = state.current_delay.mul_f64(self.config.backoff_factor);
        state.current_delay = widened.min(self.config.max_delay);

        if state.consecutive_failures >= self.config.cooldown_threshold {
            let cooldown = (state.current_delay * 4).min(self.config.cooldown_cap);
            state.cooldown_until = Some(Instant::now() + cooldown);
            warn!(
                target,
                failures = state.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "target entering cooldown"
            );
        }
    }

    /// Whether the target's circuit is currently open.
    pub fn in_cooldown(&self, target: &str) -> bool {
        let targets = self.targets.lock().expect("governor lock poisoned");
        targets
            .get(target)
            .and_then(|s| s.cooldown_until)
            .is_some_and(|until| until > Instant::now())
    }

    /// Current pacing delay for a target (min delay for unknown targets).
    pub fn current_delay(&self, target: &str) -> Duration {
        let targets = self.targets.lock().expect("governor lock poisoned");
        targets
            .get(target)
            .map(|s| s.current_delay)
            .unwrap_or(self.config.min_delay)
    }

    /// Drop all learned state for a target. The only destructive mutation.
    pub fn reset(&self, target: &str) {
        let mut targets = self.targets.lock().expect("governor lock poisoned");
        targets.remove(target);
    }

    fn sample_jitter(&self) -> Duration {
        let max = self.config.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> GovernorConfig {
        GovernorConfig {
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(80),
            backoff_factor: 2.0,
            recovery_factor: 0.5,
            jitter: Duration::ZERO,
            cooldown_threshold: 3,
            cooldown_cap: Duration::from_millis(60),
        }
    }

    #[test]
    fn failure_widens_delay_up_to_cap() {
        let governor = RateGovernor::new(fast_config());
        for _ in 0..10 {
            governor.report_failure("example.com");
        }
        assert_eq!(
            governor.current_delay("example.com"),
            Duration::from_millis(80)
        );
    }

    #[test]
    fn success_relaxes_delay_down_to_floor() {
        let governor = RateGovernor::new(fast_config());
        governor.report_failure("example.com");
        governor.report_failure("example.com");
        let widened = governor.current_delay("example.com");
        assert!(widened > Duration::from_millis(5));

        for _ in 0..10 {
            governor.report_success("example.com");
        }
        assert_eq!(
            governor.current_delay("example.com"),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn targets_are_isolated() {
        let governor = RateGovernor::new(fast_config());
        for _ in 0..5 {
            governor.report_failure("blocked.example");
        }
        assert!(governor.in_cooldown("blocked.example"));
        assert!(!governor.in_cooldown("healthy.example"));
        assert_eq!(
            governor.current_delay("healthy.example"),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn cooldown_opens_at_threshold() {
        let governor = RateGovernor::new(fast_config());
        governor.report_failure("example.com");
        governor.report_failure("example.com");
        assert!(!governor.in_cooldown("example.com"));
        governor.report_failure("example.com");
        assert!(governor.in_cooldown("example.com"));
    }

    #[tokio::test]
    async fn wait_blocks_through_cooldown_then_succeeds() {
        let governor = RateGovernor::new(fast_config());
        for _ in 0..3 {
            governor.report_failure("example.com");
        }
        assert!(governor.in_cooldown("example.com"));

        let started = Instant::now();
        governor.wait_for_slot("example.com").await;
        // The cooldown window (40ms delay * 4, capped at 60ms) must elapse.
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(!governor.in_cooldown("example.com"));

        governor.report_success("example.com");
        let snappy = Instant::now();
        governor.wait_for_slot("example.com").await;
        assert!(snappy.elapsed() < Duration::from_millis(60));
    }

    #[tokio::test]
    async fn enforces_spacing_between_calls() {
        let governor = RateGovernor::new(GovernorConfig {
            min_delay: Duration::from_millis(30),
            ..fast_config()
        });

        governor.wait_for_slot("example.com").await;
        let started = Instant::now();
        governor.wait_for_slot("example.com").await;
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn reset_drops_learned_state() {
        let governor = RateGovernor::new(fast_config());
        for _ in 0..5 {
            governor.report_failure("example.com");
        }
        governor.reset("example.com");
        assert!(!governor.in_cooldown("example.com"));
        assert_eq!(
            governor.current_delay("example.com"),
            Duration::from_millis(5)
        );
    }
}
