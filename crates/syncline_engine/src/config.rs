//! Configuration for the sync engine.

use std::time::Duration;
use syncline_model::{CollectionId, EntityId};

/// Configuration for an engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the connection monitor probes the remote store.
    pub probe_interval: Duration,
    /// The (collection, entity) pair used for the minimal probe read.
    pub probe_target: (CollectionId, EntityId),
    /// Debounce window applied to bursts of change notifications.
    pub debounce_window: Duration,
    /// Bounded wait for a server confirmation before assuming success.
    pub confirmation_timeout: Duration,
    /// The one retry/backoff policy, applied to queue drain replays.
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Creates a configuration with the documented defaults.
    pub fn new() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_target: (CollectionId(0), EntityId(0)),
            debounce_window: Duration::from_millis(75),
            confirmation_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the probe interval.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the probe target.
    pub fn with_probe_target(mut self, collection: CollectionId, entity: EntityId) -> Self {
        self.probe_target = (collection, entity);
        self
    }

    /// Sets the debounce window.
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Sets the confirmation timeout.
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The centralized retry/backoff policy.
///
/// Injected into the offline queue (transient replay failures) so no module
/// grows its own ad hoc retry loop. Permanent errors are never retried
/// regardless of policy. Backoff doubles from the base delay and is capped;
/// an optional jitter slice of up to a quarter of the capped delay spreads
/// simultaneous retries apart.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each attempt after.
    pub base_delay: Duration,
    /// Ceiling on the computed delay, applied before jitter.
    pub max_delay: Duration,
    /// Whether to stretch each delay by up to a quarter, randomly.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(20),
            jitter: true,
        }
    }

    /// Creates a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay to wait before a given attempt (0-indexed; the first
    /// attempt never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // Clamping the doubling count keeps the shift in range; anything
        // past it saturates at the ceiling anyway.
        let doublings = attempt.saturating_sub(1).min(20);
        let capped = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);

        if self.jitter {
            capped.saturating_add(jitter_slice(capped, attempt))
        } else {
            capped
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Up to a quarter of the capped delay, drawn from the standard library's
/// randomly seeded hasher so no RNG crate is needed.
fn jitter_slice(capped: Duration, attempt: u32) -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(attempt);
    let fraction = (hasher.finish() & 0xff) as u32;
    (capped / 4).saturating_mul(fraction) / 255
}
