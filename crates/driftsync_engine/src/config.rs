//! Configuration for the sync engine.

use driftsync_model::ResolutionStrategy;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this device, stamped onto enqueued changes.
    pub device_id: Uuid,
    /// Entity families a full sync covers.
    pub entity_types: Vec<String>,
    /// Maximum number of items per transfer chunk.
    pub batch_size: usize,
    /// Hard ceiling on `batch_size`.
    pub max_batch_size: usize,
    /// Failed attempts a queue entry may accumulate before dead-lettering.
    pub attempt_ceiling: u32,
    /// Strategy applied to auto-resolvable conflicts.
    pub default_strategy: ResolutionStrategy,
    /// Retry configuration for remote calls.
    pub retry: RetryConfig,
    /// Connection timeout for remote calls.
    pub connect_timeout: Duration,
    /// Read timeout for remote calls.
    pub read_timeout: Duration,
    /// How long confirmed-deleted tombstones are retained before pruning.
    pub tombstone_retention: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the given device.
    pub fn new(device_id: Uuid) -> Self {
        Self {
            device_id,
            entity_types: Vec::new(),
            batch_size: 50,
            max_batch_size: 100,
            attempt_ceiling: 5,
            default_strategy: ResolutionStrategy::KeepLocal,
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(20),
            tombstone_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    /// Sets the entity families a full sync covers.
    pub fn with_entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the hard ceiling on batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the dead-letter attempt ceiling.
    pub fn with_attempt_ceiling(mut self, ceiling: u32) -> Self {
        self.attempt_ceiling = ceiling;
        self
    }

    /// Sets the default conflict resolution strategy.
    pub fn with_default_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the tombstone retention window.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// The batch size actually used, clamped to the hard ceiling.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.min(self.max_batch_size).max(1)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied to the exponential delay before jitter.
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter, as a fraction of the capped delay.
    pub jitter_factor: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the given retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }

    /// Creates a configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
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

    /// Sets the jitter fraction.
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// The capped exponential delay for a zero-based attempt, before jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(exponential.min(self.max_delay.as_secs_f64()))
    }

    /// The delay for a zero-based attempt, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt).as_secs_f64();
        let jitter = capped * self.jitter_factor * rand::random::<f64>();
        Duration::from_secs_f64(capped + jitter)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let device = Uuid::new_v4();
        let config = SyncConfig::new(device)
            .with_entity_types(["note", "tag"])
            .with_batch_size(25)
            .with_attempt_ceiling(2);

        assert_eq!(config.device_id, device);
        assert_eq!(config.entity_types, vec!["note", "tag"]);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.attempt_ceiling, 2);
    }

    #[test]
    fn effective_batch_size_is_clamped() {
        let config = SyncConfig::default()
            .with_batch_size(500)
            .with_max_batch_size(100);
        assert_eq!(config.effective_batch_size(), 100);

        let config = SyncConfig::default().with_batch_size(0);
        assert_eq!(config.effective_batch_size(), 1);
    }

    #[test]
    fn delay_grows_monotonically_up_to_cap() {
        let config = RetryConfig::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5));

        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let delay = config.capped_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(5));
            previous = delay;
        }
        // 100ms * 2^6 passes the 5s cap.
        assert_eq!(config.capped_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delay_stays_within_bound() {
        let config = RetryConfig::new(5)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter_factor(0.1);

        for attempt in 0..8 {
            let capped = config.capped_delay(attempt);
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= capped);
            assert!(delay.as_secs_f64() <= capped.as_secs_f64() * 1.1 + 1e-9);
        }
    }

    #[test]
    fn no_retry_config() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
    }
}
