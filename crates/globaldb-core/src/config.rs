//! Replica configuration.

use std::time::Duration;

/// Configuration for a [`Replica`](crate::Replica).
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    /// Identifier used in logs and gossip envelopes.
    pub replica_id: String,
    /// Gossip topic the replica announces heads on.
    pub topic: String,
    /// How often the full head set is re-announced.
    pub rebroadcast_interval: Duration,
    /// Maximum DAG fetches in flight across all heads being learned.
    pub fetch_concurrency: usize,
    /// Attempts per block before a learn gives up on it.
    pub max_fetch_attempts: u32,
    /// First retry delay after a block was not found.
    pub retry_base_delay: Duration,
    /// Upper bound for the exponential retry delay.
    pub retry_max_delay: Duration,
    /// Maximum number of deltas walked for a single learned head.
    pub max_traversal: usize,
    /// Unmerged remote heads remembered for stats; the oldest is evicted
    /// beyond this.
    pub max_pending_heads: usize,
    /// Buffered events per subscriber.
    pub event_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            replica_id: ulid::Ulid::new().to_string(),
            topic: "globaldb".to_string(),
            rebroadcast_interval: Duration::from_secs(5),
            fetch_concurrency: 16,
            max_fetch_attempts: 5,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            max_traversal: 100_000,
            max_pending_heads: 256,
            event_capacity: 1024,
        }
    }
}

impl ReplicaConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Builder for replica configuration.
pub struct ReplicaConfigBuilder {
    config: ReplicaConfig,
}

impl ReplicaConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReplicaConfig::default(),
        }
    }

    pub fn replica_id(mut self, id: impl Into<String>) -> Self {
        self.config.replica_id = id.into();
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn rebroadcast_interval(mut self, interval: Duration) -> Self {
        self.config.rebroadcast_interval = interval;
        self
    }

    pub fn fetch_concurrency(mut self, n: usize) -> Self {
        self.config.fetch_concurrency = n.max(1);
        self
    }

    pub fn max_fetch_attempts(mut self, attempts: u32) -> Self {
        self.config.max_fetch_attempts = attempts.max(1);
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry_base_delay = base;
        self.config.retry_max_delay = max.max(base);
        self
    }

    pub fn max_traversal(mut self, limit: usize) -> Self {
        self.config.max_traversal = limit;
        self
    }

    pub fn max_pending_heads(mut self, limit: usize) -> Self {
        self.config.max_pending_heads = limit.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ReplicaConfig {
        self.config
    }
}

impl Default for ReplicaConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ReplicaConfigBuilder::new()
            .replica_id("alice")
            .topic("fruit")
            .rebroadcast_interval(Duration::from_millis(200))
            .fetch_concurrency(0)
            .max_fetch_attempts(3)
            .max_traversal(10)
            .max_pending_heads(0)
            .build();

        assert_eq!(config.replica_id, "alice");
        assert_eq!(config.topic, "fruit");
        assert_eq!(config.rebroadcast_interval, Duration::from_millis(200));
        assert_eq!(config.fetch_concurrency, 1);
        assert_eq!(config.max_fetch_attempts, 3);
        assert_eq!(config.max_traversal, 10);
        assert_eq!(config.max_pending_heads, 1);
    }

    #[test]
    fn test_default_ids_are_unique() {
        assert_ne!(
            ReplicaConfig::default().replica_id,
            ReplicaConfig::default().replica_id
        );
    }

    #[test]
    fn test_retry_delay_backoff() {
        let config = ReplicaConfigBuilder::new()
            .retry_delays(Duration::from_millis(10), Duration::from_millis(50))
            .build();

        assert_eq!(config.retry_delay(1), Duration::from_millis(10));
        assert_eq!(config.retry_delay(2), Duration::from_millis(20));
        assert_eq!(config.retry_delay(3), Duration::from_millis(40));
        assert_eq!(config.retry_delay(4), Duration::from_millis(50));
        assert_eq!(config.retry_delay(40), Duration::from_millis(50));
    }
}
