//! Configuration management for admission limiters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::ratelimit::{AdaptiveLimiter, LeakyBucket, Limiter, SlidingWindow, TokenBucket};

/// Main configuration for an embedding application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Named limiter definitions
    #[serde(default)]
    pub limiters: HashMap<String, LimiterSpec>,

    /// Distributed coordinator configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

/// One limiter definition, tagged by algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterSpec {
    /// Burst-friendly token bucket
    TokenBucket { capacity: u64, refill_rate: u64 },
    /// Smoothing leaky bucket
    LeakyBucket { capacity: u64, leak_rate: u64 },
    /// Exact log over a trailing window
    SlidingWindow { window_ms: u64, limit: u64 },
    /// Token bucket tuned from error rates
    Adaptive {
        initial_rate: u64,
        min_rate: u64,
        max_rate: u64,
        #[serde(default = "default_adjust_interval")]
        adjust_interval_secs: u64,
    },
}

impl LimiterSpec {
    /// Build the limiter this definition describes.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Arc<dyn Limiter> {
        match *self {
            LimiterSpec::TokenBucket {
                capacity,
                refill_rate,
            } => Arc::new(TokenBucket::with_clock(capacity, refill_rate, clock)),
            LimiterSpec::LeakyBucket {
                capacity,
                leak_rate,
            } => Arc::new(LeakyBucket::with_clock(capacity, leak_rate, clock)),
            LimiterSpec::SlidingWindow { window_ms, limit } => Arc::new(
                SlidingWindow::with_clock(Duration::from_millis(window_ms), limit, clock),
            ),
            LimiterSpec::Adaptive {
                initial_rate,
                min_rate,
                max_rate,
                adjust_interval_secs,
            } => Arc::new(AdaptiveLimiter::with_clock(
                initial_rate,
                min_rate,
                max_rate,
                Duration::from_secs(adjust_interval_secs),
                clock,
            )),
        }
    }
}

fn default_adjust_interval() -> u64 {
    10
}

/// Distributed coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Cluster-wide rate, in requests per second
    #[serde(default = "default_total_rate")]
    pub total_rate: u64,

    /// Expected number of nodes before any peer has reported
    #[serde(default = "default_node_count")]
    pub node_count: u64,

    /// Capacity of the inbound status queue
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// How often queued peer statuses are applied, in milliseconds
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,

    /// How often this node publishes its own status, in milliseconds
    #[serde(default = "default_publish_interval")]
    pub publish_interval_ms: u64,

    /// Forget peers silent for this long, in milliseconds
    #[serde(default)]
    pub peer_ttl_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            total_rate: default_total_rate(),
            node_count: default_node_count(),
            inbox_capacity: default_inbox_capacity(),
            drain_interval_ms: default_drain_interval(),
            publish_interval_ms: default_publish_interval(),
            peer_ttl_ms: None,
        }
    }
}

impl CoordinatorConfig {
    /// Config for `node_id` with the given rate and expected node count.
    pub fn new(node_id: impl Into<String>, total_rate: u64, node_count: u64) -> Self {
        Self {
            node_id: node_id.into(),
            total_rate,
            node_count,
            ..Self::default()
        }
    }

    /// Get the drain interval.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    /// Get the publish interval.
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms.max(1))
    }

    /// Get the peer expiry, if enabled.
    pub fn peer_ttl(&self) -> Option<Duration> {
        self.peer_ttl_ms.map(Duration::from_millis)
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_total_rate() -> u64 {
    1000
}

fn default_node_count() -> u64 {
    1
}

fn default_inbox_capacity() -> usize {
    100
}

fn default_drain_interval() -> u64 {
    100
}

fn default_publish_interval() -> u64 {
    1000
}

impl AdmissionConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse admission config: {}", e)))
    }

    /// Build every named limiter against `clock`.
    pub fn build_limiters(&self, clock: Arc<dyn Clock>) -> HashMap<String, Arc<dyn Limiter>> {
        self.limiters
            .iter()
            .map(|(name, spec)| (name.clone(), spec.build(clock.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
limiters:
  api:
    algorithm: token_bucket
    capacity: 10
    refill_rate: 2
  uploads:
    algorithm: leaky_bucket
    capacity: 5
    leak_rate: 1
  login:
    algorithm: sliding_window
    window_ms: 1000
    limit: 3
  backend:
    algorithm: adaptive
    initial_rate: 100
    min_rate: 10
    max_rate: 500
coordinator:
  node_id: node-a
  total_rate: 300
  node_count: 3
  peer_ttl_ms: 5000
"#;
        let config = AdmissionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiters.len(), 4);
        assert_eq!(
            config.limiters["api"],
            LimiterSpec::TokenBucket {
                capacity: 10,
                refill_rate: 2
            }
        );
        assert_eq!(
            config.limiters["backend"],
            LimiterSpec::Adaptive {
                initial_rate: 100,
                min_rate: 10,
                max_rate: 500,
                adjust_interval_secs: 10,
            }
        );
        assert_eq!(config.coordinator.node_id, "node-a");
        assert_eq!(config.coordinator.total_rate, 300);
        assert_eq!(config.coordinator.inbox_capacity, 100);
        assert_eq!(config.coordinator.peer_ttl(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_defaults() {
        let config = AdmissionConfig::from_yaml("{}").unwrap();
        assert!(config.limiters.is_empty());
        assert_eq!(config.coordinator.node_count, 1);
        assert_eq!(config.coordinator.drain_interval(), Duration::from_millis(100));
        assert_eq!(config.coordinator.publish_interval(), Duration::from_secs(1));
        assert!(config.coordinator.peer_ttl().is_none());
        assert!(uuid::Uuid::parse_str(&config.coordinator.node_id).is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let yaml = r#"
limiters:
  api:
    algorithm: fixed_window
    limit: 3
"#;
        let err = AdmissionConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, AdmissionError::Config(_)));
    }

    #[test]
    fn test_build_limiters() {
        let yaml = r#"
limiters:
  api:
    algorithm: token_bucket
    capacity: 2
    refill_rate: 1
  login:
    algorithm: sliding_window
    window_ms: 1000
    limit: 1
"#;
        let config = AdmissionConfig::from_yaml(yaml).unwrap();
        let limiters = config.build_limiters(Arc::new(MockClock::default()));

        let api = &limiters["api"];
        assert!(api.allow());
        assert!(api.allow());
        assert!(!api.allow());

        let login = &limiters["login"];
        assert!(login.allow());
        assert!(!login.allow());
    }

    #[test]
    fn test_missing_file() {
        let err = AdmissionConfig::from_file("/nonexistent/admitter.yaml").unwrap_err();
        assert!(matches!(err, AdmissionError::Io(_)));
    }
}
