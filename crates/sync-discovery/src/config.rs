//! Run configuration.
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```yaml
//! expected_nodes: 50
//! topology:
//!   kind: random_honest
//!   count: 4
//!   publishers_only: true
//! publishers:
//!   kind: sequences
//!   sequences: [1, 2]
//! retry:
//!   max_attempts: 10
//!   max_jitter: 10s
//!   dial_timeout: 10s
//! connect_delay: 2s
//! run_timeout: 10m
//! ```

use crate::barrier::READY_STATE;
use crate::coordinator::RetryPolicy;
use crate::error::{DiscoveryError, Result};
use crate::registry::{DEFAULT_PROGRESS_EVERY, RegistryOptions};
use crate::topology::TopologyPolicy;
use crate::types::NodeRole;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Decides which nodes publish, by sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PublisherPolicy {
    All,
    None,
    Sequences { sequences: Vec<u64> },
}

impl Default for PublisherPolicy {
    fn default() -> Self {
        PublisherPolicy::Sequences {
            sequences: vec![1],
        }
    }
}

impl PublisherPolicy {
    #[must_use]
    pub fn role_for(&self, seq: u64) -> NodeRole {
        let publishes = match self {
            PublisherPolicy::All => true,
            PublisherPolicy::None => false,
            PublisherPolicy::Sequences { sequences } => sequences.contains(&seq),
        };
        if publishes {
            NodeRole::Publisher
        } else {
            NodeRole::Lurker
        }
    }
}

/// Configuration for one discovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Participants in the run, local node included
    pub expected_nodes: usize,
    pub topology: TopologyPolicy,
    pub publishers: PublisherPolicy,
    pub retry: RetryPolicy,
    /// Pause between discovery and dialing
    #[serde(with = "humantime_serde")]
    pub connect_delay: Duration,
    /// Give up collecting registrations after this long
    #[serde(with = "humantime_serde")]
    pub collect_timeout: Option<Duration>,
    /// Deadline for the whole run of one node
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    /// Report a collection milestone every this many arrivals
    pub progress_every: usize,
    /// Barrier state entered once connected
    pub ready_state: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            expected_nodes: 1,
            topology: TopologyPolicy::default(),
            publishers: PublisherPolicy::default(),
            retry: RetryPolicy::default(),
            connect_delay: Duration::ZERO,
            collect_timeout: None,
            run_timeout: Duration::from_secs(600),
            progress_every: DEFAULT_PROGRESS_EVERY,
            ready_state: READY_STATE.to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| DiscoveryError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DiscoveryError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| DiscoveryError::Config(e.to_string()))
    }

    /// Check value ranges and fixed topology specifiers.
    pub fn validate(&self) -> Result<()> {
        if self.expected_nodes == 0 {
            return Err(DiscoveryError::Config(
                "expected_nodes must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DiscoveryError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.dial_timeout.is_zero() {
            return Err(DiscoveryError::Config(
                "retry.dial_timeout must be non-zero".to_string(),
            ));
        }
        if self.progress_every == 0 {
            return Err(DiscoveryError::Config(
                "progress_every must be at least 1".to_string(),
            ));
        }
        if self.ready_state.is_empty() {
            return Err(DiscoveryError::Config("ready_state must not be empty".to_string()));
        }
        self.topology.build()?;
        Ok(())
    }

    #[must_use]
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            progress_every: self.progress_every,
            collect_timeout: self.collect_timeout,
            subscribe_jitter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DiscoveryConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, DiscoveryConfig::default());
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.ready_state, "ready");
        assert_eq!(config.run_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_parses_topology_and_durations() {
        let yaml = r#"
expected_nodes: 50
topology:
  kind: random_honest
  count: 4
  publishers_only: true
publishers:
  kind: sequences
  sequences: [1, 2]
retry:
  max_jitter: 250ms
  dial_timeout: 3s
connect_delay: 2s
collect_timeout: 1m
"#;
        let config = DiscoveryConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.expected_nodes, 50);
        assert_eq!(
            config.topology,
            TopologyPolicy::RandomHonest {
                count: 4,
                publishers_only: true
            }
        );
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.max_jitter, Duration::from_millis(250));
        assert_eq!(config.retry.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.connect_delay, Duration::from_secs(2));
        assert_eq!(config.collect_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.publishers.role_for(2), NodeRole::Publisher);
        assert_eq!(config.publishers.role_for(3), NodeRole::Lurker);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = DiscoveryConfig {
            expected_nodes: 7,
            topology: TopologyPolicy::Fixed {
                connections: vec!["2-lurker-0".to_string()],
            },
            publishers: PublisherPolicy::All,
            collect_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let yaml = config.to_yaml().unwrap();
        assert_eq!(DiscoveryConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_malformed_fixed_spec_rejected() {
        let yaml = r#"
topology:
  kind: fixed
  connections: ["5-x"]
"#;
        let err = DiscoveryConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.is_fatal_config());
        assert!(matches!(
            err,
            DiscoveryError::MalformedTopologySpec { fields: 2, .. }
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(DiscoveryConfig::from_yaml_str("expected_nodes: 0").is_err());
        assert!(DiscoveryConfig::from_yaml_str("retry: {max_attempts: 0}").is_err());
        assert!(DiscoveryConfig::from_yaml_str("topology: {kind: bogus}").is_err());
    }

    #[test]
    fn test_publisher_policy_roles() {
        assert_eq!(PublisherPolicy::default().role_for(1), NodeRole::Publisher);
        assert_eq!(PublisherPolicy::default().role_for(2), NodeRole::Lurker);
        assert_eq!(PublisherPolicy::All.role_for(9), NodeRole::Publisher);
        assert_eq!(PublisherPolicy::None.role_for(1), NodeRole::Lurker);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "expected_nodes: 12\ntopology: {{kind: single_publisher}}").unwrap();

        let config = DiscoveryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.expected_nodes, 12);
        assert_eq!(config.topology, TopologyPolicy::SinglePublisher);

        let missing = DiscoveryConfig::from_file("/nonexistent/discovery.yaml").unwrap_err();
        assert!(matches!(missing, DiscoveryError::Config(_)));
    }
}
