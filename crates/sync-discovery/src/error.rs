//! Error types for discovery, topology selection and connection setup.

use crate::types::PeerId;
use std::fmt;
use thiserror::Error;

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Point of the run at which an operation was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Enroll,
    Register,
    Collect,
    ConnectDelay,
    Dial,
    Barrier,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Enroll => "enrollment",
            Stage::Register => "registration",
            Stage::Collect => "peer collection",
            Stage::ConnectDelay => "connect delay",
            Stage::Dial => "dial",
            Stage::Barrier => "readiness barrier",
            Stage::Run => "run",
        };
        f.write_str(name)
    }
}

/// Errors reported by the synchronization service collaborator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync service unreachable: {0}")]
    Unreachable(String),

    #[error("topic {0} is closed")]
    TopicClosed(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors reported by the transport collaborator for a single dial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("dial backoff in effect for peer {}", .0.short())]
    DialBackoff(PeerId),

    #[error("dial to peer {} timed out", .0.short())]
    Timeout(PeerId),

    #[error("peer {} is not reachable", .0.short())]
    Unreachable(PeerId),

    #[error("connection refused by peer {}: {reason}", .peer.short())]
    Refused { peer: PeerId, reason: String },

    #[error("peer {} has no addresses", .0.short())]
    NoAddresses(PeerId),
}

/// Errors surfaced by the discovery core.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to publish to topic {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: SyncError,
    },

    #[error("failed to subscribe to topic {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: SyncError,
    },

    #[error("malformed record on topic {topic}: {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("not enough peer records: expected {expected}, got {received}")]
    InsufficientPeers { expected: usize, received: usize },

    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("timed out during {stage}")]
    Timeout { stage: Stage },

    #[error("topology selected zero peers out of {available} known peers")]
    EmptyTopologySelection { available: usize },

    #[error("malformed topology specifier {spec:?}: expected 3 dash-separated fields, got {fields}")]
    MalformedTopologySpec { spec: String, fields: usize },

    #[error("failed to connect to peer {} after {attempts} attempts: {source}", .peer.short())]
    ConnectFailed {
        peer: PeerId,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("barrier {state} failed: {source}")]
    Barrier {
        state: String,
        #[source]
        source: SyncError,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// Whether the error came from the shared cancellation signal or a deadline
    /// rather than from a business failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Cancelled { .. } | DiscoveryError::Timeout { .. }
        )
    }

    /// Whether the error is a startup configuration problem.
    #[must_use]
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            DiscoveryError::MalformedTopologySpec { .. } | DiscoveryError::Config(_)
        )
    }

    pub(crate) fn cancelled(stage: Stage) -> Self {
        DiscoveryError::Cancelled { stage }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinguishable() {
        assert!(DiscoveryError::cancelled(Stage::Collect).is_cancellation());
        assert!(
            DiscoveryError::Timeout {
                stage: Stage::Run
            }
            .is_cancellation()
        );
        assert!(
            !DiscoveryError::InsufficientPeers {
                expected: 5,
                received: 3
            }
            .is_cancellation()
        );
    }

    #[test]
    fn test_connect_failed_message_names_peer() {
        let peer = PeerId::from_bytes([0x01; 32]);
        let err = DiscoveryError::ConnectFailed {
            peer,
            attempts: 10,
            source: TransportError::DialBackoff(peer),
        };
        let msg = err.to_string();
        assert!(msg.contains("01010101"));
        assert!(msg.contains("10 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_malformed_spec_is_config_error() {
        let err = DiscoveryError::MalformedTopologySpec {
            spec: "5-x".to_string(),
            fields: 2,
        };
        assert!(err.is_fatal_config());
        assert!(err.to_string().contains("got 2"));
    }
}
