//! Core data types shared by every discovery component.
//!
//! A [`PeerRecord`] is what each node publishes on the registration channel:
//! its identity and addresses, the sequence number it was assigned when it
//! enrolled, and its role in the run.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;

/// Opaque node identity, derived from the node's public key material.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Wrap raw identity bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive an identity by hashing public key bytes.
    #[must_use]
    pub fn from_public_key(key: &[u8]) -> Self {
        let digest = Sha256::digest(key);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Generate a fresh identity from random key material.
    #[must_use]
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_public_key(&key)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes as hex, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", self.short())
    }
}

/// A peer's identity together with the addresses it can be dialed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Node identity
    pub id: PeerId,
    /// Dialable addresses
    pub addrs: Vec<SocketAddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }
}

/// Role a node plays in the workload that follows discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Originates messages
    Publisher,
    /// Only receives and relays
    #[default]
    Lurker,
}

impl NodeRole {
    #[must_use]
    pub fn is_publisher(self) -> bool {
        matches!(self, NodeRole::Publisher)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Publisher => write!(f, "publisher"),
            NodeRole::Lurker => write!(f, "lurker"),
        }
    }
}

/// Registration published by every node and collected by every other node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Identity and addresses
    pub info: PeerInfo,
    /// Sequence number assigned at enrollment, unique within the run
    pub seq: u64,
    /// Role of the node
    pub role: NodeRole,
}

impl PeerRecord {
    pub fn new(info: PeerInfo, seq: u64, role: NodeRole) -> Self {
        Self { info, seq, role }
    }

    #[must_use]
    pub fn id(&self) -> PeerId {
        self.info.id
    }

    #[must_use]
    pub fn is_publisher(&self) -> bool {
        self.role.is_publisher()
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq={} role={}", self.info.id.short(), self.seq, self.role)
    }
}
