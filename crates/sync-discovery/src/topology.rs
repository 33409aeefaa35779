//! Topology strategies.
//!
//! A [`Topology`] decides which of the known peers a node connects to. Every
//! strategy is a pure function of its inputs: no network I/O and no hidden
//! state beyond the random number generator handed to the random variants.
//! The local node is never selected, even if the caller forgot to filter it.
//!
//! | Strategy | Selection |
//! |----------|-----------|
//! | [`RandomTopology`] | `count` peers uniformly at random |
//! | [`RandomHonestTopology`] | as above, optionally publishers only |
//! | [`SinglePublisherTopology`] | the publisher with the lowest sequence number |
//! | [`FixedTopology`] | peers named by `"<seq>-<type>-<index>"` specifiers |

use crate::error::{DiscoveryError, Result};
use crate::types::{PeerId, PeerRecord};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Peer selection policy.
pub trait Topology: Send + Sync + fmt::Debug {
    /// Select the peers to connect to out of `remote`.
    fn select_peers(&self, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord>;

    /// Select at most `n` peers. The default truncates [`Topology::select_peers`].
    fn select_n_peers(&self, n: usize, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord> {
        let mut selected = self.select_peers(local, remote);
        selected.truncate(n);
        selected
    }

    /// Whether an empty selection should abort the run.
    fn requires_peers(&self) -> bool {
        true
    }
}

fn eligible<'a>(
    local: &PeerId,
    remote: &'a [PeerRecord],
) -> impl Iterator<Item = &'a PeerRecord> + use<'a> {
    let local = *local;
    remote.iter().filter(move |p| p.id() != local)
}

fn random_subset<R: Rng + ?Sized>(
    candidates: &[&PeerRecord],
    n: usize,
    rng: &mut R,
) -> Vec<PeerRecord> {
    if candidates.is_empty() || n == 0 {
        return Vec::new();
    }
    let n = n.min(candidates.len());
    let mut indices: Vec<usize> = (0..candidates.len()).collect();
    indices.shuffle(rng);
    indices
        .into_iter()
        .take(n)
        .map(|i| candidates[i].clone())
        .collect()
}

/// Selects a subset of all peers at random.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomTopology {
    /// Number of peers to return
    pub count: usize,
}

impl RandomTopology {
    pub fn new(count: usize) -> Self {
        Self { count }
    }

    /// Select up to `n` peers using the supplied generator.
    pub fn select_with_rng<R: Rng + ?Sized>(
        n: usize,
        local: &PeerId,
        remote: &[PeerRecord],
        rng: &mut R,
    ) -> Vec<PeerRecord> {
        let candidates: Vec<&PeerRecord> = eligible(local, remote).collect();
        random_subset(&candidates, n, rng)
    }
}

impl Topology for RandomTopology {
    fn select_peers(&self, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord> {
        Self::select_with_rng(self.count, local, remote, &mut rand::thread_rng())
    }

    fn select_n_peers(&self, n: usize, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord> {
        Self::select_with_rng(n, local, remote, &mut rand::thread_rng())
    }
}

/// Random subset of honest nodes, optionally restricted to publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomHonestTopology {
    /// Number of peers to return
    pub count: usize,
    /// Only connect to publishers
    pub publishers_only: bool,
}

impl RandomHonestTopology {
    pub fn new(count: usize, publishers_only: bool) -> Self {
        Self {
            count,
            publishers_only,
        }
    }

    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        n: usize,
        local: &PeerId,
        remote: &[PeerRecord],
        rng: &mut R,
    ) -> Vec<PeerRecord> {
        let filtered: Vec<&PeerRecord> = eligible(local, remote)
            .filter(|p| !self.publishers_only || p.is_publisher())
            .collect();
        random_subset(&filtered, n, rng)
    }
}

impl Topology for RandomHonestTopology {
    fn select_peers(&self, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord> {
        self.select_with_rng(self.count, local, remote, &mut rand::thread_rng())
    }

    fn select_n_peers(&self, n: usize, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord> {
        self.select_with_rng(n, local, remote, &mut rand::thread_rng())
    }
}

/// Connects only to the first publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinglePublisherTopology;

/// Publisher with the lowest sequence number; on ties the first one wins.
pub fn select_single_publisher<'a>(
    local: &PeerId,
    peers: &'a [PeerRecord],
) -> Option<&'a PeerRecord> {
    let mut lowest: Option<&PeerRecord> = None;
    for p in eligible(local, peers).filter(|p| p.is_publisher()) {
        if lowest.is_none_or(|l| p.seq < l.seq) {
            lowest = Some(p);
        }
    }
    lowest
}

impl Topology for SinglePublisherTopology {
    fn select_peers(&self, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord> {
        select_single_publisher(local, remote)
            .cloned()
            .into_iter()
            .collect()
    }
}

/// One entry of a fixed topology definition: `"<seq>-<node type>-<node index>"`.
///
/// Only the sequence field takes part in matching. The other two fields are
/// validated structurally and kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub seq: String,
    pub node_type: String,
    pub node_index: String,
}

impl ConnectionSpec {
    fn matches(&self, peer: &PeerRecord) -> bool {
        self.seq == peer.seq.to_string()
    }
}

impl FromStr for ConnectionSpec {
    type Err = DiscoveryError;

    fn from_str(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split('-').collect();
        match parts.as_slice() {
            [seq, node_type, node_index] => Ok(Self {
                seq: (*seq).to_string(),
                node_type: (*node_type).to_string(),
                node_index: (*node_index).to_string(),
            }),
            _ => Err(DiscoveryError::MalformedTopologySpec {
                spec: spec.to_string(),
                fields: parts.len(),
            }),
        }
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.seq, self.node_type, self.node_index)
    }
}

/// Topology given explicitly as a list of connection specifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedTopology {
    connections: Vec<ConnectionSpec>,
}

impl FixedTopology {
    /// Parse every specifier up front. A single malformed entry rejects the
    /// whole definition.
    pub fn new<I, S>(connections: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let connections = connections
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { connections })
    }

    #[must_use]
    pub fn connections(&self) -> &[ConnectionSpec] {
        &self.connections
    }
}

impl Topology for FixedTopology {
    fn select_peers(&self, local: &PeerId, remote: &[PeerRecord]) -> Vec<PeerRecord> {
        let mut out = Vec::with_capacity(self.connections.len());
        for spec in &self.connections {
            out.extend(eligible(local, remote).filter(|p| spec.matches(p)).cloned());
        }
        out
    }
}

/// Serializable choice of topology strategy for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyPolicy {
    Random {
        count: usize,
    },
    RandomHonest {
        count: usize,
        #[serde(default)]
        publishers_only: bool,
    },
    SinglePublisher,
    Fixed {
        connections: Vec<String>,
    },
}

impl Default for TopologyPolicy {
    fn default() -> Self {
        TopologyPolicy::Random { count: 2 }
    }
}

impl TopologyPolicy {
    /// Build the strategy, validating fixed specifiers.
    pub fn build(&self) -> Result<Arc<dyn Topology>> {
        let topology: Arc<dyn Topology> = match self {
            TopologyPolicy::Random { count } => Arc::new(RandomTopology::new(*count)),
            TopologyPolicy::RandomHonest {
                count,
                publishers_only,
            } => Arc::new(RandomHonestTopology::new(*count, *publishers_only)),
            TopologyPolicy::SinglePublisher => Arc::new(SinglePublisherTopology),
            TopologyPolicy::Fixed { connections } => Arc::new(FixedTopology::new(connections)?),
        };
        Ok(topology)
    }
}
