//! Per-node discovery façade.
//!
//! [`SyncDiscovery`] binds the local identity to a [`PeerRegistry`], a
//! [`Topology`] and a [`ConnectionCoordinator`]:
//!
//! ```text
//!   register_and_wait ──► registry.register ──► registry.collect(N) ──► all_peers (self removed)
//!   connect_topology  ──► sleep(delay) ──► topology.select_peers(all_peers) ──► coordinator
//! ```

use crate::coordinator::{ConnectionCoordinator, RetryPolicy};
use crate::error::{DiscoveryError, Result, Stage};
use crate::observer::{SharedObserver, default_observer};
use crate::registry::PeerRegistry;
use crate::topology::Topology;
use crate::transport::Transport;
use crate::types::{NodeRole, PeerRecord};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run-level inputs of a [`SyncDiscovery`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Number of participants, local node included
    pub expected_nodes: usize,
    /// Retry behaviour for each selected peer
    pub retry: RetryPolicy,
}

pub struct SyncDiscovery {
    local: PeerRecord,
    expected_nodes: usize,
    registry: Arc<PeerRegistry>,
    topology: Arc<dyn Topology>,
    coordinator: ConnectionCoordinator,
    all_peers: RwLock<Vec<PeerRecord>>,
    observer: SharedObserver,
}

impl SyncDiscovery {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<PeerRegistry>,
        topology: Arc<dyn Topology>,
        seq: u64,
        role: NodeRole,
        options: DiscoveryOptions,
    ) -> Self {
        let local = PeerRecord::new(transport.local_peer(), seq, role);
        let coordinator = ConnectionCoordinator::new(transport, options.retry).with_local_seq(seq);
        Self {
            local,
            expected_nodes: options.expected_nodes,
            registry,
            topology,
            coordinator,
            all_peers: RwLock::new(Vec::new()),
            observer: default_observer(),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.coordinator = self.coordinator.with_observer(observer.clone());
        self.observer = observer;
        self
    }

    /// Record this node publishes on the registration channel.
    #[must_use]
    pub fn local_record(&self) -> &PeerRecord {
        &self.local
    }

    /// Register the local node, wait for every participant and keep the
    /// remote records for topology selection.
    pub async fn register_and_wait(&self, cancel: &CancellationToken) -> Result<Vec<PeerRecord>> {
        self.registry.register(&self.local, cancel).await?;
        let everyone = self.registry.collect(self.expected_nodes, cancel).await?;

        let local_id = self.local.id();
        let remote: Vec<PeerRecord> = everyone
            .iter()
            .filter(|p| p.id() != local_id)
            .cloned()
            .collect();
        info!(
            "node {} discovered {} remote peers",
            self.local.seq,
            remote.len()
        );
        *self.all_peers.write() = remote.clone();
        Ok(remote)
    }

    /// Wait `delay`, then connect to the peers the topology picks.
    pub async fn connect_topology(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        if !delay.is_zero() {
            self.observer
                .record_message(&format!("delay connect to peers by {:?}", delay));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::ConnectDelay)),
            _ = tokio::time::sleep(delay) => {}
        }

        let remote = self.all_peers();
        let selected = self.topology.select_peers(&self.local.id(), &remote);
        if selected.is_empty() && self.topology.requires_peers() {
            self.observer.record_message(&format!(
                "topology {:?} selected no peers out of {}",
                self.topology,
                remote.len()
            ));
            return Err(DiscoveryError::EmptyTopologySelection {
                available: remote.len(),
            });
        }
        self.observer.record_message(&format!(
            "node {} connecting to {} peers",
            self.local.seq,
            selected.len()
        ));
        self.coordinator.connect_topology(&selected, cancel).await
    }

    /// Connect to an explicit peer list, bypassing the topology.
    pub async fn connect_to_peers(&self, peers: &[PeerRecord], cancel: &CancellationToken) -> Result<()> {
        if peers.is_empty() {
            return Err(DiscoveryError::EmptyTopologySelection { available: 0 });
        }
        self.observer.record_message(&format!(
            "node {} connecting to {} peers",
            self.local.seq,
            peers.len()
        ));
        self.coordinator.connect_topology(peers, cancel).await
    }

    /// Peers dispatched for connection so far.
    #[must_use]
    pub fn connected(&self) -> Vec<PeerRecord> {
        self.coordinator.connected()
    }

    /// Every remote peer found by [`register_and_wait`](Self::register_and_wait).
    #[must_use]
    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.all_peers.read().clone()
    }
}
