//! Single-node control flow.
//!
//! ```text
//!   enroll ──► role ──► register_and_wait ──► connect_topology ──► barrier("ready")
//!     seq      policy        all peers             dial + retry        rendezvous
//! ```

use crate::barrier::ReadinessBarrier;
use crate::channel::{RegistrationChannel, enroll};
use crate::config::DiscoveryConfig;
use crate::discovery::{DiscoveryOptions, SyncDiscovery};
use crate::error::{DiscoveryError, Result, Stage};
use crate::observer::{SharedObserver, default_observer};
use crate::registry::PeerRegistry;
use crate::sync::SyncClient;
use crate::transport::Transport;
use crate::types::{NodeRole, PeerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of one node's run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub peer_id: PeerId,
    pub seq: u64,
    pub role: NodeRole,
    /// Remote peers found on the registration channel
    pub discovered: usize,
    /// Peers dialed according to the topology
    pub connected: Vec<PeerId>,
    /// Entry position at the readiness barrier
    pub barrier_position: u64,
    pub finished_at: DateTime<Utc>,
}

/// Drives one node from enrollment to the readiness barrier.
pub struct NodeRunner {
    config: DiscoveryConfig,
    sync: Arc<dyn SyncClient>,
    transport: Arc<dyn Transport>,
    observer: SharedObserver,
}

impl NodeRunner {
    pub fn new(config: DiscoveryConfig, sync: Arc<dyn SyncClient>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            sync,
            transport,
            observer: default_observer(),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run the whole flow, bounded by the configured run timeout.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<NodeReport> {
        tokio::time::timeout(self.config.run_timeout, self.run_inner(cancel))
            .await
            .map_err(|_| DiscoveryError::Timeout { stage: Stage::Run })?
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<NodeReport> {
        let topology = self.config.topology.build()?;
        let local = self.transport.local_peer();

        let seq = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Enroll)),
            seq = enroll(self.sync.as_ref(), &local) => seq?,
        };
        let role = self.config.publishers.role_for(seq);
        info!("node {} enrolled as {} ({})", local.id.short(), seq, role);

        let registry = PeerRegistry::with_options(
            RegistrationChannel::new(Arc::clone(&self.sync)),
            self.config.registry_options(),
        )
        .with_observer(self.observer.clone());
        let discovery = SyncDiscovery::new(
            Arc::clone(&self.transport),
            Arc::new(registry),
            topology,
            seq,
            role,
            DiscoveryOptions {
                expected_nodes: self.config.expected_nodes,
                retry: self.config.retry,
            },
        )
        .with_observer(self.observer.clone());

        let discovered = discovery.register_and_wait(cancel).await?;
        discovery
            .connect_topology(self.config.connect_delay, cancel)
            .await?;

        let barrier_position = ReadinessBarrier::new(Arc::clone(&self.sync))
            .with_observer(self.observer.clone())
            .enter(&self.config.ready_state, self.config.expected_nodes as u64, cancel)
            .await?;

        let connected = discovery.connected().iter().map(|p| p.id()).collect();
        Ok(NodeReport {
            peer_id: local.id,
            seq,
            role,
            discovered: discovered.len(),
            connected,
            barrier_position,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherPolicy;
    use crate::coordinator::RetryPolicy;
    use crate::memory::{MemoryNetwork, MemorySyncService};
    use crate::topology::TopologyPolicy;
    use std::time::Duration;

    fn config(expected_nodes: usize) -> DiscoveryConfig {
        DiscoveryConfig {
            expected_nodes,
            topology: TopologyPolicy::SinglePublisher,
            publishers: PublisherPolicy::All,
            retry: RetryPolicy {
                max_attempts: 3,
                max_jitter: Duration::from_millis(5),
                dial_timeout: Duration::from_secs(1),
            },
            run_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_node_times_out_waiting_for_peers() {
        let service = Arc::new(MemorySyncService::new());
        let network = MemoryNetwork::new();
        let runner = NodeRunner::new(
            DiscoveryConfig {
                run_timeout: Duration::from_millis(50),
                ..config(2)
            },
            service,
            Arc::new(network.transport()),
        );

        let err = runner.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Timeout { stage: Stage::Run }));
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_two_publishers_connect_to_each_other() {
        let service = Arc::new(MemorySyncService::new());
        let network = MemoryNetwork::new();
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let runner = NodeRunner::new(config(2), service.clone(), Arc::new(network.transport()));
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { runner.run(&cancel).await }));
        }

        let mut reports = Vec::new();
        for task in tasks {
            reports.push(task.await.unwrap().unwrap());
        }
        reports.sort_by_key(|r| r.seq);

        assert_eq!(reports[0].seq, 1);
        assert_eq!(reports[1].seq, 2);
        assert_eq!(reports[0].connected, vec![reports[1].peer_id]);
        assert_eq!(reports[1].connected, vec![reports[0].peer_id]);
        for report in &reports {
            assert_eq!(report.role, NodeRole::Publisher);
            assert_eq!(report.discovered, 1);
        }
        let mut positions: Vec<_> = reports.iter().map(|r| r.barrier_position).collect();
        positions.sort();
        assert_eq!(positions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_before_enrollment() {
        let service = Arc::new(MemorySyncService::new());
        let network = MemoryNetwork::new();
        let runner = NodeRunner::new(config(1), service, Arc::new(network.transport()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner.run(&cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Cancelled {
                stage: Stage::Enroll
            }
        ));
    }
}
