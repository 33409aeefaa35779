//! In-process network of transports.
//!
//! ```text
//!   MemoryTransport (node A) ──dial──► MemoryNetwork ──► listener table
//!          │                               │
//!          └── dial-backoff cache          └── injected faults / fail rate
//! ```
//!
//! A failed dial puts the target into the dialer's backoff cache. While the
//! entry is live, further dials fail with [`TransportError::DialBackoff`]
//! without touching the network, just like a real swarm does. Only
//! [`Transport::clear_dial_backoff`] lets a retry through early.

use crate::error::TransportError;
use crate::transport::{ConnectionInfo, Transport};
use crate::types::{PeerId, PeerInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time a failed peer stays in a transport's backoff cache.
pub const DEFAULT_BACKOFF_PERIOD: Duration = Duration::from_secs(5);

const FIRST_PORT: u16 = 20_000;

/// Shared fabric connecting every [`MemoryTransport`] of a run.
pub struct MemoryNetwork {
    listeners: DashMap<PeerId, PeerInfo>,
    connections: DashMap<PeerId, HashMap<PeerId, ConnectionInfo>>,
    injected_failures: DashMap<PeerId, u32>,
    fail_rate: RwLock<f64>,
    next_port: AtomicU16,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            listeners: DashMap::new(),
            connections: DashMap::new(),
            injected_failures: DashMap::new(),
            fail_rate: RwLock::new(0.0),
            next_port: AtomicU16::new(FIRST_PORT),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport with a fresh identity listening on a loopback port.
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        self.transport_with_backoff(DEFAULT_BACKOFF_PERIOD)
    }

    /// Create a transport whose failed dials stay in backoff for `backoff_period`.
    pub fn transport_with_backoff(self: &Arc<Self>, backoff_period: Duration) -> MemoryTransport {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let local = PeerInfo::new(
            PeerId::random(),
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)],
        );
        self.listeners.insert(local.id, local.clone());
        MemoryTransport {
            network: Arc::clone(self),
            local,
            backoff: DashMap::new(),
            backoff_period,
            dials: AtomicU64::new(0),
            backoff_clears: AtomicU64::new(0),
        }
    }

    /// Make the next `count` dials towards `target` fail.
    pub fn fail_next_dials(&self, target: PeerId, count: u32) {
        *self.injected_failures.entry(target).or_insert(0) += count;
    }

    /// Probability in `[0, 1]` that any dial reaching the network fails.
    pub fn set_fail_rate(&self, rate: f64) {
        *self.fail_rate.write() = rate.clamp(0.0, 1.0);
    }

    /// Stop accepting dials for `peer`.
    pub fn remove_listener(&self, peer: &PeerId) {
        self.listeners.remove(peer);
    }

    fn connect(&self, from: &PeerInfo, to: &PeerInfo) -> Result<(), TransportError> {
        let Some(remote) = self.listeners.get(&to.id).map(|l| l.value().clone()) else {
            return Err(TransportError::Unreachable(to.id));
        };
        let Some(&remote_addr) = to.addrs.iter().find(|a| remote.addrs.contains(a)) else {
            return Err(TransportError::NoAddresses(to.id));
        };

        if let Some(mut remaining) = self.injected_failures.get_mut(&to.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Refused {
                    peer: to.id,
                    reason: "injected failure".to_string(),
                });
            }
        }

        let rate = *self.fail_rate.read();
        if rate > 0.0 && rand::thread_rng().gen_bool(rate) {
            return Err(TransportError::Refused {
                peer: to.id,
                reason: "simulated network loss".to_string(),
            });
        }

        let local_addr = from.addrs.first().copied().unwrap_or(remote_addr);
        self.connections.entry(from.id).or_default().insert(
            to.id,
            ConnectionInfo {
                peer: to.id,
                local_addr,
                remote_addr,
            },
        );
        self.connections.entry(to.id).or_default().insert(
            from.id,
            ConnectionInfo {
                peer: from.id,
                local_addr: remote_addr,
                remote_addr: local_addr,
            },
        );
        Ok(())
    }

    fn connections_between(&self, owner: &PeerId, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.connections
            .get(owner)
            .and_then(|conns| conns.get(peer).cloned())
            .into_iter()
            .collect()
    }
}

/// Transport endpoint of one node on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: PeerInfo,
    backoff: DashMap<PeerId, Instant>,
    backoff_period: Duration,
    dials: AtomicU64,
    backoff_clears: AtomicU64,
}

impl MemoryTransport {
    /// Number of dials that reached the network layer.
    #[must_use]
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Number of times the backoff cache was cleared for some peer.
    #[must_use]
    pub fn backoff_clear_count(&self) -> u64 {
        self.backoff_clears.load(Ordering::Relaxed)
    }

    /// Whether `peer` is currently in the backoff cache.
    #[must_use]
    pub fn in_backoff(&self, peer: &PeerId) -> bool {
        self.backoff
            .get(peer)
            .is_some_and(|until| *until > Instant::now())
    }

    /// Every peer this transport holds a connection to.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.network
            .connections
            .get(&self.local.id)
            .map(|conns| conns.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerInfo {
        self.local.clone()
    }

    async fn dial(&self, peer: &PeerInfo, _timeout: Duration) -> Result<(), TransportError> {
        if !self.active_connections(&peer.id).is_empty() {
            return Ok(());
        }
        if self.in_backoff(&peer.id) {
            return Err(TransportError::DialBackoff(peer.id));
        }
        if peer.addrs.is_empty() {
            return Err(TransportError::NoAddresses(peer.id));
        }

        self.dials.fetch_add(1, Ordering::Relaxed);
        match self.network.connect(&self.local, peer) {
            Ok(()) => {
                self.backoff.remove(&peer.id);
                Ok(())
            }
            Err(err) => {
                debug!(peer = %peer.id.short(), error = %err, "dial failed, entering backoff");
                self.backoff
                    .insert(peer.id, Instant::now() + self.backoff_period);
                Err(err)
            }
        }
    }

    fn active_connections(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.network.connections_between(&self.local.id, peer)
    }

    fn clear_dial_backoff(&self, peer: &PeerId) {
        self.backoff.remove(peer);
        self.backoff_clears.fetch_add(1, Ordering::Relaxed);
    }
}
