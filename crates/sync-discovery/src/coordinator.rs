//! Connection coordinator.
//!
//! Dials the peers picked by a topology, at most once per peer, with
//! jittered retries. The important detail is what happens between attempts:
//! a transport remembers recent dial failures and refuses to dial the same
//! peer again for a while. Retrying without clearing that entry would just
//! replay the cached failure, so after every failed attempt the coordinator
//! asks the transport to clear its backoff for the peer.
//!
//! ```text
//!   connect_topology(selected)
//!     ├─ peer already in connected set? ── skip
//!     └─ record peer, spawn ──► connect_with_retry(peer)
//!                                 loop attempt = 1..=max_attempts
//!                                   sleep(jitter)
//!                                   dial(peer, dial_timeout)
//!                                   ok  ─► done
//!                                   err ─► clear_dial_backoff(peer), retry
//! ```

use crate::error::{DiscoveryError, Result, Stage, TransportError};
use crate::observer::{SharedObserver, default_observer};
use crate::transport::Transport;
use crate::types::{PeerId, PeerInfo, PeerRecord};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Default per-peer attempt limit.
pub const MAX_CONNECT_RETRIES: u32 = 10;

/// Default per-attempt dial timeout.
pub const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound of the random delay before each attempt.
pub const MAX_CONNECT_JITTER: Duration = Duration::from_secs(10);

/// Retry behaviour for a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before giving up on a peer
    pub max_attempts: u32,
    /// Upper bound of the random delay before each attempt
    #[serde(with = "humantime_serde")]
    pub max_jitter: Duration,
    /// Time allowed for one dial
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_RETRIES,
            max_jitter: MAX_CONNECT_JITTER,
            dial_timeout: PEER_CONNECT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Random delay in `[0, max_jitter)`.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

#[derive(Clone)]
struct Dialer {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    observer: SharedObserver,
    local_seq: u64,
}

impl Dialer {
    async fn connect_peer(&self, peer: PeerRecord, cancel: CancellationToken) -> Result<()> {
        let result = self.connect_with_retry(&peer.info, &cancel).await;
        if let Err(err) = &result {
            self.observer
                .record_message(&format!("error connecting to peer {}: {}", peer.seq, err));
        }
        for conn in self.transport.active_connections(&peer.id()) {
            self.observer.record_message(&format!(
                "{} connected to {}. local addr: {} remote addr: {}",
                self.local_seq, peer.seq, conn.local_addr, conn.remote_addr
            ));
        }
        result
    }

    async fn connect_with_retry(&self, peer: &PeerInfo, cancel: &CancellationToken) -> Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;

            // Spread simultaneous dials across the fleet.
            let delay = self.retry.jitter();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Dial)),
                _ = tokio::time::sleep(delay) => {}
            }

            let dial = tokio::time::timeout(
                self.retry.dial_timeout,
                self.transport.dial(peer, self.retry.dial_timeout),
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Dial)),
                dialed = dial => dialed.unwrap_or(Err(TransportError::Timeout(peer.id))),
            };

            let err = match outcome {
                Ok(()) => {
                    debug!("connected to {} on attempt {}", peer.id.short(), attempt);
                    return Ok(());
                }
                Err(err) => err,
            };

            if attempt >= max_attempts {
                error!(
                    "giving up on {} after {} attempts: {}",
                    peer.id.short(),
                    attempt,
                    err
                );
                return Err(DiscoveryError::ConnectFailed {
                    peer: peer.id,
                    attempts: attempt,
                    source: err,
                });
            }

            warn!(
                "connection attempt #{} to {} failed: {}",
                attempt,
                peer.id.short(),
                err
            );
            self.observer.record_message(&format!(
                "connection attempt #{} to {} failed: {}",
                attempt,
                peer.id.short(),
                err
            ));
            self.observer.record_message(&format!(
                "clearing dial backoff for peer {}",
                peer.id.short()
            ));
            self.transport.clear_dial_backoff(&peer.id);
        }
    }
}

/// Dials selected peers and tracks which ones have been dispatched.
pub struct ConnectionCoordinator {
    dialer: Dialer,
    connected: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl ConnectionCoordinator {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            dialer: Dialer {
                transport,
                retry,
                observer: default_observer(),
                local_seq: 0,
            },
            connected: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.dialer.observer = observer;
        self
    }

    /// Sequence number of the local node, used in progress messages.
    pub fn with_local_seq(mut self, seq: u64) -> Self {
        self.dialer.local_seq = seq;
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.dialer.retry
    }

    /// Dial every selected peer not yet dispatched and wait for all attempts.
    ///
    /// Peers are recorded as connected when their attempt is dispatched, so
    /// overlapping calls never dial the same peer twice. The first exhausted
    /// peer cancels its siblings; once every attempt has finished its error
    /// is returned.
    pub async fn connect_topology(
        &self,
        selected: &[PeerRecord],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let group = cancel.child_token();
        let mut attempts = JoinSet::new();
        {
            let mut connected = self.connected.write();
            for peer in selected {
                let Entry::Vacant(slot) = connected.entry(peer.id()) else {
                    continue;
                };
                slot.insert(peer.clone());
                debug!("{} connecting to {}", self.dialer.local_seq, peer.seq);

                let dialer = self.dialer.clone();
                let peer = peer.clone();
                let token = group.clone();
                attempts.spawn(async move { dialer.connect_peer(peer, token).await });
            }
        }

        let mut first_error = None;
        while let Some(joined) = attempts.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(DiscoveryError::cancelled(Stage::Dial)),
            };
            if let Err(err) = outcome {
                if first_error.is_none() {
                    group.cancel();
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Dial one peer with retries, independent of the connected set.
    pub async fn connect_with_retry(&self, peer: &PeerInfo, cancel: &CancellationToken) -> Result<()> {
        self.dialer.connect_with_retry(peer, cancel).await
    }

    /// Point-in-time copy of the connected set.
    #[must_use]
    pub fn connected(&self) -> Vec<PeerRecord> {
        self.connected.read().values().cloned().collect()
    }

    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.read().contains_key(peer)
    }
}
