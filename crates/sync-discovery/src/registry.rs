//! Peer registry.
//!
//! The registry is a fan-in barrier over the registration channel: the local
//! node publishes its own [`PeerRecord`] once, then counts distinct records
//! until every expected participant has shown up.
//!
//! ```text
//!   register(record) ──publish──► [pubsub-test-peers] ──subscribe──► collect(N)
//!                                                                      │
//!                                         cached Arc<Vec<PeerRecord>> ◄┘
//! ```
//!
//! Only one collection pass ever completes per registry. Concurrent callers
//! of [`PeerRegistry::collect`] wait for the pass in flight and share its
//! result. A pass that fails (cancellation, timeout, closed channel) leaves
//! nothing cached, so a later call starts over.

use crate::channel::RegistrationChannel;
use crate::error::{DiscoveryError, Result, Stage};
use crate::observer::{SharedObserver, default_observer};
use crate::types::PeerRecord;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default interval between progress milestones during collection.
pub const DEFAULT_PROGRESS_EVERY: usize = 500;

/// Tuning for a [`PeerRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Report a milestone every this many arrivals.
    pub progress_every: usize,
    /// Give up collecting after this long.
    pub collect_timeout: Option<Duration>,
    /// Sleep a random `0..expected` milliseconds before subscribing.
    pub subscribe_jitter: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            progress_every: DEFAULT_PROGRESS_EVERY,
            collect_timeout: None,
            subscribe_jitter: true,
        }
    }
}

/// Publishes the local registration and collects everyone else's.
pub struct PeerRegistry {
    channel: RegistrationChannel,
    options: RegistryOptions,
    observer: SharedObserver,
    registered: OnceCell<u64>,
    collected: OnceCell<Arc<Vec<PeerRecord>>>,
    peers: Mutex<Vec<PeerRecord>>,
    subscriptions: AtomicUsize,
}

impl PeerRegistry {
    pub fn new(channel: RegistrationChannel) -> Self {
        Self::with_options(channel, RegistryOptions::default())
    }

    pub fn with_options(channel: RegistrationChannel, options: RegistryOptions) -> Self {
        Self {
            channel,
            options,
            observer: default_observer(),
            registered: OnceCell::new(),
            collected: OnceCell::new(),
            peers: Mutex::new(Vec::new()),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Publish the local record. Later calls return the first publish's
    /// sequence number without publishing again.
    pub async fn register(&self, record: &PeerRecord, cancel: &CancellationToken) -> Result<u64> {
        let publish_once = self.registered.get_or_try_init(|| async {
            info!("registering peer {}", record);
            self.channel.publish(record).await.inspect_err(|e| {
                self.observer
                    .record_message(&format!("registering peer not publishing: {}", e));
            })
        });
        // Callers waiting on another caller's publish still honour their own token.
        let seq = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Register)),
            seq = publish_once => seq?,
        };
        Ok(*seq)
    }

    /// Wait until `expected` distinct records have arrived, local one included.
    ///
    /// The first successful pass is cached; subsequent calls return it
    /// regardless of `expected`.
    pub async fn collect(
        &self,
        expected: usize,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<PeerRecord>>> {
        let pass = self
            .collected
            .get_or_try_init(|| self.collect_once(expected, cancel));
        let peers = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Collect)),
            peers = pass => peers?,
        };
        Ok(Arc::clone(peers))
    }

    /// Records received so far, possibly partial.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.lock().clone()
    }

    /// Number of subscriptions this registry has opened.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    async fn collect_once(
        &self,
        expected: usize,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<PeerRecord>>> {
        let pass = self.receive_all(expected, cancel);
        match self.options.collect_timeout {
            Some(limit) => tokio::time::timeout(limit, pass)
                .await
                .map_err(|_| DiscoveryError::Timeout {
                    stage: Stage::Collect,
                })?,
            None => pass.await,
        }
    }

    async fn receive_all(
        &self,
        expected: usize,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<PeerRecord>>> {
        self.peers.lock().clear();

        if self.options.subscribe_jitter && expected > 0 {
            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..expected as u64));
            if delay > Duration::from_secs(1) {
                self.observer
                    .record_message(&format!("waiting for {:?} before subscribing", delay));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Collect)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut subscription = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Collect)),
            sub = self.channel.subscribe() => sub?,
        };
        self.subscriptions.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let mut seen = HashSet::with_capacity(expected);
        let progress_every = self.options.progress_every.max(1);

        while seen.len() < expected {
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.observer.record_message(&format!(
                        "cancelled before receiving peer information from {} peers",
                        expected
                    ));
                    return Err(DiscoveryError::cancelled(Stage::Collect));
                }
                delivered = subscription.recv() => delivered,
            };

            let record = match delivered {
                None => {
                    return Err(DiscoveryError::InsufficientPeers {
                        expected,
                        received: seen.len(),
                    });
                }
                Some(Err(source)) => {
                    return Err(DiscoveryError::Decode {
                        topic: self.channel.topic_name().to_string(),
                        source,
                    });
                }
                Some(Ok(record)) => record,
            };

            if !seen.insert(record.id()) {
                debug!("ignoring duplicate registration from {}", record.info.id.short());
                continue;
            }

            let received = {
                let mut peers = self.peers.lock();
                peers.push(record.clone());
                peers.len()
            };
            debug!(
                "received peer information from {} of {} peers in {:?} {}",
                received,
                expected,
                start.elapsed(),
                record.info.id.short()
            );
            if received % progress_every == 0 {
                self.observer.record_message(&format!(
                    "received peer information from {} of {} peers in {:?}",
                    received,
                    expected,
                    start.elapsed()
                ));
            }
        }

        Ok(Arc::new(self.snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySyncService;
    use crate::observer::MemoryObserver;
    use crate::types::{NodeRole, PeerId, PeerInfo};

    fn record(seq: u64) -> PeerRecord {
        PeerRecord::new(
            PeerInfo::new(PeerId::random(), vec!["127.0.0.1:9000".parse().unwrap()]),
            seq,
            NodeRole::Lurker,
        )
    }

    fn registry(service: &Arc<MemorySyncService>) -> PeerRegistry {
        PeerRegistry::new(RegistrationChannel::new(service.clone()))
    }

    async fn publish_all(service: &Arc<MemorySyncService>, records: &[PeerRecord]) {
        let channel = RegistrationChannel::new(service.clone());
        for r in records {
            channel.publish(r).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_register_publishes_once() {
        let service = Arc::new(MemorySyncService::new());
        let registry = registry(&service);
        let cancel = CancellationToken::new();
        let local = record(1);

        let first = registry.register(&local, &cancel).await.unwrap();
        let second = registry.register(&local, &cancel).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.published_count(crate::channel::PEER_REGISTRATION_TOPIC), 1);
    }

    #[tokio::test]
    async fn test_register_fails_when_service_unreachable() {
        let service = Arc::new(MemorySyncService::new());
        service.set_unreachable(true);
        let observer = Arc::new(MemoryObserver::new());
        let registry = registry(&service).with_observer(observer.clone());

        let err = registry
            .register(&record(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Publish { .. }));
        assert_eq!(observer.count_containing("not publishing"), 1);
    }

    #[tokio::test]
    async fn test_collect_returns_all_records() {
        let service = Arc::new(MemorySyncService::new());
        let records: Vec<_> = (1..=5).map(record).collect();
        publish_all(&service, &records).await;

        let peers = registry(&service)
            .collect(5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(peers.len(), 5);
        for r in &records {
            assert!(peers.contains(r));
        }
    }

    #[tokio::test]
    async fn test_collect_twice_uses_cache() {
        let service = Arc::new(MemorySyncService::new());
        publish_all(&service, &(1..=3).map(record).collect::<Vec<_>>()).await;
        let registry = registry(&service);
        let cancel = CancellationToken::new();

        let first = registry.collect(3, &cancel).await.unwrap();
        let second = registry.collect(3, &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_collect_runs_single_pass() {
        let service = Arc::new(MemorySyncService::new());
        let registry = Arc::new(registry(&service));
        let cancel = CancellationToken::new();

        let records = (1..=4).map(record).collect::<Vec<_>>();
        let (a, b, _) = tokio::join!(
            registry.collect(4, &cancel),
            registry.collect(4, &cancel),
            publish_all(&service, &records),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(service.subscription_count(crate::channel::PEER_REGISTRATION_TOPIC), 1);
    }

    #[tokio::test]
    async fn test_collect_cancelled() {
        let service = Arc::new(MemorySyncService::new());
        publish_all(&service, &[record(1)]).await;
        let registry = registry(&service);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = registry.collect(5, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Cancelled {
                stage: Stage::Collect
            }
        ));
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_collect_cancelled_while_waiting() {
        let service = Arc::new(MemorySyncService::new());
        publish_all(&service, &[record(1), record(2)]).await;
        let registry = Arc::new(registry(&service));
        let cancel = CancellationToken::new();

        let task = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.collect(5, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, DiscoveryError::Cancelled { .. }));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_waiting_caller_observes_own_cancellation() {
        let service = Arc::new(MemorySyncService::new());
        let registry = Arc::new(registry(&service));

        // First caller drives a pass that cannot finish.
        let driving = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.collect(5, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), registry.collect(5, &cancelled))
            .await
            .expect("second caller must not wait for the first pass")
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Cancelled {
                stage: Stage::Collect
            }
        ));
        assert!(!driving.is_finished());
        driving.abort();
    }

    #[tokio::test]
    async fn test_register_cancelled() {
        let service = Arc::new(MemorySyncService::new());
        let registry = registry(&service);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = registry.register(&record(1), &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Cancelled {
                stage: Stage::Register
            }
        ));
        assert_eq!(service.published_count(crate::channel::PEER_REGISTRATION_TOPIC), 0);
    }

    #[tokio::test]
    async fn test_register_fails_on_closed_channel() {
        let service = Arc::new(MemorySyncService::new());
        service.close_topic(crate::channel::PEER_REGISTRATION_TOPIC);
        let registry = registry(&service);

        let err = registry
            .register(&record(1), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DiscoveryError::Publish { topic, source } => {
                assert_eq!(topic, crate::channel::PEER_REGISTRATION_TOPIC);
                assert!(matches!(source, crate::error::SyncError::TopicClosed(_)));
            }
            other => panic!("expected publish error, got {:?}", other),
        }

        // A failed publish is not cached.
        assert!(registry.register(&record(1), &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_is_insufficient_peers() {
        let service = Arc::new(MemorySyncService::new());
        publish_all(&service, &[record(1), record(2)]).await;
        service.close_topic(crate::channel::PEER_REGISTRATION_TOPIC);

        let err = registry(&service)
            .collect(5, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DiscoveryError::InsufficientPeers { expected, received } => {
                assert_eq!(expected, 5);
                assert_eq!(received, 2);
            }
            other => panic!("expected InsufficientPeers, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collect_timeout() {
        let service = Arc::new(MemorySyncService::new());
        let options = RegistryOptions {
            collect_timeout: Some(Duration::from_millis(50)),
            subscribe_jitter: false,
            ..Default::default()
        };
        let registry =
            PeerRegistry::with_options(RegistrationChannel::new(service.clone()), options);

        let err = registry
            .collect(3, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Timeout {
                stage: Stage::Collect
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_counted_once() {
        let service = Arc::new(MemorySyncService::new());
        let a = record(1);
        let b = record(2);
        publish_all(&service, &[a.clone(), a.clone(), b.clone()]).await;

        let peers = registry(&service)
            .collect(2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(peers.as_slice(), &[a, b]);
    }

    #[tokio::test]
    async fn test_progress_milestones_reported() {
        let service = Arc::new(MemorySyncService::new());
        publish_all(&service, &(1..=6).map(record).collect::<Vec<_>>()).await;
        let observer = Arc::new(MemoryObserver::new());
        let options = RegistryOptions {
            progress_every: 2,
            ..Default::default()
        };
        let registry = PeerRegistry::with_options(RegistrationChannel::new(service.clone()), options)
            .with_observer(observer.clone());

        registry.collect(6, &CancellationToken::new()).await.unwrap();
        assert_eq!(observer.count_containing("received peer information"), 3);
    }
}
