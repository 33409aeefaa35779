//! In-process synchronization service.
//!
//! Topics keep their full history so late subscribers replay every value,
//! which matches the delivery guarantees the discovery core relies on.
//! Failure injection hooks (`set_unreachable`, `close_topic`) let harnesses
//! exercise the error paths.

use crate::error::SyncError;
use crate::sync::{Subscription, SyncClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::debug;

#[derive(Default)]
struct TopicState {
    history: Vec<serde_json::Value>,
    subscribers: Vec<mpsc::UnboundedSender<serde_json::Value>>,
    subscriptions_opened: usize,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, TopicState>,
    states: HashMap<String, u64>,
}

/// Sync service shared by every node of an in-process run.
#[derive(Default)]
pub struct MemorySyncService {
    inner: Mutex<Inner>,
    state_changed: Notify,
    unreachable: AtomicBool,
}

impl MemorySyncService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`SyncError::Unreachable`].
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    /// Close a topic: pending subscriptions end after draining, new ones
    /// replay the history and end, publishes fail.
    pub fn close_topic(&self, topic: &str) {
        let mut inner = self.inner.lock();
        let state = inner.topics.entry(topic.to_string()).or_default();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Number of values published on a topic.
    #[must_use]
    pub fn published_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.history.len())
    }

    /// Number of subscriptions ever opened on a topic.
    #[must_use]
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.subscriptions_opened)
    }

    /// Current entry count of a state.
    #[must_use]
    pub fn state_count(&self, state: &str) -> u64 {
        self.inner.lock().states.get(state).copied().unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<(), SyncError> {
        if self.unreachable.load(Ordering::Acquire) {
            return Err(SyncError::Unreachable(
                "in-memory sync service marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncClient for MemorySyncService {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<u64, SyncError> {
        self.check_reachable()?;
        let mut inner = self.inner.lock();
        let state = inner.topics.entry(topic.to_string()).or_default();
        if state.closed {
            return Err(SyncError::TopicClosed(topic.to_string()));
        }
        state.history.push(payload.clone());
        state
            .subscribers
            .retain(|tx| tx.send(payload.clone()).is_ok());
        let seq = state.history.len() as u64;
        debug!(topic, seq, "published to topic");
        Ok(seq)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, SyncError> {
        self.check_reachable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let state = inner.topics.entry(topic.to_string()).or_default();
        state.subscriptions_opened += 1;
        for value in &state.history {
            // Receiver is still in scope, send cannot fail.
            let _ = tx.send(value.clone());
        }
        if !state.closed {
            state.subscribers.push(tx);
        }
        Ok(rx)
    }

    async fn signal_entry(&self, state: &str) -> Result<u64, SyncError> {
        self.check_reachable()?;
        let count = {
            let mut inner = self.inner.lock();
            let count = inner.states.entry(state.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.state_changed.notify_waiters();
        Ok(count)
    }

    async fn barrier(&self, state: &str, target: u64) -> Result<(), SyncError> {
        self.check_reachable()?;
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state_count(state) >= target {
                return Ok(());
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Topic;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_returns_increasing_sequence() {
        let service = MemorySyncService::new();
        let topic: Topic<String> = Topic::new("nodes");
        assert_eq!(topic.publish(&service, &"a".to_string()).await.unwrap(), 1);
        assert_eq!(topic.publish(&service, &"b".to_string()).await.unwrap(), 2);
        assert_eq!(service.published_count("nodes"), 2);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_history() {
        let service = MemorySyncService::new();
        let topic: Topic<u32> = Topic::new("numbers");
        topic.publish(&service, &1).await.unwrap();
        let mut sub = topic.subscribe(&service).await.unwrap();
        topic.publish(&service, &2).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap().unwrap(), 2);
        assert_eq!(service.subscription_count("numbers"), 1);
    }

    #[tokio::test]
    async fn test_closed_topic_ends_stream() {
        let service = MemorySyncService::new();
        let topic: Topic<u32> = Topic::new("numbers");
        topic.publish(&service, &7).await.unwrap();
        let mut sub = topic.subscribe(&service).await.unwrap();
        service.close_topic("numbers");

        assert_eq!(sub.recv().await.unwrap().unwrap(), 7);
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            topic.publish(&service, &8).await,
            Err(SyncError::TopicClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_calls() {
        let service = MemorySyncService::new();
        service.set_unreachable(true);
        assert!(matches!(
            service.signal_entry("ready").await,
            Err(SyncError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_barrier_waits_for_target() {
        let service = Arc::new(MemorySyncService::new());
        service.signal_entry("ready").await.unwrap();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move { service.barrier("ready", 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        service.signal_entry("ready").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
