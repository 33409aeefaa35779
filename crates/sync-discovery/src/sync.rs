//! Synchronization service collaborator.
//!
//! The sync service is the trusted rendezvous point of a test run. It offers
//! two primitives:
//!
//! - **Topics**: append-only broadcast streams. Publishing returns the
//!   1-based position of the value in the topic, which doubles as a
//!   run-unique sequence number. Subscribers receive every value ever
//!   published, followed by new ones.
//! - **States**: named counters. Signalling entry increments the counter;
//!   a barrier resolves once the counter reaches a target.
//!
//! Payloads cross the service as JSON. [`Topic`] adds a typed layer on top.

use crate::error::SyncError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tokio::sync::mpsc;

/// Stream of raw values delivered for one subscription. The stream ends when
/// the topic is closed or the service drops the subscription.
pub type Subscription = mpsc::UnboundedReceiver<serde_json::Value>;

/// Client for the synchronization service.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Append a value to a topic and return its sequence number.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<u64, SyncError>;

    /// Subscribe to a topic, replaying everything published so far.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SyncError>;

    /// Signal entry into a state and return the updated entry count.
    async fn signal_entry(&self, state: &str) -> Result<u64, SyncError>;

    /// Resolve once `target` entries into `state` have been signalled.
    ///
    /// Cancellation is the caller's concern: dropping the future abandons the wait.
    async fn barrier(&self, state: &str, target: u64) -> Result<(), SyncError>;
}

/// Named topic carrying values of type `T`.
pub struct Topic<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("name", &self.name).finish()
    }
}

impl<T: Serialize + DeserializeOwned> Topic<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode and publish a value, returning its sequence number.
    pub async fn publish(&self, client: &dyn SyncClient, value: &T) -> Result<u64, SyncError> {
        let payload = serde_json::to_value(value)?;
        client.publish(&self.name, payload).await
    }

    /// Open a typed subscription.
    pub async fn subscribe(&self, client: &dyn SyncClient) -> Result<TypedSubscription<T>, SyncError> {
        let rx = client.subscribe(&self.name).await?;
        Ok(TypedSubscription {
            rx,
            _marker: PhantomData,
        })
    }
}

/// Subscription that decodes each delivered value into `T`.
pub struct TypedSubscription<T> {
    rx: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedSubscription<T> {
    /// Next value, `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<T, serde_json::Error>> {
        let value = self.rx.recv().await?;
        Some(serde_json::from_value(value))
    }
}
