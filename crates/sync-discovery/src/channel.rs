//! Registration and enrollment channels.
//!
//! Every node publishes exactly one [`PeerRecord`] on the registration topic
//! and reads every other node's record from it. Before that, a node enrolls
//! on the `nodes` topic: the position of its entry there is its run-unique
//! sequence number.

use crate::error::{DiscoveryError, Result};
use crate::sync::{SyncClient, Topic, TypedSubscription};
use crate::types::{PeerInfo, PeerRecord};
use std::sync::Arc;

/// Topic carrying peer registrations.
pub const PEER_REGISTRATION_TOPIC: &str = "pubsub-test-peers";

/// Topic used to hand out sequence numbers.
pub const ENROLLMENT_TOPIC: &str = "nodes";

/// Typed broadcast channel for [`PeerRecord`]s.
#[derive(Clone)]
pub struct RegistrationChannel {
    client: Arc<dyn SyncClient>,
    topic: Topic<PeerRecord>,
}

impl RegistrationChannel {
    pub fn new(client: Arc<dyn SyncClient>) -> Self {
        Self::with_topic(client, PEER_REGISTRATION_TOPIC)
    }

    pub fn with_topic(client: Arc<dyn SyncClient>, topic: &str) -> Self {
        Self {
            client,
            topic: Topic::new(topic),
        }
    }

    #[must_use]
    pub fn topic_name(&self) -> &str {
        self.topic.name()
    }

    /// Publish a record, returning its position in the topic.
    pub async fn publish(&self, record: &PeerRecord) -> Result<u64> {
        self.topic
            .publish(self.client.as_ref(), record)
            .await
            .map_err(|source| DiscoveryError::Publish {
                topic: self.topic.name().to_string(),
                source,
            })
    }

    /// Subscribe to every record published on the channel.
    pub async fn subscribe(&self) -> Result<TypedSubscription<PeerRecord>> {
        self.topic
            .subscribe(self.client.as_ref())
            .await
            .map_err(|source| DiscoveryError::Subscribe {
                topic: self.topic.name().to_string(),
                source,
            })
    }
}

/// Publish the local address record on the enrollment topic and return the
/// sequence number the sync service assigned to it.
pub async fn enroll(client: &dyn SyncClient, local: &PeerInfo) -> Result<u64> {
    let topic: Topic<PeerInfo> = Topic::new(ENROLLMENT_TOPIC);
    topic
        .publish(client, local)
        .await
        .map_err(|source| DiscoveryError::Publish {
            topic: ENROLLMENT_TOPIC.to_string(),
            source,
        })
}
