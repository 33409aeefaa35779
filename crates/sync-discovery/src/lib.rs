//! Saorsa Sync Discovery
//!
//! Peer discovery and connection setup for large test networks whose nodes
//! start independently and only share a synchronization service:
//!
//! - **Registration**: every node publishes its identity and addresses once
//!   and waits until it has seen every other participant
//! - **Topology Selection**: pluggable strategies pick which peers to dial
//! - **Resilient Dialing**: jittered retries that clear the transport's dial
//!   backoff between attempts
//! - **Readiness Barrier**: all nodes rendezvous before the workload starts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Sync Service                                 │
//! │   "nodes" (enrollment)   "pubsub-test-peers"   state "ready"          │
//! └──────────┬──────────────────────┬─────────────────────┬──────────────┘
//!            │ seq                  │ PeerRecords         │ signal / wait
//!            ▼                      ▼                     ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ NodeRunner                                                            │
//! │   enroll ─► PeerRegistry ─► Topology ─► ConnectionCoordinator ─► Barrier │
//! │                                              │                        │
//! │                                              ▼                        │
//! │                                  Transport (dial, clear backoff)      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! sync-discovery-sim --nodes 50 --topology random --count 4 --fail-rate 0.2
//! ```
//!
//! The simulation starts every node in-process against [`memory`]
//! collaborators and prints one line per node once all of them have passed
//! the readiness barrier.

pub mod barrier;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod observer;
pub mod registry;
pub mod runner;
pub mod sync;
pub mod topology;
pub mod transport;
pub mod types;

// Re-export key types for convenience
pub use barrier::{READY_STATE, ReadinessBarrier};
pub use channel::{ENROLLMENT_TOPIC, PEER_REGISTRATION_TOPIC, RegistrationChannel, enroll};
pub use config::{DiscoveryConfig, PublisherPolicy};
pub use coordinator::{ConnectionCoordinator, RetryPolicy};
pub use discovery::{DiscoveryOptions, SyncDiscovery};
pub use error::{DiscoveryError, Result, Stage, SyncError, TransportError};
pub use observer::{MemoryObserver, Observer, SharedObserver, TracingObserver};
pub use registry::{PeerRegistry, RegistryOptions};
pub use runner::{NodeReport, NodeRunner};
pub use sync::{SyncClient, Topic};
pub use topology::{
    ConnectionSpec, FixedTopology, RandomHonestTopology, RandomTopology, SinglePublisherTopology,
    Topology, TopologyPolicy,
};
pub use transport::{ConnectionInfo, Transport};
pub use types::{NodeRole, PeerId, PeerInfo, PeerRecord};
