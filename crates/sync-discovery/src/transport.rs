//! Transport collaborator.
//!
//! The discovery core never dials sockets itself. It asks a [`Transport`] to
//! dial a peer, inspects the resulting connections for reporting, and, when
//! an attempt fails, asks the transport to forget the failure so the next
//! attempt is not short-circuited by the transport's dial-backoff cache.

use crate::error::TransportError;
use crate::types::{PeerId, PeerInfo};
use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// An established connection as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Remote peer
    pub peer: PeerId,
    /// Local end of the connection
    pub local_addr: SocketAddr,
    /// Remote end of the connection
    pub remote_addr: SocketAddr,
}

/// Host-level transport used to reach other nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity and listen addresses of the local node.
    fn local_peer(&self) -> PeerInfo;

    /// Dial a peer. Succeeds immediately if a connection already exists.
    async fn dial(&self, peer: &PeerInfo, timeout: Duration) -> Result<(), TransportError>;

    /// Connections currently open to `peer`.
    fn active_connections(&self, peer: &PeerId) -> Vec<ConnectionInfo>;

    /// Drop any dial-backoff entry recorded for `peer`.
    fn clear_dial_backoff(&self, peer: &PeerId);
}
