//! Readiness barrier.
//!
//! Each node signals entry into a named state and then waits until the
//! state's entry count reaches the expected number of participants.
//!
//! State counters only grow, so a name can be reused by successive cohorts.
//! Entry positions `1..=N` form the first cohort, `N+1..=2N` the second, and
//! each entrant waits for the end of its own cohort:
//!
//! ```text
//!   expected = 2      positions  1 2 | 3 4 | 5 6
//!                     release at   2 |   4 |   6
//! ```

use crate::error::{DiscoveryError, Result, Stage};
use crate::observer::{SharedObserver, default_observer};
use crate::sync::SyncClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State entered once a node has finished connecting.
pub const READY_STATE: &str = "ready";

pub struct ReadinessBarrier {
    client: Arc<dyn SyncClient>,
    observer: SharedObserver,
}

impl ReadinessBarrier {
    pub fn new(client: Arc<dyn SyncClient>) -> Self {
        Self {
            client,
            observer: default_observer(),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Signal entry into `state` and wait until the `expected` nodes of this
    /// entrant's cohort have entered.
    ///
    /// Returns this node's entry position.
    pub async fn enter(&self, state: &str, expected: u64, cancel: &CancellationToken) -> Result<u64> {
        let barrier_err = |source| DiscoveryError::Barrier {
            state: state.to_string(),
            source,
        };

        let position = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Barrier)),
            signalled = self.client.signal_entry(state) => signalled.map_err(barrier_err)?,
        };
        let target = cohort_target(position, expected);
        debug!(
            "entered state {} as {}, waiting for {}",
            state, position, target
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DiscoveryError::cancelled(Stage::Barrier)),
            released = self.client.barrier(state, target) => released.map_err(barrier_err)?,
        }

        info!("all {} nodes reached state {}", expected, state);
        self.observer
            .record_message(&format!("all {} nodes reached state {}", expected, state));
        Ok(position)
    }
}

/// Entry count that releases the cohort `position` belongs to.
fn cohort_target(position: u64, expected: u64) -> u64 {
    if expected == 0 {
        return position;
    }
    position.div_ceil(expected) * expected
}
