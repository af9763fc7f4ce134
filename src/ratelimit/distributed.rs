//! Distributed coordinator that splits a global rate across active nodes.
//!
//! Each node enforces `total_rate / active_nodes` locally with its own
//! [`TokenBucket`]. Peers learn about each other only through periodically
//! exchanged [`NodeStatus`] messages, so this is a best-effort, eventually
//! converging approximation: there is no leader, no agreement on membership,
//! and a partitioned node keeps admitting at its last known share.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::mesh::{NodeStatus, StatusPublisher};

use super::backend::Limiter;
use super::token_bucket::TokenBucket;

/// Latest status seen from a peer.
#[derive(Debug, Clone)]
struct PeerEntry {
    status: NodeStatus,
    received_at: Instant,
}

/// The share in force and the bucket sized for it, replaced together.
#[derive(Debug, Clone)]
struct Enforcement {
    share: u64,
    bucket: Arc<TokenBucket>,
}

/// Local enforcement of a share of a cluster-wide rate.
pub struct DistributedCoordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    enforcement: RwLock<Enforcement>,
    /// Latest status per peer node id
    peers: RwLock<HashMap<String, PeerEntry>>,
    inbox_tx: mpsc::Sender<NodeStatus>,
    inbox_rx: Mutex<mpsc::Receiver<NodeStatus>>,
    dropped: AtomicU64,
}

impl DistributedCoordinator {
    /// Create a coordinator with default intervals on the system clock.
    pub fn new(node_id: impl Into<String>, total_rate: u64, node_count: u64) -> Self {
        Self::with_config(
            CoordinatorConfig::new(node_id, total_rate, node_count),
            SystemClock::shared(),
        )
    }

    /// Create a coordinator from a full configuration.
    ///
    /// The initial share is `total_rate / node_count`; a node count of zero
    /// is treated as one.
    pub fn with_config(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Self {
        let share = config.total_rate / config.node_count.max(1);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let bucket = Arc::new(Self::bucket_for(share, clock.clone()));

        info!(
            node_id = %config.node_id,
            total_rate = config.total_rate,
            node_count = config.node_count,
            share = share,
            "Coordinator initialized"
        );

        Self {
            config,
            clock,
            enforcement: RwLock::new(Enforcement { share, bucket }),
            peers: RwLock::new(HashMap::new()),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            dropped: AtomicU64::new(0),
        }
    }

    /// Admit a single request against the local share.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Admit `n` requests against the local share.
    pub fn allow_n(&self, n: u64) -> bool {
        let bucket = self.enforcement.read().bucket.clone();
        bucket.allow_n(n)
    }

    /// Queue a peer status for the next drain.
    ///
    /// Never blocks: when the inbox is full the status is dropped and
    /// `false` is returned.
    pub fn receive_status(&self, status: NodeStatus) -> bool {
        match self.inbox_tx.try_send(status) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let reason = e.to_string();
                warn!(
                    node_id = %self.config.node_id,
                    from = %e.into_inner().node_id,
                    reason = %reason,
                    "Dropping peer status"
                );
                false
            }
        }
    }

    /// Apply every queued status, expire silent peers, and recompute the
    /// share if membership may have changed. Returns the number of statuses
    /// applied.
    pub fn drain(&self) -> usize {
        let mut received = Vec::new();
        {
            let mut inbox = self.inbox_rx.lock();
            while let Ok(status) = inbox.try_recv() {
                received.push(status);
            }
        }

        let now = self.clock.now();
        let mut applied = 0;
        let mut expired = 0;
        {
            let mut peers = self.peers.write();
            for status in received {
                if status.node_id == self.config.node_id {
                    continue;
                }
                trace!(from = %status.node_id, rate = status.rate, "Applying peer status");
                peers.insert(
                    status.node_id.clone(),
                    PeerEntry {
                        status,
                        received_at: now,
                    },
                );
                applied += 1;
            }

            if let Some(ttl) = self.config.peer_ttl() {
                let before = peers.len();
                peers.retain(|_, entry| now.saturating_duration_since(entry.received_at) < ttl);
                expired = before - peers.len();
            }
        }

        if expired > 0 {
            debug!(node_id = %self.config.node_id, expired = expired, "Expired silent peers");
        }
        if applied > 0 || expired > 0 {
            self.recompute();
        }
        applied
    }

    /// Re-derive the local share from the active node count and replace the
    /// bucket if it changed.
    fn recompute(&self) {
        let mut enforcement = self.enforcement.write();
        let active = self.peers.read().len() as u64 + 1;
        let share = self.config.total_rate / active;
        let current = enforcement.share;
        if share == current {
            return;
        }

        *enforcement = Enforcement {
            share,
            bucket: Arc::new(Self::bucket_for(share, self.clock.clone())),
        };
        drop(enforcement);
        info!(
            node_id = %self.config.node_id,
            active_nodes = active,
            old_share = current,
            new_share = share,
            "Local share changed"
        );
    }

    /// This node's current status.
    pub fn status(&self) -> NodeStatus {
        NodeStatus::new(self.config.node_id.clone(), self.local_share())
    }

    /// Publish this node's status through `publisher`.
    pub async fn publish_status(&self, publisher: &dyn StatusPublisher) -> Result<()> {
        let status = self.status();
        trace!(node_id = %status.node_id, rate = status.rate, "Publishing status");
        publisher.publish(status).await
    }

    /// Start the periodic drain and publish tasks.
    ///
    /// Both tasks stop when `shutdown` is cancelled or the returned handle is
    /// shut down.
    pub fn spawn(
        self: &Arc<Self>,
        publisher: Arc<dyn StatusPublisher>,
        shutdown: CancellationToken,
    ) -> CoordinatorHandle {
        let token = shutdown.child_token();

        let drain_task = {
            let coordinator = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(coordinator.config.drain_interval());
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            coordinator.drain();
                        }
                        _ = token.cancelled() => {
                            debug!(node_id = %coordinator.config.node_id, "Drain task stopping");
                            return;
                        }
                    }
                }
            })
        };

        let publish_task = {
            let coordinator = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(coordinator.config.publish_interval());
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = coordinator.publish_status(publisher.as_ref()).await {
                                warn!(
                                    node_id = %coordinator.config.node_id,
                                    error = %e,
                                    "Failed to publish status"
                                );
                            }
                        }
                        _ = token.cancelled() => {
                            debug!(node_id = %coordinator.config.node_id, "Publish task stopping");
                            return;
                        }
                    }
                }
            })
        };

        info!(node_id = %self.config.node_id, "Coordinator tasks started");

        CoordinatorHandle {
            token,
            tasks: vec![drain_task, publish_task],
        }
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// The rate this node currently enforces.
    pub fn local_share(&self) -> u64 {
        self.enforcement.read().share
    }

    /// Nodes believed active, including this one.
    pub fn active_nodes(&self) -> usize {
        self.peers.read().len() + 1
    }

    /// IDs of the peers heard from, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The latest rate a peer reported.
    pub fn peer_rate(&self, node_id: &str) -> Option<u64> {
        self.peers.read().get(node_id).map(|p| p.status.rate)
    }

    /// Statuses dropped because the inbox was full.
    pub fn dropped_statuses(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Tokens left in the local bucket.
    pub fn tokens(&self) -> u64 {
        let bucket = self.enforcement.read().bucket.clone();
        bucket.tokens()
    }

    /// Get the configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn bucket_for(share: u64, clock: Arc<dyn Clock>) -> TokenBucket {
        TokenBucket::with_clock(share.saturating_mul(2), share, clock)
    }
}

impl Limiter for DistributedCoordinator {
    fn allow_n(&self, n: u64) -> bool {
        DistributedCoordinator::allow_n(self, n)
    }
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("node_id", &self.config.node_id)
            .field("total_rate", &self.config.total_rate)
            .field("local_share", &self.local_share())
            .field("active_nodes", &self.active_nodes())
            .finish()
    }
}

/// Handle to a coordinator's background tasks.
#[derive(Debug)]
pub struct CoordinatorHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Stop both tasks and wait for them to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }
    }
}
