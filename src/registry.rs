//! Node registry & topology (C5): identity, keys, position, status, and
//! P2P adjacency derived from range. The router and session hub are
//! readers; the fault controller is the sole writer outside of resync.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::clock::LamportClock;
use crate::crypto::Keypair;

/// Default Euclidean radius (abstract units) within which two ONLINE/
/// P2P_ONLY nodes are P2P-adjacent.
pub const DEFAULT_P2P_RANGE: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    P2pOnly,
    Offline,
    Reconnecting,
}

impl NodeStatus {
    pub fn is_reachable(&self) -> bool {
        matches!(self, NodeStatus::Online | NodeStatus::P2pOnly)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Observed-quality metadata about a P2P adjacency (supplemented from the
/// source's `PeerConnection` model). Distinct from the node's identity
/// record; `trust_score` is deliberately not modeled here (see DESIGN.md).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerConnectionStats {
    pub attempts: u64,
    pub successes: u64,
    pub latency_ms_ewma: f64,
}

impl PeerConnectionStats {
    pub fn record_attempt(&mut self, succeeded: bool, latency_ms: f64) {
        self.attempts += 1;
        if succeeded {
            self.successes += 1;
            const ALPHA: f64 = 0.2;
            self.latency_ms_ewma = if self.attempts == 1 {
                latency_ms
            } else {
                ALPHA * latency_ms + (1.0 - ALPHA) * self.latency_ms_ewma
            };
        }
    }

    /// Weighted reliability score: success-rate dominant, latency and an
    /// implicit loss term (1 - success_rate) contribute the rest, matching
    /// the 0.4/0.3/0.3 weighting the source's quality metric uses.
    pub fn reliability_score(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        let success_rate = self.successes as f64 / self.attempts as f64;
        let latency_score = (1.0 - (self.latency_ms_ewma / 1000.0)).clamp(0.0, 1.0);
        let loss_score = success_rate;
        0.4 * success_rate + 0.3 * latency_score + 0.3 * loss_score
    }
}

pub struct Node {
    pub node_id: String,
    pub name: String,
    pub rank: String,
    pub unit: String,
    pub position: Position,
    pub status: NodeStatus,
    pub last_seen: i64,
    pub lamport_clock: LamportClock,
    pub message_queue: Vec<String>,
    pub keypair: Keypair,
    pub symmetric_key: [u8; crate::crypto::SYMMETRIC_KEY_LEN],
    pub peer_stats: HashMap<String, PeerConnectionStats>,
}

impl Node {
    pub fn new(node_id: &str, name: &str, rank: &str, unit: &str, position: Position) -> crate::error::Result<Self> {
        Ok(Self {
            node_id: node_id.to_string(),
            name: name.to_string(),
            rank: rank.to_string(),
            unit: unit.to_string(),
            position,
            status: NodeStatus::Online,
            last_seen: chrono::Utc::now().timestamp(),
            lamport_clock: LamportClock::new(),
            message_queue: Vec::new(),
            keypair: Keypair::generate()?,
            symmetric_key: crate::crypto::generate_symmetric_key(),
            peer_stats: HashMap::new(),
        })
    }
}

/// Snapshot of a single node for the `network_topology` wire frame.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub name: String,
    pub rank: String,
    pub unit: String,
    pub status: NodeStatus,
    pub position: Position,
    pub last_seen: i64,
    pub message_queue_size: usize,
    pub lamport_clock: u64,
}

impl From<&Node> for NodeSnapshot {
    fn from(n: &Node) -> Self {
        Self {
            id: n.node_id.clone(),
            name: n.name.clone(),
            rank: n.rank.clone(),
            unit: n.unit.clone(),
            status: n.status,
            position: n.position,
            last_seen: n.last_seen,
            message_queue_size: n.message_queue.len(),
            lamport_clock: n.lamport_clock.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Centralized,
    P2pFallback,
    Degraded,
    Isolated,
}

/// Owns every node's identity/status; readers-writers discipline per §5:
/// router and hub take shared reads, the fault controller is the sole
/// writer outside of resync.
pub struct Registry {
    nodes: RwLock<HashMap<String, Node>>,
    pub server_online: std::sync::atomic::AtomicBool,
    pub p2p_range: f64,
    /// Node ids split into two groups during a `network_partition`
    /// scenario; empty when no partition is active. Cross-group routing
    /// must fail while non-empty.
    partition_groups: RwLock<Option<(HashSet<String>, HashSet<String>)>>,
}

impl Registry {
    pub fn new(p2p_range: f64) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            server_online: std::sync::atomic::AtomicBool::new(true),
            p2p_range,
            partition_groups: RwLock::new(None),
        }
    }

    pub async fn insert(&self, node: Node) {
        info!(node_id = %node.node_id, "node registered");
        self.nodes.write().await.insert(node.node_id.clone(), node);
    }

    pub fn network_state(&self) -> NetworkState {
        if self.server_online.load(std::sync::atomic::Ordering::SeqCst) {
            NetworkState::Centralized
        } else {
            NetworkState::P2pFallback
        }
    }

    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.status = status;
            node.last_seen = chrono::Utc::now().timestamp();
            true
        } else {
            false
        }
    }

    pub async fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.read().await.get(node_id).map(|n| n.status)
    }

    pub async fn reachable_ids(&self, statuses: &[NodeStatus]) -> Vec<String> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| statuses.contains(&n.status))
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub async fn snapshot_all(&self) -> Vec<NodeSnapshot> {
        self.nodes.read().await.values().map(NodeSnapshot::from).collect()
    }

    /// Two nodes are P2P-adjacent iff both are ONLINE/P2P_ONLY, within
    /// `p2p_range`, and (if a partition is active) in the same group.
    pub async fn p2p_neighbors(&self, node_id: &str) -> Vec<String> {
        let nodes = self.nodes.read().await;
        let Some(origin) = nodes.get(node_id) else {
            return Vec::new();
        };
        if !origin.status.is_reachable() {
            return Vec::new();
        }
        let partition = self.partition_groups.read().await;
        nodes
            .values()
            .filter(|n| n.node_id != node_id)
            .filter(|n| n.status.is_reachable())
            .filter(|n| origin.position.distance(&n.position) <= self.p2p_range)
            .filter(|n| match partition.as_ref() {
                None => true,
                Some((group_a, group_b)) => {
                    (group_a.contains(node_id) && group_a.contains(&n.node_id))
                        || (group_b.contains(node_id) && group_b.contains(&n.node_id))
                }
            })
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub async fn set_partition(&self, groups: Option<(HashSet<String>, HashSet<String>)>) {
        *self.partition_groups.write().await = groups;
    }

    pub async fn is_partitioned(&self) -> bool {
        self.partition_groups.read().await.is_some()
    }

    pub async fn with_node<F, R>(&self, node_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Node) -> R,
    {
        self.nodes.read().await.get(node_id).map(f)
    }

    pub async fn with_node_mut<F, R>(&self, node_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Node) -> R,
    {
        self.nodes.write().await.get_mut(node_id).map(f)
    }

    pub async fn all_node_ids(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }
}
