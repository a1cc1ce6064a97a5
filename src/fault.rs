//! Fault & recovery controller (C8): drives simulated server failure,
//! node drop/recover, partition, and triggers resync. The fault controller
//! is the sole writer of node status outside of resync (§5).

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::error::{FabricError, Result};
use crate::fabric::Fabric;
use crate::frame::{NetworkTopology, ServerFrame, Severity, SystemEventData};
use crate::registry::NodeStatus;

/// node_dropout's scheduled recovery fires after a uniform delay in this
/// range (seconds), per §4.8.
const NODE_RECOVERY_DELAY_RANGE_SECS: std::ops::Range<u64> = 10..30;

fn event(event_type: &str, description: String, severity: Severity) -> ServerFrame {
    ServerFrame::SystemEvent {
        data: SystemEventData {
            event_type: event_type.to_string(),
            description,
            timestamp: chrono::Utc::now().timestamp(),
            severity,
        },
    }
}

impl Fabric {
    async fn broadcast_topology(&self) {
        let nodes = self
            .registry
            .snapshot_all()
            .await
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        self.broadcast(ServerFrame::NetworkTopology {
            data: NetworkTopology {
                server_online: self.registry.server_online.load(std::sync::atomic::Ordering::SeqCst),
                network_state: self.registry.network_state(),
                nodes,
                connections: Vec::new(),
            },
        });
    }

    /// `server_failure`: server state -> down; all ONLINE nodes -> P2P_ONLY.
    /// Idempotent: a no-op if the server is already down.
    pub async fn scenario_server_failure(&self) -> Result<()> {
        if !self.registry.server_online.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FabricError::ScenarioConflict("server already down".into()));
        }
        self.registry.server_online.store(false, std::sync::atomic::Ordering::SeqCst);
        for node_id in self.registry.reachable_ids(&[NodeStatus::Online]).await {
            self.registry.set_status(&node_id, NodeStatus::P2pOnly).await;
        }
        warn!("server_failure: central server marked down");
        self.broadcast(event(
            "server_failure",
            "central server failure: network falling back to P2P mesh".into(),
            Severity::Critical,
        ));
        self.broadcast_topology().await;
        Ok(())
    }

    /// `server_recovery`: server state -> up; P2P_ONLY -> RECONNECTING,
    /// runs resync, then -> ONLINE. Idempotent if already up.
    pub async fn scenario_server_recovery(self: &Arc<Self>) -> Result<()> {
        if self.registry.server_online.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FabricError::ScenarioConflict("server already up".into()));
        }
        self.registry.server_online.store(true, std::sync::atomic::Ordering::SeqCst);
        let p2p_nodes = self.registry.reachable_ids(&[NodeStatus::P2pOnly]).await;
        for node_id in &p2p_nodes {
            self.registry.set_status(node_id, NodeStatus::Reconnecting).await;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = self.resync().await?;
        info!(
            conflicts_resolved = report.conflicts_resolved,
            messages_merged = report.messages_merged,
            "server_recovery: resync complete"
        );

        for node_id in &p2p_nodes {
            self.registry.set_status(node_id, NodeStatus::Online).await;
        }
        self.broadcast(event(
            "server_recovery",
            "central server recovered: nodes returning to centralized routing".into(),
            Severity::Info,
        ));
        self.broadcast_topology().await;
        Ok(())
    }

    /// `node_dropout`: pick a reachable node uniformly at random, mark
    /// OFFLINE, schedule its recovery after a random 10-30s delay.
    pub async fn scenario_node_dropout(self: &Arc<Self>) -> Result<()> {
        let candidates = self
            .registry
            .reachable_ids(&[NodeStatus::Online, NodeStatus::P2pOnly])
            .await;
        let Some(target) = candidates.choose(&mut rand::thread_rng()).cloned() else {
            return Err(FabricError::ScenarioConflict("no reachable node to drop".into()));
        };
        self.registry.set_status(&target, NodeStatus::Offline).await;
        warn!(node_id = %target, "node_dropout: node marked offline");
        self.broadcast(event(
            "node_dropout",
            format!("node {target} dropped out of the network"),
            Severity::Warning,
        ));
        self.broadcast_topology().await;

        let delay_secs = rand::thread_rng().gen_range(NODE_RECOVERY_DELAY_RANGE_SECS);
        let fabric = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            fabric.scenario_node_recovery(&target).await;
        });
        Ok(())
    }

    /// `node_recovery` (scheduled): target -> RECONNECTING -> ONLINE/P2P_ONLY
    /// depending on current server state.
    async fn scenario_node_recovery(&self, node_id: &str) {
        self.registry.set_status(node_id, NodeStatus::Reconnecting).await;
        let target_status = if self.registry.server_online.load(std::sync::atomic::Ordering::SeqCst) {
            NodeStatus::Online
        } else {
            NodeStatus::P2pOnly
        };
        self.registry.set_status(node_id, target_status).await;
        info!(node_id, "node_recovery: node rejoined the network");
        self.broadcast(event(
            "node_recovery",
            format!("node {node_id} recovered and rejoined the network"),
            Severity::Info,
        ));
        self.broadcast_topology().await;
    }

    /// `network_partition`: splits nodes into two roughly equal groups;
    /// cross-group routing fails until the partition is lifted (enforced
    /// by `Registry::p2p_neighbors`, unlike the demo source this is
    /// grounded on, which only logs the split without enforcing it).
    pub async fn scenario_network_partition(&self) -> Result<()> {
        let mut ids = self.registry.all_node_ids().await;
        if ids.len() < 2 {
            return Err(FabricError::ScenarioConflict("not enough nodes to partition".into()));
        }
        ids.sort();
        let mid = ids.len() / 2;
        let group_a: HashSet<String> = ids[..mid].iter().cloned().collect();
        let group_b: HashSet<String> = ids[mid..].iter().cloned().collect();
        self.registry.set_partition(Some((group_a, group_b))).await;
        warn!("network_partition: network split into two isolated groups");
        self.broadcast(event(
            "network_partition",
            "network partitioned into two isolated groups".into(),
            Severity::Critical,
        ));
        self.broadcast_topology().await;
        Ok(())
    }

    pub async fn lift_partition(&self) {
        self.registry.set_partition(None).await;
        self.broadcast_topology().await;
    }

    /// `full_demo`: scripted sequence exercising failure, dropout, and
    /// recovery with waits between each step, ending in a completion event.
    pub async fn scenario_full_demo(self: &Arc<Self>) -> Result<()> {
        self.broadcast(event("demo_start", "full battlefield demo starting".into(), Severity::Info));
        tokio::time::sleep(Duration::from_secs(3)).await;
        let _ = self.scenario_server_failure().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = self.scenario_node_dropout().await;
        tokio::time::sleep(Duration::from_secs(8)).await;
        let _ = self.scenario_server_recovery().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        self.broadcast(event(
            "demo_complete",
            "full battlefield demo complete".into(),
            Severity::Info,
        ));
        Ok(())
    }

    pub async fn current_topology(&self) -> NetworkTopology {
        let nodes = self
            .registry
            .snapshot_all()
            .await
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        NetworkTopology {
            server_online: self.registry.server_online.load(std::sync::atomic::Ordering::SeqCst),
            network_state: self.registry.network_state(),
            nodes,
            connections: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricConfig;
    use crate::registry::{Node, Position};

    async fn fabric_with(count: usize) -> Arc<Fabric> {
        let dir = std::env::temp_dir().join(format!("sainya-fabric-fault-{}", uuid::Uuid::new_v4()));
        let fabric = Fabric::new(FabricConfig {
            data_dir: dir,
            ..Default::default()
        })
        .unwrap();
        for i in 0..count {
            fabric
                .registry
                .insert(
                    Node::new(
                        &format!("n{i}"),
                        &format!("Node{i}"),
                        "SGT",
                        "1st",
                        Position { x: i as f64, y: 0.0 },
                    )
                    .unwrap(),
                )
                .await;
        }
        Arc::new(fabric)
    }

    #[tokio::test]
    async fn server_failure_flips_online_nodes_to_p2p_only() {
        let fabric = fabric_with(2).await;
        fabric.scenario_server_failure().await.unwrap();
        assert_eq!(
            fabric.registry.status_of("n0").await.unwrap(),
            NodeStatus::P2pOnly
        );
    }

    #[tokio::test]
    async fn server_failure_is_idempotent() {
        let fabric = fabric_with(1).await;
        fabric.scenario_server_failure().await.unwrap();
        assert!(fabric.scenario_server_failure().await.is_err());
    }

    #[tokio::test]
    async fn server_recovery_on_already_up_server_is_a_no_op() {
        let fabric = fabric_with(1).await;
        assert!(fabric.scenario_server_recovery().await.is_err());
    }

    #[tokio::test]
    async fn partition_splits_nodes_into_two_groups() {
        let fabric = fabric_with(4).await;
        fabric.scenario_network_partition().await.unwrap();
        assert!(fabric.registry.is_partitioned().await);
    }
}
