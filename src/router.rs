//! Message router (C6): chooses the centralized or P2P path, performs the
//! bounded-hop flood, enforces hop budgets, and appends the definitive
//! record to the sender's ledger before notifying the hub.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::clock::VectorClock;
use crate::crypto;
use crate::error::{FabricError, Result};
use crate::fabric::Fabric;
use crate::frame::{MessageType, NewMessageData, ServerFrame, Severity, SystemEventData};
use crate::message::{Message, RouteOutcome};
use crate::registry::NodeStatus;

/// Per-hop simulated latency (ms), scaled by hop count to emulate §4.6's
/// "simulated per-hop latency proportional to hops traversed".
const SIMULATED_HOP_LATENCY_MS: u64 = 50;

impl Fabric {
    /// Routes a message from `sender_id` toward `recipient_id` (absent =
    /// broadcast). Returns the delivered message (for the hub to fan out)
    /// or a `Deferred` outcome if the sender is offline.
    pub async fn route_message(
        &self,
        sender_id: &str,
        recipient_id: Option<String>,
        message_type: MessageType,
        content: String,
        max_hops: u32,
    ) -> Result<RouteOutcome> {
        let sender_status = self
            .registry
            .status_of(sender_id)
            .await
            .ok_or_else(|| FabricError::UnknownNode(sender_id.to_string()))?;

        if sender_status == NodeStatus::Offline {
            let message_id = uuid::Uuid::new_v4().to_string();
            self.registry
                .with_node_mut(sender_id, |n| n.message_queue.push(message_id.clone()))
                .await;
            warn!(sender_id, "send deferred: sender is offline");
            return Ok(RouteOutcome::Deferred {
                sender_id: sender_id.to_string(),
                message_id,
            });
        }

        let l_send = self
            .registry
            .with_node(sender_id, |n| n.lamport_clock.tick())
            .await
            .expect("sender existence checked above");

        let vector_clock = self.snapshot_vector_clock(sender_id, l_send).await;

        let symmetric_key = self
            .registry
            .with_node(sender_id, |n| n.symmetric_key)
            .await
            .expect("sender existence checked above");
        let sealed_payload = crypto::seal(content.as_bytes(), &symmetric_key)?;

        let signature = self
            .registry
            .with_node(sender_id, |n| n.keypair.sign(content.as_bytes()))
            .await
            .expect("sender existence checked above")?;

        let mut message = Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.clone(),
            message_type,
            content,
            timestamp: chrono::Utc::now().timestamp(),
            lamport_clock: l_send,
            vector_clock,
            sealed_payload,
            signature: hex::encode(signature),
            hop_count: 0,
            max_hops,
            route_path: vec![sender_id.to_string()],
        };

        let centralized = self.registry.server_online.load(std::sync::atomic::Ordering::SeqCst)
            && sender_status == NodeStatus::Online;

        if centralized {
            message.route_path = vec!["central_server".to_string()];
            info!(sender_id, recipient = ?recipient_id, "routed via centralized path");
        } else {
            let reached = self.flood_p2p(&mut message).await;
            if let Some(target) = &recipient_id {
                if !reached.contains(target) {
                    warn!(sender_id, recipient = %target, "P2P flood did not reach recipient");
                }
            }
        }

        let ledger = self.ledger_for(sender_id).await?;
        let tx = message.to_transaction();
        let cancel = self.cancel.clone();
        let block = tokio::task::spawn_blocking({
            let ledger = ledger.clone();
            move || ledger.append_message(tx, &cancel)
        })
        .await
        .map_err(|e| FabricError::Transport(e.to_string()))??;
        let _ = block;

        self.broadcast(ServerFrame::NewMessage {
            data: NewMessageData {
                id: message.message_id.clone(),
                sender_id: message.sender_id.clone(),
                sender_name: self
                    .registry
                    .with_node(sender_id, |n| n.name.clone())
                    .await
                    .unwrap_or_default(),
                content: message.content.clone(),
                message_type: message.message_type,
                timestamp: message.timestamp,
                lamport_clock: message.lamport_clock,
                route_path: message.route_path.clone(),
            },
        });

        if recipient_id.is_some() && !centralized {
            let reached: HashSet<_> = message.route_path.iter().cloned().collect();
            if let Some(target) = &recipient_id {
                if !reached.contains(target) {
                    self.broadcast(ServerFrame::SystemEvent {
                        data: SystemEventData {
                            event_type: "route_unreachable".to_string(),
                            description: format!(
                                "message {} from {} could not reach {} within {} hops",
                                message.message_id, sender_id, target, max_hops
                            ),
                            timestamp: chrono::Utc::now().timestamp(),
                            severity: Severity::Warning,
                        },
                    });
                    return Err(FabricError::RouteUnreachable(format!(
                        "{target} unreachable within {max_hops} hops"
                    )));
                }
            }
        }

        Ok(RouteOutcome::Delivered(message))
    }

    async fn snapshot_vector_clock(&self, sender_id: &str, l_send: u64) -> VectorClock {
        let mut entries = Vec::new();
        for node_id in self.registry.all_node_ids().await {
            let clock = self
                .registry
                .with_node(&node_id, |n| n.lamport_clock.get())
                .await
                .unwrap_or(0);
            entries.push((node_id, clock));
        }
        let mut vc = VectorClock::snapshot(entries);
        vc.0.insert(sender_id.to_string(), l_send);
        vc
    }

    /// Bounded breadth-first flood from the message's sender. Mutates
    /// `message.route_path`/`hop_count` in place; returns the full set of
    /// visited (reached) node ids.
    async fn flood_p2p(&self, message: &mut Message) -> HashSet<String> {
        let sender_id = message.sender_id.clone();
        let mut visited: HashSet<String> = HashSet::from([sender_id.clone()]);
        let mut frontier = vec![sender_id];
        let mut hops = 0u32;
        let recipient = message.recipient_id.clone();

        while hops < message.max_hops && !frontier.is_empty() {
            let mut next_frontier = Vec::new();
            for node_id in &frontier {
                for neighbor in self.registry.p2p_neighbors(node_id).await {
                    if visited.insert(neighbor.clone()) {
                        self.apply_receive_clock(&neighbor, message.lamport_clock).await;
                        message.route_path.push(neighbor.clone());
                        next_frontier.push(neighbor.clone());
                        if Some(&neighbor) == recipient.as_ref() {
                            message.hop_count = hops + 1;
                            tokio::time::sleep(std::time::Duration::from_millis(
                                SIMULATED_HOP_LATENCY_MS * (hops as u64 + 1),
                            ))
                            .await;
                            return visited;
                        }
                    }
                }
            }
            frontier = next_frontier;
            hops += 1;
            tokio::time::sleep(std::time::Duration::from_millis(SIMULATED_HOP_LATENCY_MS)).await;
        }
        message.hop_count = hops;
        visited
    }

    /// §4.4 receive rule, applied at each node a flooded message newly
    /// reaches: merge the node's Lamport clock with the carried clock
    /// (max + 1). A received clock that isn't ahead of the node's own is a
    /// `ClockRegression` (§7) -- non-fatal, logged, and corrected by the
    /// merge itself rather than rejecting the message.
    async fn apply_receive_clock(&self, node_id: &str, received: u64) {
        let self_before = self
            .registry
            .with_node(node_id, |n| n.lamport_clock.get())
            .await
            .unwrap_or(0);
        if received <= self_before {
            let err = FabricError::ClockRegression {
                self_clock: self_before,
                received,
            };
            warn!(node_id, error = %err, "clock regression on P2P receive, accepting and re-stamping");
        }
        self.registry
            .with_node(node_id, |n| n.lamport_clock.merge(received))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricConfig;
    use crate::registry::{Node, Position};

    async fn fabric_with_nodes(positions: &[(&str, f64, f64)]) -> Fabric {
        let dir = tempdir();
        let fabric = Fabric::new(FabricConfig {
            data_dir: dir,
            ..Default::default()
        })
        .unwrap();
        for (id, x, y) in positions {
            fabric
                .registry
                .insert(Node::new(id, id, "SGT", "1st", Position { x: *x, y: *y }).unwrap())
                .await;
        }
        fabric
    }

    fn tempdir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sainya-fabric-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn centralized_path_is_used_when_server_and_sender_online() {
        let fabric = fabric_with_nodes(&[("a", 0.0, 0.0), ("b", 1000.0, 1000.0)]).await;
        let outcome = fabric
            .route_message("a", Some("b".to_string()), MessageType::Chat, "hi".into(), 5)
            .await
            .unwrap();
        match outcome {
            RouteOutcome::Delivered(msg) => {
                assert_eq!(msg.route_path, vec!["central_server".to_string()]);
            }
            _ => panic!("expected delivery"),
        }
    }

    #[tokio::test]
    async fn p2p_flood_respects_hop_budget_and_range() {
        let fabric = fabric_with_nodes(&[
            ("a", 0.0, 0.0),
            ("b", 150.0, 0.0),
            ("c", 300.0, 0.0),
            ("d", 700.0, 0.0),
        ])
        .await;
        fabric
            .registry
            .server_online
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let result = fabric
            .route_message("a", Some("d".to_string()), MessageType::Chat, "hi".into(), 5)
            .await;
        assert!(matches!(result, Err(FabricError::RouteUnreachable(_))));
    }

    #[tokio::test]
    async fn offline_sender_defers() {
        let fabric = fabric_with_nodes(&[("a", 0.0, 0.0)]).await;
        fabric.registry.set_status("a", NodeStatus::Offline).await;
        let outcome = fabric
            .route_message("a", None, MessageType::Chat, "hi".into(), 5)
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Deferred { .. }));
    }
}
