//! Resync engine (C9): on server recovery, node rejoin, or explicit
//! `force_sync`, merges ledgers across reachable nodes, resolves ordering
//! conflicts, and advances every participating node's Lamport clock.

use tracing::{info, warn};

use crate::block::Block;
use crate::clock::{is_concurrent, tie_break_order};
use crate::error::Result;
use crate::fabric::Fabric;
use crate::frame::{ServerFrame, Severity, SystemEventData};
use crate::registry::NodeStatus;

/// §4.9 step 1: only the last N minutes of ledger blocks participate.
const COLLECT_WINDOW_MINUTES: i64 = 5;
/// Duplicate-detection window (§4.9 step 2): messages within this many
/// seconds of each other, same sender+recipient+content, are duplicates.
const DUPLICATE_EPSILON_SECS: i64 = 2;
/// §5: resync has an overall deadline; remaining conflicts carry over.
const RESYNC_DEADLINE_SECS: u64 = 30;

#[derive(Debug, Default)]
pub struct ResyncReport {
    pub conflicts_resolved: usize,
    pub messages_merged: usize,
    pub degraded_pairs: usize,
}

struct Candidate {
    node_id: String,
    block: Block,
}

impl Fabric {
    /// Runs the full resync procedure against every node in
    /// {ONLINE, P2P_ONLY, RECONNECTING}. Never mutates or reorders blocks
    /// already present; conflict resolution only ever produces new records
    /// or drops a duplicate candidate before it's appended anywhere.
    pub async fn resync(&self) -> Result<ResyncReport> {
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(RESYNC_DEADLINE_SECS);
        let participants = self
            .registry
            .reachable_ids(&[NodeStatus::Online, NodeStatus::P2pOnly, NodeStatus::Reconnecting])
            .await;

        let since = chrono::Utc::now().timestamp() - COLLECT_WINDOW_MINUTES * 60;
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut degraded_pairs = 0usize;

        for node_id in &participants {
            if tokio::time::Instant::now() > deadline {
                warn!("resync deadline exceeded while collecting, remaining nodes deferred");
                break;
            }
            match self.ledger_for(node_id).await {
                Ok(ledger) => match ledger.messages_since(since) {
                    Ok(blocks) => {
                        for block in blocks {
                            if !block.transactions.is_empty() {
                                candidates.push(Candidate {
                                    node_id: node_id.clone(),
                                    block,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(node_id, error = %e, "resync: could not read ledger, degrading to best-effort");
                        degraded_pairs += 1;
                    }
                },
                Err(e) => {
                    warn!(node_id, error = %e, "resync: ledger unavailable for peer");
                    degraded_pairs += 1;
                }
            }
        }

        let (kept, conflicts_resolved) = Self::resolve_conflicts(candidates);

        let mut messages_merged = 0usize;
        for node_id in &participants {
            let Ok(ledger) = self.ledger_for(node_id).await else {
                continue;
            };
            let local_blocks = ledger.all_blocks().unwrap_or_default();
            let local_ids: std::collections::HashSet<String> = local_blocks
                .iter()
                .flat_map(|b| b.transactions.iter().map(|t| t.message_id.clone()))
                .collect();

            for candidate in &kept {
                let already_present = candidate
                    .block
                    .transactions
                    .iter()
                    .all(|tx| local_ids.contains(&tx.message_id));
                if already_present {
                    continue;
                }
                let transactions = candidate.block.transactions.clone();
                let cancel = self.cancel.clone();
                let ledger = ledger.clone();
                let append = tokio::task::spawn_blocking(move || {
                    ledger.append_foreign_block(transactions, &cancel)
                })
                .await;
                match append {
                    Ok(Ok(_)) => messages_merged += 1,
                    Ok(Err(e)) => {
                        warn!(node_id, error = %e, "resync: could not append merged block");
                        degraded_pairs += 1;
                    }
                    Err(e) => {
                        warn!(node_id, error = %e, "resync: merge task panicked");
                        degraded_pairs += 1;
                    }
                }
            }
        }

        let l_max = {
            let mut max_clock = 0u64;
            for node_id in &participants {
                if let Some(clock) = self.registry.with_node(node_id, |n| n.lamport_clock.get()).await {
                    max_clock = max_clock.max(clock);
                }
            }
            max_clock
        };
        for node_id in &participants {
            self.registry
                .with_node(node_id, |n| n.lamport_clock.set(l_max + 1))
                .await;
        }

        let report = ResyncReport {
            conflicts_resolved,
            messages_merged,
            degraded_pairs,
        };

        info!(
            conflicts_resolved = report.conflicts_resolved,
            messages_merged = report.messages_merged,
            degraded_pairs = report.degraded_pairs,
            "resync complete"
        );
        self.broadcast(ServerFrame::SystemEvent {
            data: SystemEventData {
                event_type: "resync_complete".to_string(),
                description: format!(
                    "resync merged {} message(s), resolved {} conflict(s)",
                    report.messages_merged, report.conflicts_resolved
                ),
                timestamp: chrono::Utc::now().timestamp(),
                severity: Severity::Info,
            },
        });

        Ok(report)
    }

    pub async fn force_sync(&self) -> Result<ResyncReport> {
        self.resync().await
    }

    /// Detects and resolves conflicts per §4.9 step 2-3. Duplicates: drop
    /// the one with the higher `sender_id`. Concurrent non-duplicates: keep
    /// both, ordered by `(lamport_clock, sender_id)`.
    fn resolve_conflicts(mut candidates: Vec<Candidate>) -> (Vec<Candidate>, usize) {
        candidates.sort_by(|a, b| {
            let (ca, sa) = single_tx_clock_sender(&a.block);
            let (cb, sb) = single_tx_clock_sender(&b.block);
            tie_break_order(ca, &sa, cb, &sb)
        });

        let mut kept: Vec<Candidate> = Vec::new();
        let mut conflicts_resolved = 0usize;

        'outer: for candidate in candidates {
            let (c_clock, c_sender) = single_tx_clock_sender(&candidate.block);
            let c_recipient = single_tx_recipient(&candidate.block);
            let c_content = single_tx_content_key(&candidate.block);
            let c_timestamp = candidate.block.timestamp;

            for existing in &kept {
                let (e_clock, e_sender) = single_tx_clock_sender(&existing.block);
                if !is_concurrent(c_clock, &c_sender, e_clock, &e_sender) {
                    continue;
                }
                let e_recipient = single_tx_recipient(&existing.block);
                let e_content = single_tx_content_key(&existing.block);
                let is_duplicate = c_sender == e_sender
                    && c_recipient == e_recipient
                    && c_content == e_content
                    && (c_timestamp - existing.block.timestamp).abs() <= DUPLICATE_EPSILON_SECS;
                if is_duplicate {
                    conflicts_resolved += 1;
                    continue 'outer; // existing (lower tie-break, already kept) wins
                }
            }
            kept.push(candidate);
        }

        (kept, conflicts_resolved)
    }
}

fn single_tx_clock_sender(block: &Block) -> (u64, String) {
    block
        .transactions
        .first()
        .map(|t| (t.lamport_clock, t.sender_id.clone()))
        .unwrap_or((0, String::new()))
}

fn single_tx_recipient(block: &Block) -> Option<String> {
    block.transactions.first().and_then(|t| t.recipient_id.clone())
}

fn single_tx_content_key(block: &Block) -> String {
    // `content_hash` (plaintext SHA-256) is the stable comparison key:
    // `content_sealed.ciphertext` differs across sends of identical
    // plaintext because AES-GCM seals with a fresh random IV each time.
    block
        .transactions
        .first()
        .map(|t| t.content_hash.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{CancelToken, Transaction};
    use crate::crypto::{self, SealedBlob};
    use crate::fabric::FabricConfig;
    use crate::registry::{Node, Position};
    use std::sync::Arc;

    /// `content` stands in for the plaintext: `content_hash` is derived from
    /// it the same way the router derives it, while `content_sealed` is
    /// given an arbitrary (and, in real traffic, randomized) ciphertext --
    /// duplicate detection must not depend on the two matching.
    fn tx(sender: &str, clock: u64, content: &str) -> Transaction {
        Transaction {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender.to_string(),
            recipient_id: None,
            message_type: "CHAT".to_string(),
            content_sealed: SealedBlob {
                ciphertext: format!("{content}-{}", uuid::Uuid::new_v4()),
                iv: "cd".to_string(),
                tag: "ef".to_string(),
                algorithm: "AES-256-GCM".to_string(),
            },
            content_hash: hex::encode(crypto::sha256(content.as_bytes())),
            signature: "00".to_string(),
            lamport_clock: clock,
        }
    }

    #[tokio::test]
    async fn concurrent_blocks_merge_and_clocks_advance() {
        let dir = std::env::temp_dir().join(format!("sainya-fabric-resync-{}", uuid::Uuid::new_v4()));
        let fabric = Arc::new(Fabric::new(FabricConfig { data_dir: dir, ..Default::default() }).unwrap());

        fabric
            .registry
            .insert(Node::new("alpha_1", "Alpha", "SGT", "1st", Position { x: 0.0, y: 0.0 }).unwrap())
            .await;
        fabric
            .registry
            .insert(Node::new("bravo_1", "Bravo", "CPL", "1st", Position { x: 1.0, y: 0.0 }).unwrap())
            .await;

        let cancel = CancelToken::never();
        let alpha_ledger = fabric.ledger_for("alpha_1").await.unwrap();
        alpha_ledger.append_message(tx("alpha_1", 5, "aa"), &cancel).unwrap();
        let bravo_ledger = fabric.ledger_for("bravo_1").await.unwrap();
        bravo_ledger.append_message(tx("bravo_1", 5, "bb"), &cancel).unwrap();

        fabric.registry.with_node("alpha_1", |n| n.lamport_clock.set(5)).await;
        fabric.registry.with_node("bravo_1", |n| n.lamport_clock.set(5)).await;

        let report = fabric.resync().await.unwrap();
        assert_eq!(report.messages_merged, 2);

        let alpha_clock = fabric.registry.with_node("alpha_1", |n| n.lamport_clock.get()).await.unwrap();
        let bravo_clock = fabric.registry.with_node("bravo_1", |n| n.lamport_clock.get()).await.unwrap();
        assert_eq!(alpha_clock, 6);
        assert_eq!(bravo_clock, 6);
    }

    #[tokio::test]
    async fn duplicate_same_content_is_dropped() {
        let blocks = vec![
            Candidate {
                node_id: "alpha_1".into(),
                block: crate::block::Block::new_unmined(0, hex::encode([0u8; 32]), vec![tx("alpha_1", 5, "same")], 1, 1000),
            },
            Candidate {
                node_id: "bravo_1".into(),
                block: crate::block::Block::new_unmined(0, hex::encode([0u8; 32]), vec![tx("zulu_1", 5, "same")], 1, 1000),
            },
        ];
        let (kept, resolved) = Fabric::resolve_conflicts(blocks);
        assert_eq!(kept.len(), 1);
        assert_eq!(resolved, 1);
        assert_eq!(kept[0].node_id, "alpha_1");
    }
}
