//! Local ledger (C3): a per-node append-only log of blocks, backed by a
//! `sled::Tree` keyed by big-endian `block_number`. The hash chain is the
//! source of truth; the tree is an index, never trusted over recomputed
//! hashes. Values are `bincode`-encoded — local storage only, never sent
//! over the wire.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::block::{self, Block, CancelToken, Transaction};
use crate::error::{FabricError, Result};

pub struct Ledger {
    tree: sled::Tree,
    /// Serializes appends; mining runs while held, matching the
    /// single-writer-per-ledger discipline.
    write_lock: Mutex<()>,
    difficulty: u32,
}

fn key_for(block_number: u64) -> [u8; 8] {
    block_number.to_be_bytes()
}

impl Ledger {
    pub fn open(db: &sled::Db, node_id: &str, difficulty: u32) -> Result<Self> {
        let tree = db.open_tree(format!("ledger_{node_id}"))?;
        let ledger = Self {
            tree,
            write_lock: Mutex::new(()),
            difficulty,
        };
        if ledger.tree.is_empty() {
            ledger.init_genesis()?;
        }
        Ok(ledger)
    }

    fn init_genesis(&self) -> Result<()> {
        let genesis = Block::genesis(self.difficulty, chrono::Utc::now().timestamp());
        let encoded = bincode::serialize(&genesis)?;
        self.tree.insert(key_for(0), encoded)?;
        self.tree.flush()?;
        info!(block_hash = %genesis.block_hash, "ledger genesis block created");
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.tree.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn last_block_hash(&self) -> Result<String> {
        match self.tree.iter().rev().next() {
            Some(entry) => {
                let (_, value) = entry?;
                let block: Block = bincode::deserialize(&value)?;
                Ok(block.block_hash)
            }
            None => Ok(hex::encode([0u8; 32])),
        }
    }

    /// Appends a block carrying `tx` at the ledger's configured difficulty:
    /// builds, mines, and persists it, updating `last_block_hash`.
    pub fn append_message(&self, tx: Transaction, cancel: &CancelToken) -> Result<Block> {
        let _guard = self.write_lock.lock().expect("ledger mutex poisoned");
        let block_number = self.len();
        let previous_hash = self.last_block_hash()?;
        let mut block = Block::new_unmined(
            block_number,
            previous_hash,
            vec![tx],
            self.difficulty,
            chrono::Utc::now().timestamp(),
        );
        if !block.mine(cancel) {
            warn!(block_number, "mining cancelled before completion");
            return Err(FabricError::Transport("mining cancelled".into()));
        }
        let encoded = bincode::serialize(&block)?;
        self.tree.insert(key_for(block_number), encoded)?;
        self.tree.flush()?;
        Ok(block)
    }

    /// Merges transactions that arrived from a peer during resync. A
    /// foreign block's own `block_number`/`previous_hash` are rooted at the
    /// peer's chain tip, not ours, so they can never satisfy this ledger's
    /// linkage check verbatim -- instead we take only the transactions and
    /// rebuild a fresh block on top of our own tip, re-mining it locally
    /// (§4.9 step 3: "rebuilding hashes locally").
    pub fn append_foreign_block(&self, transactions: Vec<Transaction>, cancel: &CancelToken) -> Result<Block> {
        let _guard = self.write_lock.lock().expect("ledger mutex poisoned");
        let block_number = self.len();
        let previous_hash = self.last_block_hash()?;
        let mut block = Block::new_unmined(
            block_number,
            previous_hash,
            transactions,
            self.difficulty,
            chrono::Utc::now().timestamp(),
        );
        if !block.mine(cancel) {
            warn!(block_number, "resync merge mining cancelled before completion");
            return Err(FabricError::Transport("resync merge mining cancelled".into()));
        }
        let encoded = bincode::serialize(&block)?;
        self.tree.insert(key_for(block_number), encoded)?;
        self.tree.flush()?;
        Ok(block)
    }

    pub fn all_blocks(&self) -> Result<Vec<Block>> {
        let mut blocks = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            blocks.push(bincode::deserialize(&value)?);
        }
        Ok(blocks)
    }

    /// Blocks with `timestamp >= since`, in insertion (block_number) order.
    pub fn messages_since(&self, since: i64) -> Result<Vec<Block>> {
        Ok(self
            .all_blocks()?
            .into_iter()
            .filter(|b| b.timestamp >= since)
            .collect())
    }

    /// Runs full chain validation end-to-end; a failure means the ledger is
    /// corrupt and must be quarantined, not silently truncated.
    pub fn validate(&self) -> Result<()> {
        let blocks = self.all_blocks()?;
        block::validate_chain(&blocks).map_err(|reason| {
            let block_number = blocks.last().map(|b| b.block_number).unwrap_or(0);
            FabricError::LedgerCorruption {
                block_number,
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn sample_tx(clock: u64) -> Transaction {
        Transaction {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id: "alpha_1".to_string(),
            recipient_id: None,
            message_type: "CHAT".to_string(),
            content_sealed: crypto::SealedBlob {
                ciphertext: "ab".to_string(),
                iv: "cd".to_string(),
                tag: "ef".to_string(),
                algorithm: "AES-256-GCM".to_string(),
            },
            content_hash: hex::encode(crypto::sha256(format!("tx-{clock}").as_bytes())),
            signature: "00".to_string(),
            lamport_clock: clock,
        }
    }

    #[test]
    fn append_and_validate_round_trip() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ledger = Ledger::open(&db, "alpha_1", 2).unwrap();
        assert_eq!(ledger.len(), 1); // genesis
        ledger
            .append_message(sample_tx(1), &CancelToken::never())
            .unwrap();
        ledger
            .append_message(sample_tx(2), &CancelToken::never())
            .unwrap();
        assert_eq!(ledger.len(), 3);
        assert!(ledger.validate().is_ok());
    }

    #[test]
    fn messages_since_filters_by_timestamp() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ledger = Ledger::open(&db, "bravo_1", 2).unwrap();
        ledger
            .append_message(sample_tx(1), &CancelToken::never())
            .unwrap();
        let all = ledger.messages_since(0).unwrap();
        assert_eq!(all.len(), 2);
        let future = ledger.messages_since(i64::MAX).unwrap();
        assert!(future.is_empty());
    }
}
