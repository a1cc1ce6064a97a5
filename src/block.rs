//! Block and chain (C2): building, mining, hash-linking, and validating
//! the blocks that make up a node's local ledger.
//!
//! Canonical serialization sorts fields lexicographically by name and
//! renders all binary as lowercase hex; `block_hash` itself is excluded
//! from the hashed form. We get this for free by hashing a `serde_json`
//! value built with a `BTreeMap`-backed object, which serializes keys in
//! sorted order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{self, Hash};

/// Default mining difficulty; the chain is a local integrity device, not a
/// consensus mechanism, so this is kept low (2-4).
pub const DEFAULT_DIFFICULTY: u32 = 3;

fn zero_hash_hex() -> String {
    hex::encode([0u8; 32])
}

/// A single transaction embedded in a block: the canonical form of a
/// pre-chain message, reduced to what the ledger must hash and replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub message_type: String,
    pub content_sealed: crypto::SealedBlob,
    /// Hex SHA-256 of the plaintext content, carried alongside the sealed
    /// payload so duplicate detection (§4.9) has a stable key to compare:
    /// AES-GCM's random per-seal IV makes `content_sealed.ciphertext` differ
    /// across identical plaintexts, so the ciphertext itself can't serve
    /// that role.
    pub content_hash: String,
    pub signature: String,
    pub lamport_clock: u64,
}

impl Transaction {
    /// Canonical serialization: keys sorted (via BTreeMap), used both for
    /// merkle leaf hashing and block-hash input.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut map = BTreeMap::new();
        map.insert("message_id", serde_json::json!(self.message_id));
        map.insert("sender_id", serde_json::json!(self.sender_id));
        map.insert("recipient_id", serde_json::json!(self.recipient_id));
        map.insert("message_type", serde_json::json!(self.message_type));
        map.insert(
            "content_sealed",
            serde_json::json!({
                "ciphertext": self.content_sealed.ciphertext,
                "iv": self.content_sealed.iv,
                "tag": self.content_sealed.tag,
                "algorithm": self.content_sealed.algorithm,
            }),
        );
        map.insert("content_hash", serde_json::json!(self.content_hash));
        map.insert("signature", serde_json::json!(self.signature));
        map.insert("lamport_clock", serde_json::json!(self.lamport_clock));
        serde_json::to_vec(&map).expect("BTreeMap of json values always serializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub block_number: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: i64,
    pub nonce: u64,
    pub difficulty: u32,
    pub block_hash: String,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Builds an unmined block (nonce=0, block_hash empty) ready for `mine`.
    pub fn new_unmined(
        block_number: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
        timestamp: i64,
    ) -> Self {
        let leaves: Vec<Vec<u8>> = transactions.iter().map(|t| t.canonical_bytes()).collect();
        let merkle_root = hex::encode(crypto::merkle_root(&leaves));
        Self {
            block_number,
            previous_hash,
            merkle_root,
            timestamp,
            nonce: 0,
            difficulty,
            block_hash: String::new(),
            transactions,
        }
    }

    /// Canonical serialization of every field except `block_hash`.
    fn hashable_bytes(&self) -> Vec<u8> {
        let mut map = BTreeMap::new();
        map.insert("block_number", serde_json::json!(self.block_number));
        map.insert("previous_hash", serde_json::json!(self.previous_hash));
        map.insert("merkle_root", serde_json::json!(self.merkle_root));
        map.insert("timestamp", serde_json::json!(self.timestamp));
        map.insert("nonce", serde_json::json!(self.nonce));
        map.insert("difficulty", serde_json::json!(self.difficulty));
        serde_json::to_vec(&map).expect("BTreeMap of json values always serializes")
    }

    fn compute_hash(&self) -> Hash {
        crypto::sha256(&self.hashable_bytes())
    }

    fn has_leading_zero_hex(hash_hex: &str, difficulty: u32) -> bool {
        hash_hex
            .as_bytes()
            .iter()
            .take(difficulty as usize)
            .all(|&b| b == b'0')
    }

    /// Genesis block: block_number 0, previous_hash all-zero, no transactions.
    pub fn genesis(difficulty: u32, timestamp: i64) -> Self {
        let mut block = Self::new_unmined(0, zero_hash_hex(), Vec::new(), difficulty, timestamp);
        block.mine(&CancelToken::never());
        block
    }

    /// Proof-of-work: increments `nonce` until the hash has `difficulty`
    /// leading zero hex characters. Checks `cancel` at least every 10^5
    /// iterations so shutdown can abort an in-progress mine.
    pub fn mine(&mut self, cancel: &CancelToken) -> bool {
        let target_hex_zeros = self.difficulty;
        loop {
            let hash = self.compute_hash();
            let hash_hex = hex::encode(hash);
            if Self::has_leading_zero_hex(&hash_hex, target_hex_zeros) {
                self.block_hash = hash_hex;
                return true;
            }
            self.nonce += 1;
            if self.nonce % 100_000 == 0 {
                debug!(nonce = self.nonce, block = self.block_number, "mining in progress");
                if cancel.is_cancelled() {
                    return false;
                }
            }
        }
    }

    /// Recomputes the canonical hash, requires it to equal `block_hash`,
    /// requires the leading-zero proof-of-work property, and recomputes the
    /// Merkle root over the embedded transactions.
    pub fn validate(&self) -> Result<(), String> {
        let recomputed = hex::encode(self.compute_hash());
        if recomputed != self.block_hash {
            return Err(format!(
                "block_hash mismatch: stored {} recomputed {}",
                self.block_hash, recomputed
            ));
        }
        if !Self::has_leading_zero_hex(&self.block_hash, self.difficulty) {
            return Err(format!(
                "block_hash {} lacks {} leading zero hex chars",
                self.block_hash, self.difficulty
            ));
        }
        let leaves: Vec<Vec<u8>> = self.transactions.iter().map(|t| t.canonical_bytes()).collect();
        let recomputed_root = hex::encode(crypto::merkle_root(&leaves));
        if recomputed_root != self.merkle_root {
            return Err(format!(
                "merkle_root mismatch: stored {} recomputed {}",
                self.merkle_root, recomputed_root
            ));
        }
        Ok(())
    }
}

/// Validates hash-linkage across an entire chain: each block's
/// `previous_hash` must equal the prior block's `block_hash`, and
/// `block_number` must increment by exactly one. Genesis must sit at index 0
/// with an all-zero `previous_hash`.
pub fn validate_chain(blocks: &[Block]) -> Result<(), String> {
    if blocks.is_empty() {
        return Ok(());
    }
    let genesis = &blocks[0];
    if genesis.block_number != 0 {
        return Err("genesis block_number must be 0".into());
    }
    if genesis.previous_hash != zero_hash_hex() {
        return Err("genesis previous_hash must be all-zero".into());
    }
    genesis.validate()?;

    for pair in blocks.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if cur.previous_hash != prev.block_hash {
            return Err(format!(
                "block {} previous_hash does not match block {}'s hash",
                cur.block_number, prev.block_number
            ));
        }
        if cur.block_number != prev.block_number + 1 {
            return Err(format!(
                "block_number {} is not the successor of {}",
                cur.block_number, prev.block_number
            ));
        }
        cur.validate()?;
    }
    Ok(())
}

/// A cheap cooperative-cancellation flag mining checks periodically, shared
/// with the process shutdown signal.
#[derive(Clone, Default)]
pub struct CancelToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }

    pub fn never() -> Self {
        Self::new()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(id: &str, clock: u64) -> Transaction {
        Transaction {
            message_id: id.to_string(),
            sender_id: "alpha_1".to_string(),
            recipient_id: None,
            message_type: "CHAT".to_string(),
            content_sealed: crypto::SealedBlob {
                ciphertext: "ab".to_string(),
                iv: "cd".to_string(),
                tag: "ef".to_string(),
                algorithm: "AES-256-GCM".to_string(),
            },
            content_hash: hex::encode(crypto::sha256(id.as_bytes())),
            signature: "00".to_string(),
            lamport_clock: clock,
        }
    }

    #[test]
    fn mined_block_has_leading_zeros() {
        let mut block = Block::new_unmined(0, zero_hash_hex(), vec![sample_tx("m1", 1)], 2, 1000);
        assert!(block.mine(&CancelToken::never()));
        assert!(block.block_hash.starts_with("00"));
        assert!(block.validate().is_ok());
    }

    #[test]
    fn tampering_transaction_breaks_merkle_check() {
        let mut block = Block::new_unmined(0, zero_hash_hex(), vec![sample_tx("m1", 1)], 2, 1000);
        block.mine(&CancelToken::never());
        block.transactions[0].signature = "ff".to_string();
        assert!(block.validate().is_err());
    }

    #[test]
    fn chain_validation_detects_broken_link() {
        let mut genesis = Block::genesis(2, 1000);
        let mut second =
            Block::new_unmined(1, genesis.block_hash.clone(), vec![sample_tx("m2", 2)], 2, 1001);
        second.mine(&CancelToken::never());
        let mut tampered_middle = second.clone();
        tampered_middle.previous_hash = zero_hash_hex();
        genesis.nonce = genesis.nonce; // keep genesis untouched
        let chain = vec![genesis, tampered_middle];
        assert!(validate_chain(&chain).is_err());
    }
}
