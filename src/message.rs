//! Pre-chain message shape (§3): what the router builds before a send is
//! sealed into a `block::Transaction` and appended to the ledger.

use serde::{Deserialize, Serialize};

use crate::block::Transaction;
use crate::clock::VectorClock;
use crate::crypto::{self, SealedBlob};
use crate::frame::MessageType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub message_type: MessageType,
    pub content: String,
    pub timestamp: i64,
    pub lamport_clock: u64,
    pub vector_clock: VectorClock,
    pub sealed_payload: SealedBlob,
    pub signature: String,
    pub hop_count: u32,
    pub max_hops: u32,
    pub route_path: Vec<String>,
}

impl Message {
    /// Reduces the message to the block transaction form the ledger hashes.
    /// `content_hash` is taken over the plaintext so duplicate detection in
    /// C9 has a stable key independent of AES-GCM's random per-seal IV.
    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            message_id: self.message_id.clone(),
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            message_type: format!("{:?}", self.message_type),
            content_sealed: self.sealed_payload.clone(),
            content_hash: hex::encode(crypto::sha256(self.content.as_bytes())),
            signature: self.signature.clone(),
            lamport_clock: self.lamport_clock,
        }
    }
}

/// Outcome of a routing attempt, surfaced to the session hub.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Delivered(Message),
    Deferred { sender_id: String, message_id: String },
}
