//! Crate-level error taxonomy. Every fallible public API returns
//! `fabric::Result<T>`; each subsystem contributes one variant (or wraps its
//! own `thiserror` enum via `#[from]`) so callers match on one type.

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum FabricError {
    /// Signature verification failed or an AEAD tag mismatched.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// No P2P path within max_hops, or the centralized path was requested
    /// while the server is down.
    #[error("route unreachable: {0}")]
    RouteUnreachable(String),

    /// Chain validation failed on load; the ledger must be quarantined and
    /// rebuilt from peers, never silently truncated.
    #[error("ledger corruption at block {block_number}: {reason}")]
    LedgerCorruption { block_number: u64, reason: String },

    /// A received lamport clock was not ahead of ours and wasn't locally
    /// generated. Non-fatal: recovered by re-stamping.
    #[error("clock regression: received {received} <= self {self_clock}")]
    ClockRegression { self_clock: u64, received: u64 },

    /// Session read/write failed, or an outbound queue overflowed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A scenario request was a no-op given current state.
    #[error("scenario conflict: {0}")]
    ScenarioConflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),

    #[error("unknown node: {0}")]
    UnknownNode(String),
}

pub type Result<T> = std::result::Result<T, FabricError>;
