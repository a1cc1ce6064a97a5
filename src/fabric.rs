//! The runtime struct (C0, ambient) that owns every component for the
//! lifetime of the process. Constructed once in `main`, handed to every
//! spawned task as an `Arc<Fabric>` -- no global singletons.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::block::CancelToken;
use crate::error::Result;
use crate::frame::ServerFrame;
use crate::ledger::Ledger;
use crate::registry::Registry;

/// Recommended outbound-frame bound (§4.7): a client whose queue exceeds
/// this many pending frames gets its session closed.
pub const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

pub struct FabricConfig {
    pub data_dir: std::path::PathBuf,
    pub difficulty: u32,
    pub p2p_range: f64,
    pub max_hops: u32,
    pub demo_flood_hops: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            data_dir: std::path::PathBuf::from("./data"),
            difficulty: crate::block::DEFAULT_DIFFICULTY,
            p2p_range: crate::registry::DEFAULT_P2P_RANGE,
            max_hops: 5,
            demo_flood_hops: 3,
        }
    }
}

pub struct Fabric {
    pub registry: Registry,
    pub config: FabricConfig,
    db: sled::Db,
    ledgers: RwLock<HashMap<String, Arc<Ledger>>>,
    pub events: broadcast::Sender<ServerFrame>,
    pub cancel: CancelToken,
}

impl Fabric {
    pub fn new(config: FabricConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            crate::error::FabricError::Transport(format!("cannot create data dir: {e}"))
        })?;
        let db = sled::open(config.data_dir.join("ledger.sled"))?;
        let (events, _rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Ok(Self {
            registry: Registry::new(config.p2p_range),
            db,
            ledgers: RwLock::new(HashMap::new()),
            events,
            cancel: CancelToken::new(),
            config,
        })
    }

    pub async fn ledger_for(&self, node_id: &str) -> Result<Arc<Ledger>> {
        if let Some(ledger) = self.ledgers.read().await.get(node_id) {
            return Ok(ledger.clone());
        }
        let mut ledgers = self.ledgers.write().await;
        if let Some(ledger) = ledgers.get(node_id) {
            return Ok(ledger.clone());
        }
        let ledger = Arc::new(Ledger::open(&self.db, node_id, self.config.difficulty)?);
        ledgers.insert(node_id.to_string(), ledger.clone());
        Ok(ledger)
    }

    pub async fn all_ledger_node_ids(&self) -> Vec<String> {
        self.ledgers.read().await.keys().cloned().collect()
    }

    /// Best-effort broadcast: no subscribers is not an error.
    pub fn broadcast(&self, frame: ServerFrame) {
        let _ = self.events.send(frame);
    }
}
