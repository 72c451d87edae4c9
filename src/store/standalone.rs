//! Single-Node Replicated Store
//!
//! A `ReplicatedStore` for a node running without an external consensus
//! layer: the local node is the only possible leader and the raft
//! configuration is at most itself. Multi-node deployments plug a real raft
//! integration in instead; this keeps a standalone daemon and the bootstrap
//! path fully functional.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{MembershipDb, RaftNode, ReplicatedStore};
use crate::error::{Error, Result};

pub struct StandaloneStore {
    local_address: String,
    db: Arc<MembershipDb>,
    engaged: RwLock<bool>,
}

impl StandaloneStore {
    pub fn new(local_address: &str, db: Arc<MembershipDb>) -> Self {
        Self {
            local_address: local_address.to_string(),
            db,
            engaged: RwLock::new(false),
        }
    }
}

#[async_trait]
impl ReplicatedStore for StandaloneStore {
    async fn leader_address(&self) -> Result<Option<String>> {
        if *self.engaged.read().await {
            Ok(Some(self.local_address.clone()))
        } else {
            Ok(None)
        }
    }

    async fn wait_leadership(&self) -> Result<()> {
        if *self.engaged.read().await {
            Ok(())
        } else {
            Err(Error::NoLeader)
        }
    }

    async fn transfer_leadership(&self) -> Result<()> {
        Err(Error::Store(
            "a single-node store cannot transfer leadership".into(),
        ))
    }

    async fn leave(&self, address: &str) -> Result<()> {
        if address == self.local_address {
            *self.engaged.write().await = false;
        }
        Ok(())
    }

    async fn demote_offline(&self, _id: u64) -> Result<()> {
        Ok(())
    }

    async fn assign(&self, nodes: &[RaftNode]) -> Result<()> {
        let participates = nodes
            .iter()
            .any(|node| node.address == self.local_address);
        *self.engaged.write().await = participates;
        Ok(())
    }

    async fn reset_standalone(&self) -> Result<()> {
        *self.engaged.write().await = false;
        Ok(())
    }

    async fn cluster_db(&self) -> Result<Arc<MembershipDb>> {
        Ok(Arc::clone(&self.db))
    }
}
