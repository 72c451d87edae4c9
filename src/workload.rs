//! Workload Layer Interface
//!
//! The membership subsystem does not manage instances, images or device
//! drivers itself. After membership changes it calls into the workload layer
//! through this interface to initialize local resources, restart networks
//! and keep image replicas available.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::store::{NetworkInfo, StoragePoolInfo};

/// Hooks into the workload layer invoked around membership changes
#[async_trait]
pub trait WorkloadCoordinator: Send + Sync {
    /// (Re)start networks so cluster-dependent pieces initialize.
    async fn start_networks(&self) -> Result<()>;

    /// Stop networks when clustering is disabled on this node.
    async fn stop_networks(&self) -> Result<()>;

    /// Ensure image replicas survive a membership change.
    async fn sync_images(&self) -> Result<()>;

    /// Whether the named member no longer hosts instances or volumes.
    async fn member_is_drained(&self, name: &str) -> Result<bool>;

    /// Initialize a cluster-defined storage pool on the local node with the
    /// merged (global + member-specific) config.
    async fn init_storage_pool(
        &self,
        pool: &StoragePoolInfo,
        config: &HashMap<String, String>,
    ) -> Result<()>;

    /// Initialize a cluster-defined network on the local node with the
    /// merged (global + member-specific) config.
    async fn init_network(
        &self,
        network: &NetworkInfo,
        config: &HashMap<String, String>,
    ) -> Result<()>;

    /// Tear down a locally-initialized storage pool.
    async fn teardown_storage_pool(&self, name: &str) -> Result<()>;

    /// Tear down a locally-initialized network.
    async fn teardown_network(&self, name: &str) -> Result<()>;
}

/// Workload coordinator that does nothing. Used by nodes that run the
/// control plane without a workload layer, and by tests.
#[derive(Debug, Default)]
pub struct NullWorkload;

#[async_trait]
impl WorkloadCoordinator for NullWorkload {
    async fn start_networks(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_networks(&self) -> Result<()> {
        Ok(())
    }

    async fn sync_images(&self) -> Result<()> {
        Ok(())
    }

    async fn member_is_drained(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn init_storage_pool(
        &self,
        _pool: &StoragePoolInfo,
        _config: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    async fn init_network(
        &self,
        _network: &NetworkInfo,
        _config: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    async fn teardown_storage_pool(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn teardown_network(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}
