//! Peer Transport
//!
//! Authenticated RPC access to other cluster members. The HTTP/TLS plumbing
//! lives outside the core; the membership subsystem only sees these traits
//! and the wire DTOs. Implementations are expected to authenticate with the
//! cluster keypair and to apply the caller's request deadline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::store::{NetworkInfo, RaftNode, StoragePoolInfo};
use crate::trust::PeerCertificate;

/// Request body for the member-accept RPC handled by the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub name: String,
    pub address: String,
    pub schema_version: u64,
    pub api_extensions: u64,
    pub architecture: String,
    pub storage_pools: Vec<StoragePoolInfo>,
    pub networks: Vec<NetworkInfo>,
}

/// Response to a successful member-accept RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub raft_nodes: Vec<RaftNode>,
    pub private_key: String,
}

/// Cluster certificate replacement payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateUpdate {
    pub certificate: String,
    pub key: String,
}

/// Cluster-defined resources fetched by a joining node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterResources {
    pub storage_pools: Vec<StoragePoolInfo>,
    pub networks: Vec<NetworkInfo>,
}

/// Factory of authenticated RPC clients
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Connect to the member at `address`.
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerClient>>;

    /// Cheap liveness probe, used before declaring a peer offline.
    async fn probe(&self, address: &str) -> bool;
}

/// RPC surface of a single cluster member
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Redeem a join secret and register the caller's certificate.
    async fn redeem_token(&self, server_name: &str, secret: &str, cert_pem: &str) -> Result<()>;

    /// Drop the trust entry registered under `server_name` (join unwind).
    async fn revoke_trust(&self, server_name: &str) -> Result<()>;

    /// Fetch the cluster-defined storage pools and networks.
    async fn cluster_resources(&self) -> Result<ClusterResources>;

    /// Fetch the trusted peer certificates of the cluster.
    async fn trusted_certs(&self) -> Result<Vec<PeerCertificate>>;

    /// Ask the leader to accept a new member.
    async fn accept(&self, request: &AcceptRequest) -> Result<AcceptResponse>;

    /// Apply a declarative raft configuration on the target member.
    async fn assign(&self, nodes: &[RaftNode]) -> Result<()>;

    /// Trigger a role rebalance on the leader.
    async fn rebalance(&self) -> Result<()>;

    /// Ask the leader to take over the roles of the member at `address`.
    async fn handover(&self, address: &str) -> Result<()>;

    /// Remove a stale raft node row (recovery helper).
    async fn delete_raft_node(&self, address: &str) -> Result<()>;

    /// Forward a member removal to the leader.
    async fn remove_member(&self, name: &str, force: bool) -> Result<()>;

    /// Install a new cluster keypair on the target member.
    async fn update_certificate(&self, update: &CertificateUpdate) -> Result<()>;

    /// Tell a removed member to reset its database to standalone.
    async fn disable_clustering(&self) -> Result<()>;

    /// Delete a locally-created network on the target member.
    async fn delete_network(&self, name: &str) -> Result<()>;

    /// Delete a locally-created storage pool on the target member.
    async fn delete_storage_pool(&self, name: &str) -> Result<()>;
}
