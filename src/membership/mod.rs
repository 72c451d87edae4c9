//! Membership Coordination
//!
//! The coordinator is the public facade of the membership subsystem. It
//! serializes mutating operations behind the membership mutex, redirects
//! leader-only requests to the leader, and wires the store, trust manager,
//! transport, workload layer and background tasks together.

mod bootstrap;
mod join;
mod remove;
mod roles;
mod rotate;

pub use join::{JoinPhase, JoinProgress, JoinRequest, MemberConfigEntry};
pub use remove::RemovalOutcome;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

use crate::config::CorralConfig;
use crate::error::{Error, Result};
use crate::heartbeat;
use crate::ops::OpsRegistry;
use crate::store::{
    ClusterRole, MemberConfigKey, MembershipDb, RaftRole, ReplicatedStore,
};
use crate::transport::PeerTransport;
use crate::trust::{JoinToken, TrustManager};
use crate::workload::WorkloadCoordinator;

/// Outcome of the leader check at the entry of a leader-only handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderCheck {
    /// The local node is the leader; handle the request here
    Local,
    /// Redirect the caller to the leader at this address
    Forward(String),
}

/// Cluster view returned by `GET /cluster`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub server_name: String,
    pub enabled: bool,
    pub member_config_keys: Vec<MemberConfigKey>,
}

/// A member as presented over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberView {
    pub name: String,
    pub address: String,
    pub description: String,
    pub role: RaftRole,
    pub roles: Vec<String>,
    pub failure_domain: Option<String>,
    pub architecture: String,
    pub status: String,
    pub leader: bool,
}

/// Editable fields of a member, accepted by PUT/PATCH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberUpdateRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub failure_domain: Option<String>,
}

/// Public facade over the membership subsystem
pub struct MembershipCoordinator {
    config: CorralConfig,
    db: RwLock<Arc<MembershipDb>>,
    raft: Arc<dyn ReplicatedStore>,
    transport: Arc<dyn PeerTransport>,
    trust: Arc<TrustManager>,
    workload: Arc<dyn WorkloadCoordinator>,
    ops: Arc<OpsRegistry>,

    // The address this node advertises for intra-cluster traffic. Updated
    // when a join request carries a different server address.
    local_address: RwLock<String>,

    // Serializes all mutating membership operations on the leader.
    membership_mutex: Mutex<()>,
    // Held by a self-removing node until its HTTP response has flushed, so
    // daemon replacement cannot kill the in-flight response.
    self_removal_mutex: Arc<Mutex<()>>,
    // Serializes local network creation.
    network_create_mutex: Mutex<()>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipCoordinator {
    pub fn new(
        config: CorralConfig,
        db: Arc<MembershipDb>,
        raft: Arc<dyn ReplicatedStore>,
        transport: Arc<dyn PeerTransport>,
        trust: Arc<TrustManager>,
        workload: Arc<dyn WorkloadCoordinator>,
        ops: Arc<OpsRegistry>,
    ) -> Arc<Self> {
        let local_address = config.cluster_address().to_string();
        Arc::new(Self {
            config,
            db: RwLock::new(db),
            raft,
            transport,
            trust,
            workload,
            ops,
            local_address: RwLock::new(local_address),
            membership_mutex: Mutex::new(()),
            self_removal_mutex: Arc::new(Mutex::new(())),
            network_create_mutex: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // Accessors used by the API layer and the background tasks.

    pub async fn db(&self) -> Arc<MembershipDb> {
        self.db.read().await.clone()
    }

    pub fn trust(&self) -> &Arc<TrustManager> {
        &self.trust
    }

    pub fn ops(&self) -> &Arc<OpsRegistry> {
        &self.ops
    }

    pub fn config(&self) -> &CorralConfig {
        &self.config
    }

    pub(crate) fn raft(&self) -> &Arc<dyn ReplicatedStore> {
        &self.raft
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub(crate) fn workload(&self) -> &Arc<dyn WorkloadCoordinator> {
        &self.workload
    }

    pub async fn local_address(&self) -> String {
        self.local_address.read().await.clone()
    }

    pub(crate) async fn set_local_address(&self, address: &str) {
        *self.local_address.write().await = address.to_string();
    }

    pub(crate) async fn set_db(&self, db: Arc<MembershipDb>) -> Result<()> {
        *self.db.write().await = db.clone();
        self.trust.attach_db(db).await
    }

    pub(crate) async fn lock_membership(&self) -> MutexGuard<'_, ()> {
        self.membership_mutex.lock().await
    }

    pub(crate) async fn lock_network_create(&self) -> MutexGuard<'_, ()> {
        self.network_create_mutex.lock().await
    }

    pub(crate) async fn lock_self_removal(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.self_removal_mutex).lock_owned().await
    }

    /// Signal that the daemon should be replaced once any in-flight
    /// self-removal response has gone out. The actual process restart is the
    /// init layer's job; waiting on the self-removal lock here guarantees we
    /// never announce it early.
    pub(crate) fn defer_daemon_replacement(&self) {
        let mutex = Arc::clone(&self.self_removal_mutex);
        tokio::spawn(async move {
            let _guard = mutex.lock().await;
            tracing::info!("ready for daemon replacement following removal from cluster");
        });
    }

    // Leadership

    /// Whether the local node currently leads the replicated store.
    pub async fn is_leader(&self) -> Result<bool> {
        let leader = self.raft.leader_address().await?;
        Ok(leader.as_deref() == Some(self.local_address().await.as_str()))
    }

    /// Leader check at the entry of a leader-only handler. There is exactly
    /// one place that can redirect: this one.
    pub async fn leader_check(&self) -> Result<LeaderCheck> {
        let local = self.local_address().await;
        match self.raft.leader_address().await? {
            Some(leader) if leader == local => Ok(LeaderCheck::Local),
            Some(leader) => Ok(LeaderCheck::Forward(leader)),
            None => Err(Error::NoLeader),
        }
    }

    /// Error out unless the local node is the leader.
    pub(crate) async fn ensure_leader(&self) -> Result<()> {
        match self.leader_check().await? {
            LeaderCheck::Local => Ok(()),
            LeaderCheck::Forward(leader) => Err(Error::NotLeader(leader)),
        }
    }

    // Cluster view

    /// `GET /cluster`
    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        let db = self.db().await;
        if !db.is_clustered().await? {
            return Ok(ClusterInfo {
                server_name: String::new(),
                enabled: false,
                member_config_keys: Vec::new(),
            });
        }

        let local = self.local_address().await;
        let server_name = db
            .get_member_by_address(&local)
            .await?
            .map(|member| member.name)
            .unwrap_or_default();

        Ok(ClusterInfo {
            server_name,
            enabled: true,
            member_config_keys: db.member_config_keys().await?,
        })
    }

    /// `GET /cluster/members`
    pub async fn list_member_views(&self) -> Result<Vec<MemberView>> {
        let db = self.db().await;
        let threshold = db.offline_threshold().await?;
        let members = db.list_members().await?;
        let raft_nodes = db.raft_nodes().await?;
        let leader = self.raft.leader_address().await?;

        let raft_roles: HashMap<&str, RaftRole> = raft_nodes
            .iter()
            .map(|node| (node.address.as_str(), node.role))
            .collect();

        Ok(members
            .into_iter()
            .map(|member| {
                let role = raft_roles
                    .get(member.address.as_str())
                    .copied()
                    .unwrap_or(RaftRole::Spare);
                let status = if member.is_offline(threshold) {
                    "offline"
                } else {
                    "online"
                };
                MemberView {
                    leader: leader.as_deref() == Some(member.address.as_str()),
                    role,
                    status: status.to_string(),
                    roles: member.roles.iter().map(|r| r.to_string()).collect(),
                    name: member.name,
                    address: member.address,
                    description: member.description,
                    failure_domain: member.failure_domain,
                    architecture: member.architecture,
                }
            })
            .collect())
    }

    /// `GET /cluster/members/{name}`
    pub async fn get_member_view(&self, name: &str) -> Result<MemberView> {
        self.list_member_views()
            .await?
            .into_iter()
            .find(|view| view.name == name)
            .ok_or_else(|| Error::MemberNotFound(name.to_string()))
    }

    /// ETag of the editable view of a member, for conditional updates.
    pub fn member_etag(view: &MemberView) -> String {
        let editable = serde_json::json!({
            "description": view.description,
            "roles": view.roles,
            "failure_domain": view.failure_domain,
        });
        hex::encode(Sha256::digest(editable.to_string().as_bytes()))
    }

    /// `PUT/PATCH /cluster/members/{name}`
    pub async fn update_member(
        &self,
        name: &str,
        request: &MemberUpdateRequest,
        etag: Option<&str>,
    ) -> Result<()> {
        let view = self.get_member_view(name).await?;
        if let Some(etag) = etag {
            let current = Self::member_etag(&view);
            if etag != current {
                return Err(Error::PreconditionFailed(
                    "member was modified by another client".into(),
                ));
            }
        }

        // The database role is managed by the role manager, never by PATCH.
        let has_database = view.roles.iter().any(|role| role == "database");
        let wants_database = request.roles.iter().any(|role| role == "database");
        if has_database && !wants_database {
            return Err(Error::BadRequest(
                "the \"database\" role cannot be dropped at this time".into(),
            ));
        }
        if !has_database && wants_database {
            return Err(Error::BadRequest(
                "the \"database\" role cannot be added at this time".into(),
            ));
        }

        let mut roles = Vec::new();
        for role in &request.roles {
            roles.push(ClusterRole::from_str(role).map_err(|_| {
                Error::BadRequest(format!("unknown cluster role {role:?}"))
            })?);
        }

        let db = self.db().await;
        let member = db
            .get_member_by_name(name)
            .await?
            .ok_or_else(|| Error::MemberNotFound(name.to_string()))?;
        db.update_member(
            member.id,
            &request.description,
            request.failure_domain.as_deref(),
        )
        .await?;
        db.update_roles(member.id, &roles).await?;

        tracing::info!(member = name, "updated cluster member");
        Ok(())
    }

    /// `POST /cluster/members/{name}` (rename)
    pub async fn rename_member(&self, old: &str, new: &str) -> Result<()> {
        if new.is_empty() || new.starts_with('@') {
            return Err(Error::BadRequest(format!("invalid member name {new:?}")));
        }
        self.db().await.rename_member(old, new).await?;
        tracing::info!(old_name = old, new_name = new, "renamed cluster member");
        Ok(())
    }

    /// `POST /cluster/members`: issue a join token for a new member. Leader
    /// only, so redemption finds the token in the leader's operation
    /// registry.
    pub async fn issue_join_token(&self, server_name: &str) -> Result<JoinToken> {
        let db = self.db().await;
        if !db.is_clustered().await? {
            return Err(Error::NotClustered);
        }
        if db.get_member_by_name(server_name).await?.is_some() {
            return Err(Error::NameExists(server_name.to_string()));
        }
        self.ensure_leader().await?;

        self.trust.issue_token(server_name).await
    }

    /// Redeem a join secret presented by a joining node. Proxied to the
    /// leader when it lands on a follower.
    pub async fn handle_redeem(
        &self,
        server_name: &str,
        secret: &str,
        cert_pem: &str,
    ) -> Result<()> {
        match self.leader_check().await? {
            LeaderCheck::Local => {
                let _guard = self.lock_membership().await;
                self.trust.redeem(server_name, secret, cert_pem).await?;
                Ok(())
            }
            LeaderCheck::Forward(leader) => {
                let client = self.transport.connect(&leader).await?;
                client.redeem_token(server_name, secret, cert_pem).await
            }
        }
    }

    /// Drop the trust entry of a failed joiner. Proxied to the leader when
    /// it lands on a follower.
    pub async fn handle_revoke_trust(&self, server_name: &str) -> Result<()> {
        if self.db().await.get_member_by_name(server_name).await?.is_some() {
            return Err(Error::BadRequest(format!(
                "{server_name:?} is a cluster member"
            )));
        }
        match self.leader_check().await? {
            LeaderCheck::Local => self.trust.remove_peer_cert_by_name(server_name).await,
            LeaderCheck::Forward(leader) => {
                let client = self.transport.connect(&leader).await?;
                client.revoke_trust(server_name).await
            }
        }
    }

    /// `DELETE /internal/cluster/raft-node/{address}`: low-level recovery
    /// helper that drops a stale raft node.
    pub async fn delete_raft_node(&self, address: &str) -> Result<()> {
        self.raft.leave(address).await?;

        let db = self.db().await;
        if let Err(err) = db.remove_raft_node(address).await {
            tracing::debug!(address, "raft node row already gone: {err}");
        }

        match self.rebalance().await {
            Ok(()) => {}
            Err(err) if err.is_leader_redirect() => {}
            Err(err) => {
                tracing::warn!("could not rebalance after raft node removal: {err}");
            }
        }
        Ok(())
    }

    // Background tasks

    /// Start the clustering tasks (heartbeat, leader rebalance tick).
    pub async fn start_cluster_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(heartbeat::spawn_heartbeat(Arc::clone(self)));
        tasks.push(heartbeat::spawn_rebalance_tick(Arc::clone(self)));
    }

    /// Stop the clustering tasks.
    pub async fn stop_cluster_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
