//! Member Removal
//!
//! Removes a member from the cluster, gracefully or by force. A member that
//! removes itself while not leader forwards the request to the leader and
//! holds the self-removal lock until its HTTP response has flushed, so the
//! daemon is not replaced underneath an in-flight response.

use tokio::sync::OwnedMutexGuard;

use crate::error::{Error, Result};
use crate::store::RaftRole;

use super::{LeaderCheck, MembershipCoordinator};

/// How a removal request was resolved
pub enum RemovalOutcome {
    /// The member was removed by this (leader) node
    Removed,
    /// The local node removed itself; clustering was disabled locally
    SelfRemoved,
    /// The request was forwarded to the leader. When the target was the
    /// local node the self-removal guard is carried here; the caller holds
    /// it until its response has flushed.
    Forwarded(Option<OwnedMutexGuard<()>>),
}

impl MembershipCoordinator {
    /// `DELETE /cluster/members/{name}`
    pub async fn remove_member(&self, name: &str, force: bool) -> Result<RemovalOutcome> {
        let db = self.db().await;
        if !db.is_clustered().await? {
            return Err(Error::NotClustered);
        }

        let local_address = self.local_address().await;
        let removing_self = db
            .get_member_by_name(name)
            .await?
            .ok_or_else(|| Error::MemberNotFound(name.to_string()))?
            .address
            == local_address;

        match self.leader_check().await? {
            LeaderCheck::Forward(leader) => {
                // Take the self-removal lock before forwarding, so the
                // leader's disable call back to us cannot replace the daemon
                // until our response has gone out.
                let guard = if removing_self {
                    tracing::info!(member = name, "acquired cluster self removal lock");
                    Some(self.lock_self_removal().await)
                } else {
                    None
                };

                tracing::debug!(leader = %leader, member = name, "forwarding member removal");
                let removing_leader = db
                    .get_member_by_address(&leader)
                    .await?
                    .map(|info| info.name == name)
                    .unwrap_or(false);
                let raft_count = db.raft_nodes().await?.len();

                let client = self.transport().connect(&leader).await?;
                client.remove_member(name, force).await?;

                // If only the two of us were left, the removed leader left a
                // vacancy that falls to this node.
                if removing_leader && raft_count == 2 {
                    self.raft().wait_leadership().await?;
                    self.trust().rebuild_cache().await?;
                }

                Ok(RemovalOutcome::Forwarded(guard))
            }
            LeaderCheck::Local => self.remove_member_as_leader(name, force).await,
        }
    }

    /// Leader-side removal.
    async fn remove_member_as_leader(&self, name: &str, force: bool) -> Result<RemovalOutcome> {
        let _guard = self.lock_membership().await;

        let db = self.db().await;
        let local_address = self.local_address().await;
        let member = db
            .get_member_by_name(name)
            .await?
            .ok_or_else(|| Error::MemberNotFound(name.to_string()))?;
        let raft_nodes = db.raft_nodes().await?;

        // Removing the leader of a 2-member cluster: make sure the other
        // member can take over first.
        if member.address == local_address && raft_nodes.len() == 2 {
            if let Some(other) = raft_nodes
                .iter()
                .find(|node| node.address != local_address && node.role == RaftRole::StandBy)
            {
                let address = other.address.clone();
                tracing::info!(candidate = %address, "promoting remaining member before removal");
                self.apply_assign(&address, RaftRole::Voter).await?;
            }
        }

        tracing::info!(member = name, force, "deleting member from cluster");

        match self.workload().sync_images().await {
            Ok(()) => {}
            Err(err) if force => tracing::warn!("failed to sync images: {err}"),
            Err(err) => return Err(Error::Internal(format!("failed to sync images: {err}"))),
        }

        if !force && !self.workload().member_is_drained(name).await? {
            return Err(Error::BadRequest(format!(
                "member {name:?} still hosts instances or volumes"
            )));
        }

        // Drop the member from the raft configuration before touching rows.
        self.raft().leave(&member.address).await?;

        if !force && member.address != local_address {
            // Gracefully delete the member's local networks and pools.
            let client = self.transport().connect(&member.address).await?;
            for network in db.list_networks().await? {
                client.delete_network(&network.name).await?;
            }
            for pool in db.list_storage_pools().await? {
                client.delete_storage_pool(&pool.name).await?;
            }
        }

        db.delete_member(member.id).await?;
        self.trust().remove_peer_cert_by_name(name).await?;

        if let Err(err) = self.rebalance_locked().await {
            tracing::warn!("failed to rebalance roles after removal: {err}");
        }

        if member.address == local_address {
            // The leader removed itself: disable clustering locally.
            self.disable_locked().await?;
            return Ok(RemovalOutcome::SelfRemoved);
        }

        if !force {
            // Ask the removed member to reset its database to standalone.
            let client = self.transport().connect(&member.address).await?;
            client.disable_clustering().await?;
        }

        if let Err(err) = self.workload().sync_images().await {
            tracing::warn!("failed to sync images after removal: {err}");
        }

        Ok(RemovalOutcome::Removed)
    }

    /// `PUT /cluster {enabled: false}`: disable clustering on this node.
    pub async fn disable_clustering(&self) -> Result<()> {
        let db = self.db().await;
        if !db.is_clustered().await? {
            return Err(Error::NotClustered);
        }
        self.disable_locked().await
    }

    /// Reset the local node to standalone operation. Daemon replacement is
    /// deferred behind the self-removal lock, so an in-flight response of a
    /// forwarding self-removal is never cut short.
    pub(crate) async fn disable_locked(&self) -> Result<()> {
        let local_address = self.local_address().await;
        tracing::info!(address = %local_address, "disabling clustering");

        self.stop_cluster_tasks().await;
        self.trust().remove_cluster_files().await?;
        self.raft().reset_standalone().await?;

        // Detach from the replicated database and start over standalone.
        let fresh = crate::store::MembershipDb::open_ephemeral()?;
        self.set_db(std::sync::Arc::new(fresh)).await?;

        if let Err(err) = self.workload().stop_networks().await {
            tracing::warn!("failed to stop networks while disabling clustering: {err}");
        }

        self.defer_daemon_replacement();
        Ok(())
    }
}
