//! Cluster Bootstrap
//!
//! Converts a standalone node into the founding voter of a new cluster.
//! Every step is unwound if a later one fails, so a failed bootstrap leaves
//! the node standalone.

use std::sync::Arc;

use crate::config::is_wildcard_address;
use crate::error::{Error, Result};
use crate::store::{RaftNode, RaftRole};
use crate::{API_EXTENSIONS, SCHEMA_VERSION};

use super::MembershipCoordinator;

impl MembershipCoordinator {
    /// `PUT /cluster {enabled: true}` without a target address: bootstrap a
    /// new cluster with this node as the founding voter.
    pub async fn bootstrap(self: &Arc<Self>, server_name: &str) -> Result<()> {
        let _guard = self.lock_membership().await;

        if server_name.is_empty() || server_name.starts_with('@') {
            return Err(Error::BadRequest(format!(
                "invalid server name {server_name:?}"
            )));
        }

        if self.db().await.is_clustered().await? {
            return Err(Error::AlreadyClustered);
        }

        // Without a dedicated cluster address, fall back to the core API
        // address. A wildcard bind address cannot be advertised to peers.
        let address = self.config().cluster_address().to_string();
        if is_wildcard_address(&address) {
            return Err(Error::Config(format!(
                "cannot use wildcard address {address:?} as cluster address; \
                 set node.cluster_address"
            )));
        }

        tracing::info!(server_name, address = %address, "bootstrapping cluster");

        let db = self.raft().cluster_db().await?;
        self.set_db(Arc::clone(&db)).await?;
        self.set_local_address(&address).await;
        db.local_set("core.https_address", &self.config().node.core_address)
            .await?;
        db.local_set("cluster.https_address", &address).await?;

        // Founding raft node and member row; id 1 marks the founder.
        db.create_first_raft_node(&address, server_name).await?;

        let member_id = match db
            .create_member(
                server_name,
                &address,
                SCHEMA_VERSION,
                API_EXTENSIONS,
                std::env::consts::ARCH,
            )
            .await
        {
            Ok(id) => id,
            Err(err) => {
                let _ = db.remove_raft_node(&address).await;
                return Err(err);
            }
        };

        if let Some(domain) = self.config().node.failure_domain.as_deref() {
            db.update_member(member_id, "", Some(domain)).await?;
        }

        let founder = RaftNode {
            id: 1,
            address: address.clone(),
            role: RaftRole::Voter,
            name: server_name.to_string(),
        };
        if let Err(err) = self.raft().assign(&[founder]).await {
            let _ = db.delete_member(member_id).await;
            return Err(err);
        }

        self.start_cluster_tasks().await;

        // Restart networks so cluster-dependent pieces initialize.
        if let Err(err) = self.workload().start_networks().await {
            self.stop_cluster_tasks().await;
            let _ = db.delete_member(member_id).await;
            return Err(err);
        }

        tracing::info!(server_name, "cluster bootstrapped");
        Ok(())
    }
}
