//! Cluster Join
//!
//! Adds a node to an existing cluster: trust establishment through a join
//! token, configuration reconciliation of cluster-defined storage pools and
//! networks, the accept request against the leader, joining the raft
//! configuration and installing the cluster keypair.
//!
//! Each forward edge of the join writes a durable marker to disk, so a
//! crashed join can be resumed by re-posting the same request. Before the
//! raft join the node can be reverted to standalone; after it, failures are
//! surfaced and recovery goes through member removal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::is_wildcard_address;
use crate::error::{Error, Result};
use crate::store::{
    NetworkInfo, RaftRole, ResourceState, StoragePoolInfo, NETWORK_MEMBER_KEYS,
    STORAGE_POOL_MEMBER_KEYS,
};
use crate::transport::{AcceptRequest, AcceptResponse};
use crate::trust::{cert_fingerprint, JoinToken};
use crate::{API_EXTENSIONS, SCHEMA_VERSION};

use super::{LeaderCheck, MembershipCoordinator};

/// Phases of the joiner state machine, in order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JoinPhase {
    Idle,
    TrustSet,
    SchemaChecked,
    ConfigReconciled,
    RaftJoined,
    CertInstalled,
    NetworksStarted,
    ClusterRebalanced,
    Ready,
}

/// Durable marker of an in-flight join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinProgress {
    pub phase: JoinPhase,
    pub server_name: String,
    pub cluster_address: String,
}

impl JoinProgress {
    fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("join_progress.json")
    }

    /// Load the marker of a previously interrupted join, if any.
    pub fn load(data_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(data_dir);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Persist the marker.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(data_dir), raw)?;
        Ok(())
    }

    /// Remove the marker once the join has completed.
    pub fn clear(data_dir: &Path) -> Result<()> {
        let path = Self::path(data_dir);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// A member-specific config override supplied by the operator for one
/// cluster-defined pool or network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfigEntry {
    pub entity: String,
    pub name: String,
    pub key: String,
    pub value: String,
}

/// `PUT /cluster` join request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub server_name: String,
    /// Address of a member of the target cluster; optional when the join
    /// token carries addresses.
    #[serde(default)]
    pub cluster_address: String,
    pub cluster_certificate: String,
    #[serde(default)]
    pub join_token: Option<String>,
    #[serde(default)]
    pub cluster_password: Option<String>,
    pub server_address: String,
    #[serde(default)]
    pub member_config: Vec<MemberConfigEntry>,
}

/// Merge operator overrides into a resource's global config, restricted to
/// the member-specific keys of the entity. Unknown keys are ignored with a
/// warning, like any other invalid operator input at join time.
fn merge_overrides(
    global: &HashMap<String, String>,
    overrides: &[MemberConfigEntry],
    entity: &str,
    name: &str,
    allowed_keys: &[&str],
) -> HashMap<String, String> {
    let mut merged = global.clone();
    merged.retain(|key, _| !key.starts_with("volatile."));

    for entry in overrides {
        if entry.entity != entity || entry.name != name {
            continue;
        }
        if !allowed_keys.contains(&entry.key.as_str()) {
            tracing::warn!(
                entity,
                name,
                key = %entry.key,
                "ignoring config key that is not member-specific"
            );
            continue;
        }
        merged.insert(entry.key.clone(), entry.value.clone());
    }

    merged
}

/// Compare two config maps, ignoring `exclude`d and volatile keys. Returns
/// the offending key on divergence.
fn compare_configs(
    cluster: &HashMap<String, String>,
    joiner: &HashMap<String, String>,
    exclude: &[&str],
) -> std::result::Result<(), String> {
    let relevant = |key: &str| !exclude.contains(&key) && !key.starts_with("volatile.");

    for (key, value) in cluster {
        if !relevant(key) {
            continue;
        }
        match joiner.get(key) {
            Some(other) if other == value => {}
            _ => return Err(key.clone()),
        }
    }
    for key in joiner.keys() {
        if relevant(key) && !cluster.contains_key(key) {
            return Err(key.clone());
        }
    }
    Ok(())
}

impl MembershipCoordinator {
    /// `PUT /cluster` with a target address: join an existing cluster.
    pub async fn join(self: &Arc<Self>, request: JoinRequest) -> Result<()> {
        if self.db().await.is_clustered().await? {
            return Err(Error::AlreadyClustered);
        }
        if request.cluster_certificate.is_empty() {
            return Err(Error::BadRequest(
                "no target cluster member certificate provided".into(),
            ));
        }
        if request.server_address.is_empty() {
            return Err(Error::BadRequest(
                "no server address provided for this member".into(),
            ));
        }
        if is_wildcard_address(&request.server_address) {
            return Err(Error::Config(format!(
                "cannot use wildcard address {:?} as cluster address",
                request.server_address
            )));
        }

        let data_dir = self.config().data_dir().clone();
        let mut progress = match JoinProgress::load(&data_dir)? {
            Some(progress) if progress.server_name == request.server_name => {
                tracing::info!(
                    phase = ?progress.phase,
                    "resuming interrupted cluster join"
                );
                progress
            }
            _ => JoinProgress {
                phase: JoinPhase::Idle,
                server_name: request.server_name.clone(),
                cluster_address: String::new(),
            },
        };

        // Resolve the join secret and the target member to talk to.
        let (secret, mut target) = match &request.join_token {
            Some(raw) => {
                let token = JoinToken::decode(raw)?;
                if token.server_name != request.server_name {
                    return Err(Error::TokenInvalid);
                }
                let presented = cert_fingerprint(&request.cluster_certificate)?;
                if presented != token.fingerprint {
                    return Err(Error::TokenInvalid);
                }

                let mut target = request.cluster_address.clone();
                if target.is_empty() {
                    for address in &token.addresses {
                        if self.transport().probe(address).await {
                            target = address.clone();
                            break;
                        }
                    }
                }
                if target.is_empty() {
                    return Err(Error::NoLeader);
                }
                (token.secret, target)
            }
            None => {
                let password = request
                    .cluster_password
                    .clone()
                    .filter(|password| !password.is_empty())
                    .ok_or_else(|| {
                        Error::BadRequest("no join token or cluster password provided".into())
                    })?;
                if request.cluster_address.is_empty() {
                    return Err(Error::BadRequest(
                        "no target cluster address provided".into(),
                    ));
                }
                (password, request.cluster_address.clone())
            }
        };
        if !progress.cluster_address.is_empty() {
            target = progress.cluster_address.clone();
        }
        progress.cluster_address = target.clone();

        tracing::info!(
            server_name = %request.server_name,
            target = %target,
            "joining cluster"
        );

        self.set_local_address(&request.server_address).await;
        {
            let db = self.db().await;
            db.local_set("core.https_address", &self.config().node.core_address)
                .await?;
            db.local_set("cluster.https_address", &request.server_address)
                .await?;
        }

        let client = self.transport().connect(&target).await?;

        // Trust establishment: redeem the token, presenting our server
        // certificate so the cluster can associate it with our name.
        let fresh_trust = progress.phase < JoinPhase::TrustSet;
        if fresh_trust {
            let server_cert = self.trust().read_server_cert()?;
            client
                .redeem_token(&request.server_name, &secret, &server_cert)
                .await?;
            progress.phase = JoinPhase::TrustSet;
            progress.save(&data_dir)?;
        }

        // Fetch the cluster-defined resources for reconciliation.
        let resources = match client.cluster_resources().await {
            Ok(resources) => resources,
            Err(err) => {
                self.abort_join(&*client, &request.server_name, fresh_trust, &data_dir)
                    .await;
                return Err(err);
            }
        };
        if progress.phase < JoinPhase::SchemaChecked {
            progress.phase = JoinPhase::SchemaChecked;
            progress.save(&data_dir)?;
        }

        // Reconcile cluster-defined pools and networks locally, applying the
        // operator's member-specific overrides.
        let mut pools = Vec::new();
        for pool in &resources.storage_pools {
            if pool.state != ResourceState::Created {
                continue;
            }
            let config = merge_overrides(
                &pool.config,
                &request.member_config,
                "storage-pool",
                &pool.name,
                STORAGE_POOL_MEMBER_KEYS,
            );
            pools.push(StoragePoolInfo {
                config,
                ..pool.clone()
            });
        }

        let mut networks = Vec::new();
        for network in &resources.networks {
            if network.state != ResourceState::Created {
                continue;
            }
            let config = merge_overrides(
                &network.config,
                &request.member_config,
                "network",
                &network.name,
                NETWORK_MEMBER_KEYS,
            );
            networks.push(NetworkInfo {
                config,
                ..network.clone()
            });
        }

        if progress.phase < JoinPhase::ConfigReconciled {
            if let Err(err) = self.init_local_resources(&pools, &networks).await {
                // Still standalone: unwind the local half and the trust we
                // just established.
                self.teardown_local_resources(&pools, &networks).await;
                self.abort_join(&*client, &request.server_name, fresh_trust, &data_dir)
                    .await;
                return Err(err);
            }
            progress.phase = JoinPhase::ConfigReconciled;
            progress.save(&data_dir)?;
        }

        // Ask the leader to accept us. Schema and config compatibility are
        // validated there.
        let accept = AcceptRequest {
            name: request.server_name.clone(),
            address: request.server_address.clone(),
            schema_version: SCHEMA_VERSION,
            api_extensions: API_EXTENSIONS,
            architecture: std::env::consts::ARCH.to_string(),
            storage_pools: pools.clone(),
            networks: networks.clone(),
        };
        let accepted: AcceptResponse = match client.accept(&accept).await {
            Ok(accepted) => accepted,
            Err(err) => {
                self.teardown_local_resources(&pools, &networks).await;
                self.abort_join(&*client, &request.server_name, fresh_trust, &data_dir)
                    .await;
                return Err(err);
            }
        };

        // Join the raft configuration and switch onto the replicated
        // database. From here on failures are surfaced, not rolled back.
        if progress.phase < JoinPhase::RaftJoined {
            self.raft().assign(&accepted.raft_nodes).await?;
            progress.phase = JoinPhase::RaftJoined;
            progress.save(&data_dir)?;
        }
        self.set_db(self.raft().cluster_db().await?).await?;

        if progress.phase < JoinPhase::CertInstalled {
            self.trust()
                .write_cluster_keypair(&request.cluster_certificate, &accepted.private_key)
                .await?;
            progress.phase = JoinPhase::CertInstalled;
            progress.save(&data_dir)?;
        }

        if progress.phase < JoinPhase::NetworksStarted {
            self.workload().start_networks().await?;
            progress.phase = JoinPhase::NetworksStarted;
            progress.save(&data_dir)?;
        }
        self.start_cluster_tasks().await;
        self.db()
            .await
            .set_heartbeat(&request.server_address, chrono::Utc::now())
            .await?;

        // Let the leader rebalance roles now that we are in. The periodic
        // tick covers a failure here.
        if progress.phase < JoinPhase::ClusterRebalanced {
            if let Err(err) = client.rebalance().await {
                tracing::warn!("failed to trigger cluster rebalance: {err}");
            }
            progress.phase = JoinPhase::ClusterRebalanced;
            progress.save(&data_dir)?;
        }

        if let Err(err) = self.workload().sync_images().await {
            tracing::warn!("failed to sync images after join: {err}");
        }

        JoinProgress::clear(&data_dir)?;
        tracing::info!(server_name = %request.server_name, "joined cluster");
        Ok(())
    }

    /// Unwind a join that failed before reaching the raft configuration.
    /// Trust established during this attempt is revoked and the durable
    /// marker cleared; the operator retries with a fresh token.
    async fn abort_join(
        &self,
        client: &dyn crate::transport::PeerClient,
        server_name: &str,
        fresh_trust: bool,
        data_dir: &Path,
    ) {
        if fresh_trust {
            if let Err(err) = client.revoke_trust(server_name).await {
                tracing::warn!("failed to revoke trust after aborted join: {err}");
            }
        }
        if let Err(err) = JoinProgress::clear(data_dir) {
            tracing::warn!("failed to clear join marker: {err}");
        }
    }

    async fn init_local_resources(
        &self,
        pools: &[StoragePoolInfo],
        networks: &[NetworkInfo],
    ) -> Result<()> {
        for pool in pools {
            tracing::debug!(pool = %pool.name, "initializing storage pool for join");
            self.workload().init_storage_pool(pool, &pool.config).await?;
        }

        let _guard = self.lock_network_create().await;
        for network in networks {
            tracing::debug!(network = %network.name, "initializing network for join");
            self.workload().init_network(network, &network.config).await?;
        }
        Ok(())
    }

    async fn teardown_local_resources(
        &self,
        pools: &[StoragePoolInfo],
        networks: &[NetworkInfo],
    ) {
        for network in networks {
            if let Err(err) = self.workload().teardown_network(&network.name).await {
                tracing::warn!(network = %network.name, "failed to tear down network: {err}");
            }
        }
        for pool in pools {
            if let Err(err) = self.workload().teardown_storage_pool(&pool.name).await {
                tracing::warn!(pool = %pool.name, "failed to tear down storage pool: {err}");
            }
        }
    }

    /// `POST /internal/cluster/accept`: leader-side admission of a new
    /// member.
    pub async fn accept_member(&self, request: &AcceptRequest) -> Result<AcceptResponse> {
        if request.name.is_empty() {
            return Err(Error::BadRequest("no name provided".into()));
        }

        match self.leader_check().await? {
            LeaderCheck::Local => {}
            LeaderCheck::Forward(leader) => return Err(Error::NotLeader(leader)),
        }

        let _guard = self.lock_membership().await;
        let db = self.db().await;

        if db.get_member_by_name(&request.name).await?.is_some() {
            return Err(Error::NameExists(request.name.clone()));
        }
        if db.get_member_by_address(&request.address).await?.is_some() {
            return Err(Error::AddressExists(request.address.clone()));
        }

        // The joiner must be at least at the cluster's schema level.
        let members = db.list_members().await?;
        let cluster_schema = members
            .iter()
            .map(|member| member.schema_version)
            .max()
            .unwrap_or(SCHEMA_VERSION);
        let cluster_api = members
            .iter()
            .map(|member| member.api_extensions)
            .max()
            .unwrap_or(API_EXTENSIONS);
        if request.schema_version < cluster_schema {
            return Err(Error::SchemaMismatch {
                member: request.schema_version,
                cluster: cluster_schema,
            });
        }
        if request.api_extensions < cluster_api {
            return Err(Error::SchemaMismatch {
                member: request.api_extensions,
                cluster: cluster_api,
            });
        }

        check_storage_pools_match(&db, &request.storage_pools).await?;
        check_networks_match(&db, &request.networks).await?;

        // Pick the raft role for the new member from the current counts.
        let raft_nodes = db.raft_nodes().await?;
        let voters = raft_nodes
            .iter()
            .filter(|node| node.role == RaftRole::Voter)
            .count();
        let stand_bys = raft_nodes
            .iter()
            .filter(|node| node.role == RaftRole::StandBy)
            .count();
        let role = if voters < db.max_voters().await? as usize {
            RaftRole::Voter
        } else if stand_bys < db.max_standby().await? as usize {
            RaftRole::StandBy
        } else {
            RaftRole::Spare
        };

        let member_id = db
            .create_member(
                &request.name,
                &request.address,
                request.schema_version,
                request.api_extensions,
                &request.architecture,
            )
            .await?;
        if let Err(err) = db.create_raft_node(&request.address, role, &request.name).await {
            let _ = db.delete_member(member_id).await;
            return Err(err);
        }

        // Persist the joiner's member-specific resource config.
        for pool in &request.storage_pools {
            let overrides: HashMap<String, String> = pool
                .config
                .iter()
                .filter(|(key, _)| STORAGE_POOL_MEMBER_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if !overrides.is_empty() {
                db.set_storage_pool_member_config(&pool.name, member_id, &overrides)
                    .await?;
            }
        }
        for network in &request.networks {
            let overrides: HashMap<String, String> = network
                .config
                .iter()
                .filter(|(key, _)| NETWORK_MEMBER_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if !overrides.is_empty() {
                db.set_network_member_config(&network.name, member_id, &overrides)
                    .await?;
            }
        }

        let private_key = self
            .trust()
            .read_cluster_key()?
            .ok_or_else(|| Error::Certificate("no cluster key installed".into()))?;

        tracing::info!(
            member = %request.name,
            address = %request.address,
            role = %role,
            "accepted new cluster member"
        );

        Ok(AcceptResponse {
            raft_nodes: db.raft_nodes().await?,
            private_key,
        })
    }
}

/// Validate that the joiner's pools line up with every created cluster pool.
async fn check_storage_pools_match(
    db: &crate::store::MembershipDb,
    joiner_pools: &[StoragePoolInfo],
) -> Result<()> {
    for pool in db.list_storage_pools().await? {
        if pool.state != ResourceState::Created {
            continue;
        }

        let candidate = joiner_pools
            .iter()
            .find(|candidate| candidate.name == pool.name)
            .ok_or_else(|| Error::ConfigMismatch {
                kind: "definition".into(),
                entity: "storage pool".into(),
                name: pool.name.clone(),
                reason: "missing on joining member".into(),
            })?;

        if candidate.driver != pool.driver {
            return Err(Error::ConfigMismatch {
                kind: "driver".into(),
                entity: "storage pool".into(),
                name: pool.name.clone(),
                reason: format!("{:?} != {:?}", candidate.driver, pool.driver),
            });
        }

        if let Err(key) =
            compare_configs(&pool.config, &candidate.config, STORAGE_POOL_MEMBER_KEYS)
        {
            return Err(Error::ConfigMismatch {
                kind: "config".into(),
                entity: "storage pool".into(),
                name: pool.name.clone(),
                reason: format!("key {key:?} diverges"),
            });
        }
    }
    Ok(())
}

/// Validate that the joiner's networks line up with every created cluster
/// network.
async fn check_networks_match(
    db: &crate::store::MembershipDb,
    joiner_networks: &[NetworkInfo],
) -> Result<()> {
    for network in db.list_networks().await? {
        if network.state != ResourceState::Created {
            continue;
        }

        let candidate = joiner_networks
            .iter()
            .find(|candidate| candidate.name == network.name)
            .ok_or_else(|| Error::ConfigMismatch {
                kind: "definition".into(),
                entity: "network".into(),
                name: network.name.clone(),
                reason: "missing on joining member".into(),
            })?;

        if candidate.driver != network.driver {
            return Err(Error::ConfigMismatch {
                kind: "driver".into(),
                entity: "network".into(),
                name: network.name.clone(),
                reason: format!("{:?} != {:?}", candidate.driver, network.driver),
            });
        }

        if let Err(key) = compare_configs(&network.config, &candidate.config, NETWORK_MEMBER_KEYS)
        {
            return Err(Error::ConfigMismatch {
                kind: "config".into(),
                entity: "network".into(),
                name: network.name.clone(),
                reason: format!("key {key:?} diverges"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_overrides_restricted_to_member_keys() {
        let global = config(&[("ipv4.address", "10.1.1.1/24"), ("volatile.uuid", "x")]);
        let overrides = vec![
            MemberConfigEntry {
                entity: "network".into(),
                name: "corbr0".into(),
                key: "parent".into(),
                value: "eth1".into(),
            },
            MemberConfigEntry {
                entity: "network".into(),
                name: "corbr0".into(),
                key: "ipv4.address".into(),
                value: "10.9.9.9/24".into(),
            },
            MemberConfigEntry {
                entity: "network".into(),
                name: "other".into(),
                key: "parent".into(),
                value: "eth2".into(),
            },
        ];

        let merged = merge_overrides(&global, &overrides, "network", "corbr0", NETWORK_MEMBER_KEYS);
        assert_eq!(merged.get("parent").map(String::as_str), Some("eth1"));
        // The non-member-specific override is ignored.
        assert_eq!(
            merged.get("ipv4.address").map(String::as_str),
            Some("10.1.1.1/24")
        );
        // Volatile keys never travel to another member.
        assert!(!merged.contains_key("volatile.uuid"));
    }

    #[test]
    fn test_compare_configs_ignores_member_keys() {
        let cluster = config(&[("ipv4.address", "10.1.1.1/24"), ("parent", "eth0")]);
        let joiner = config(&[("ipv4.address", "10.1.1.1/24"), ("parent", "eth9")]);
        assert!(compare_configs(&cluster, &joiner, NETWORK_MEMBER_KEYS).is_ok());
    }

    #[test]
    fn test_compare_configs_flags_divergence() {
        let cluster = config(&[("ipv4.address", "10.1.1.1/24")]);
        let joiner = config(&[("ipv4.address", "10.2.2.2/24")]);
        assert_eq!(
            compare_configs(&cluster, &joiner, NETWORK_MEMBER_KEYS),
            Err("ipv4.address".to_string())
        );

        let joiner = config(&[("ipv4.address", "10.1.1.1/24"), ("extra", "1")]);
        assert_eq!(
            compare_configs(&cluster, &joiner, NETWORK_MEMBER_KEYS),
            Err("extra".to_string())
        );
    }

    #[test]
    fn test_join_progress_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JoinProgress::load(dir.path()).unwrap().is_none());

        let progress = JoinProgress {
            phase: JoinPhase::ConfigReconciled,
            server_name: "b".into(),
            cluster_address: "10.0.0.1:8443".into(),
        };
        progress.save(dir.path()).unwrap();

        let loaded = JoinProgress::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.phase, JoinPhase::ConfigReconciled);
        assert_eq!(loaded.server_name, "b");

        JoinProgress::clear(dir.path()).unwrap();
        assert!(JoinProgress::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_phase_ordering() {
        assert!(JoinPhase::Idle < JoinPhase::TrustSet);
        assert!(JoinPhase::RaftJoined < JoinPhase::Ready);
        assert!(JoinPhase::TrustSet < JoinPhase::ConfigReconciled);
    }
}
