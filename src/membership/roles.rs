//! Raft Role Management
//!
//! Computes and applies voter/stand-by/spare assignments. The rebalance loop
//! emits one role change at a time and recurses until the cluster is at its
//! target shape. Offline voters are demoted before anything is promoted, so
//! a flapping member can never cause a double promotion.
//!
//! Candidate ordering everywhere: members holding the database role first,
//! then failure-domain diversity, then lowest member id.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::store::{ClusterRole, RaftRole};

use super::{LeaderCheck, MembershipCoordinator};

/// Point-in-time view of one member used by the role computations
#[derive(Debug, Clone)]
pub(crate) struct RoleSnapshotEntry {
    pub member_id: u64,
    pub address: String,
    pub raft_id: u64,
    pub raft_role: RaftRole,
    pub online: bool,
    pub has_database: bool,
    pub failure_domain: Option<String>,
}

/// A single role change to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RoleChange {
    /// Demote an unreachable raft node without contacting it
    DemoteOffline { raft_id: u64, address: String },
    /// Assign a new role to an online member via the assign RPC
    Assign { address: String, role: RaftRole },
}

fn domain_of(entry: &RoleSnapshotEntry) -> &str {
    entry.failure_domain.as_deref().unwrap_or("")
}

/// How many current holders of `role` share each failure domain.
fn domain_counts<'a>(
    entries: &'a [RoleSnapshotEntry],
    role: RaftRole,
) -> HashMap<&'a str, usize> {
    let mut counts = HashMap::new();
    for entry in entries {
        if entry.raft_role == role && entry.online {
            *counts.entry(domain_of(entry)).or_insert(0) += 1;
        }
    }
    counts
}

/// Pick the best promotion candidate among `candidates` for `role`.
fn best_candidate<'a>(
    entries: &[RoleSnapshotEntry],
    candidates: impl Iterator<Item = &'a RoleSnapshotEntry>,
    role: RaftRole,
) -> Option<&'a RoleSnapshotEntry> {
    let counts = domain_counts(entries, role);
    candidates.min_by_key(|entry| {
        (
            !entry.has_database,
            counts.get(domain_of(entry)).copied().unwrap_or(0),
            entry.member_id,
        )
    })
}

/// Compute the next single role change, if any.
pub(crate) fn next_role_change(
    entries: &[RoleSnapshotEntry],
    max_voters: usize,
    max_standby: usize,
) -> Option<RoleChange> {
    // Offline voters are demoted first, one per iteration, and nothing is
    // promoted in the same pass.
    if let Some(offline_voter) = entries
        .iter()
        .filter(|entry| entry.raft_role == RaftRole::Voter && !entry.online)
        .min_by_key(|entry| entry.raft_id)
    {
        return Some(RoleChange::DemoteOffline {
            raft_id: offline_voter.raft_id,
            address: offline_voter.address.clone(),
        });
    }

    let voters = entries
        .iter()
        .filter(|entry| entry.raft_role == RaftRole::Voter && entry.online)
        .count();
    if voters < max_voters {
        let candidate = best_candidate(
            entries,
            entries
                .iter()
                .filter(|entry| entry.online && entry.raft_role != RaftRole::Voter),
            RaftRole::Voter,
        );
        if let Some(candidate) = candidate {
            return Some(RoleChange::Assign {
                address: candidate.address.clone(),
                role: RaftRole::Voter,
            });
        }
    }

    let stand_bys = entries
        .iter()
        .filter(|entry| entry.raft_role == RaftRole::StandBy && entry.online)
        .count();
    if stand_bys < max_standby {
        let candidate = best_candidate(
            entries,
            entries
                .iter()
                .filter(|entry| entry.online && entry.raft_role == RaftRole::Spare),
            RaftRole::StandBy,
        );
        if let Some(candidate) = candidate {
            return Some(RoleChange::Assign {
                address: candidate.address.clone(),
                role: RaftRole::StandBy,
            });
        }
    }

    None
}

/// Pick the member that should take over the role of the leaver at
/// `leaving_address`, or None if there is no suitable candidate.
pub(crate) fn handover_candidate<'a>(
    entries: &'a [RoleSnapshotEntry],
    leaving_address: &str,
) -> Option<(&'a RoleSnapshotEntry, RaftRole)> {
    let leaver = entries
        .iter()
        .find(|entry| entry.address == leaving_address)?;
    let role = leaver.raft_role;
    if role == RaftRole::Spare {
        return None;
    }

    let candidate = best_candidate(
        entries,
        entries.iter().filter(|entry| {
            entry.online
                && entry.address != leaving_address
                && match role {
                    RaftRole::Voter => entry.raft_role != RaftRole::Voter,
                    _ => entry.raft_role == RaftRole::Spare,
                }
        }),
        role,
    )?;

    Some((candidate, role))
}

impl MembershipCoordinator {
    /// Snapshot members and raft state for a role computation.
    pub(crate) async fn role_snapshot(&self) -> Result<Vec<RoleSnapshotEntry>> {
        let db = self.db().await;
        let threshold = db.offline_threshold().await?;
        let members = db.list_members().await?;
        let raft_nodes = db.raft_nodes().await?;

        let mut entries = Vec::new();
        for member in members {
            // Every created member has a raft row; a missing one means the
            // member is still pending and takes no part in role management.
            let Some(node) = raft_nodes
                .iter()
                .find(|node| node.address == member.address)
            else {
                continue;
            };

            entries.push(RoleSnapshotEntry {
                member_id: member.id,
                address: member.address.clone(),
                raft_id: node.id,
                raft_role: node.role,
                online: !member.is_offline(threshold),
                has_database: member.has_role(ClusterRole::Database),
                failure_domain: member.failure_domain.clone(),
            });
        }

        Ok(entries)
    }

    /// `POST /internal/cluster/rebalance`: leader-only role rebalance.
    pub async fn rebalance(&self) -> Result<()> {
        let db = self.db().await;
        if !db.is_clustered().await? {
            return Ok(());
        }
        self.ensure_leader().await?;

        let _guard = self.lock_membership().await;
        self.rebalance_locked().await
    }

    /// Rebalance loop body; the membership mutex must be held.
    pub(crate) async fn rebalance_locked(&self) -> Result<()> {
        let db = self.db().await;
        let max_voters = db.max_voters().await? as usize;
        let max_standby = db.max_standby().await? as usize;

        // One change per iteration; the cap only guards against livelock.
        let cap = db.list_members().await?.len() * 3 + 1;
        for _ in 0..cap {
            let entries = self.role_snapshot().await?;
            match next_role_change(&entries, max_voters, max_standby) {
                None => return Ok(()),
                Some(RoleChange::DemoteOffline { raft_id, address }) => {
                    tracing::info!(%address, "demoting offline member during rebalance");
                    self.raft().demote_offline(raft_id).await?;
                    self.set_raft_role(&address, RaftRole::Spare).await?;
                }
                Some(RoleChange::Assign { address, role }) => {
                    tracing::info!(%address, role = %role, "promoting member during rebalance");
                    match self.apply_assign(&address, role).await {
                        Ok(()) => {}
                        Err(err) if err.is_connection_error() => {
                            // Retried on the next tick; the assign RPC is
                            // declarative so a replay is harmless.
                            tracing::warn!(
                                %address,
                                "role change transport failure, will retry: {err}"
                            );
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        Ok(())
    }

    /// Update a raft node row's role in the replicated database.
    async fn set_raft_role(&self, address: &str, role: RaftRole) -> Result<()> {
        let db = self.db().await;
        let mut nodes = db.raft_nodes().await?;
        let node = nodes
            .iter_mut()
            .find(|node| node.address == address)
            .ok_or_else(|| Error::MemberNotFound(address.to_string()))?;
        node.role = role;
        db.replace_raft_nodes(&nodes).await
    }

    /// Record a role change and push the full raft node list to the target
    /// member. The database mutation precedes the RPC, so a notified peer
    /// can assume the leader has committed.
    pub(crate) async fn apply_assign(&self, address: &str, role: RaftRole) -> Result<()> {
        self.set_raft_role(address, role).await?;

        let nodes = self.db().await.raft_nodes().await?;
        let client = self.transport().connect(address).await?;
        client.assign(&nodes).await
    }

    /// `POST /internal/cluster/assign`: apply a declarative raft
    /// configuration on the local node.
    pub async fn handle_assign(&self, nodes: &[crate::store::RaftNode]) -> Result<()> {
        if nodes.is_empty() {
            return Err(Error::BadRequest("no raft members provided".into()));
        }
        self.raft().assign(nodes).await
    }

    /// `POST /internal/cluster/handover`: promote a replacement and demote
    /// the member at `leaving_address` to spare. Leader only.
    pub async fn handover(&self, leaving_address: &str) -> Result<()> {
        if leaving_address.is_empty() {
            return Err(Error::BadRequest("no address provided".into()));
        }
        self.ensure_leader().await?;

        let _guard = self.lock_membership().await;

        let entries = self.role_snapshot().await?;
        let Some((candidate, role)) = handover_candidate(&entries, leaving_address) else {
            // Nothing to promote; the rebalance loop will pick things up.
            return Ok(());
        };
        let candidate_address = candidate.address.clone();

        tracing::info!(
            candidate = %candidate_address,
            losing = leaving_address,
            "promoting member during handover"
        );
        self.apply_assign(&candidate_address, role).await?;

        tracing::info!(losing = leaving_address, "demoting member during handover");
        self.apply_assign(leaving_address, RaftRole::Spare).await?;

        Ok(())
    }

    /// Hand over the local member's role before it leaves the cluster,
    /// typically at daemon shutdown. Transfers raft leadership away first
    /// when this node is the leader.
    pub async fn handover_own_role(&self) -> Result<()> {
        let address = self.local_address().await;

        for _ in 0..2 {
            match self.leader_check().await? {
                LeaderCheck::Local => {
                    tracing::info!(%address, "transferring leadership before handover");
                    self.raft().transfer_leadership().await?;
                }
                LeaderCheck::Forward(leader) => {
                    tracing::info!(%address, "handing over cluster member role");
                    let client = self.transport().connect(&leader).await?;
                    return client.handover(&address).await;
                }
            }
        }

        Err(Error::NoLeader)
    }
}
