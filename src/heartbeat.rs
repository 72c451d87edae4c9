//! Cluster Background Tasks
//!
//! Every member refreshes its own heartbeat row on an interval; the leader
//! additionally runs a periodic role-rebalance tick. Both tasks are started
//! after bootstrap or join and stopped when clustering is disabled.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::membership::MembershipCoordinator;

/// Spawn the self-heartbeat task.
pub(crate) fn spawn_heartbeat(coordinator: Arc<MembershipCoordinator>) -> JoinHandle<()> {
    let interval = coordinator.config().heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let db = coordinator.db().await;
            match db.is_clustered().await {
                Ok(true) => {
                    let address = coordinator.local_address().await;
                    if let Err(err) = db.set_heartbeat(&address, Utc::now()).await {
                        tracing::warn!("failed to refresh heartbeat: {err}");
                    }
                }
                Ok(false) => {}
                Err(err) => tracing::warn!("heartbeat tick failed: {err}"),
            }
        }
    })
}

/// Spawn the leader's periodic rebalance tick.
pub(crate) fn spawn_rebalance_tick(coordinator: Arc<MembershipCoordinator>) -> JoinHandle<()> {
    let interval = coordinator.config().rebalance_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            match coordinator.rebalance().await {
                Ok(()) => {}
                // Followers skip the tick; the leader will run it.
                Err(err) if err.is_leader_redirect() => {}
                Err(err) => tracing::warn!("role rebalance tick failed: {err}"),
            }
        }
    })
}
