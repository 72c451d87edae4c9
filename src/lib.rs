//! Corral - Clustered Control-Plane Membership
//!
//! The membership subsystem of the Corral container/VM orchestrator. It
//! maintains a strongly-consistent view of cluster members in a raft-backed
//! SQL store, elects and rebalances database roles, establishes trust for
//! joining nodes through single-use tokens, and fans configuration changes
//! out to peers.
//!
//! # Architecture
//!
//! All mutating membership operations are serialized on the raft leader
//! behind a single membership mutex; requests landing on a follower are
//! redirected. The raft layer itself is external, reached through the
//! `ReplicatedStore` interface, as are peer RPC (`PeerTransport`) and the
//! workload layer (`WorkloadCoordinator`).

pub mod api;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod membership;
pub mod notify;
pub mod ops;
pub mod store;
pub mod transport;
pub mod trust;
pub mod workload;

pub use config::CorralConfig;
pub use error::{Error, Result};

/// Schema generation of the replicated database
pub const SCHEMA_VERSION: u64 = 4;

/// Number of API extensions this build understands
pub const API_EXTENSIONS: u64 = 12;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::CorralConfig;
    pub use crate::error::{Error, Result};
    pub use crate::membership::{LeaderCheck, MembershipCoordinator};
    pub use crate::notify::{Notifier, NotifyPolicy};
    pub use crate::store::{ClusterRole, Member, MembershipDb, RaftNode, RaftRole, ReplicatedStore};
    pub use crate::transport::{PeerClient, PeerTransport};
    pub use crate::trust::{JoinToken, TrustManager};
    pub use crate::workload::WorkloadCoordinator;
}
