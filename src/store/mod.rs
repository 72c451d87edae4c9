//! Replicated Store Access
//!
//! The cluster state lives in a raft-replicated SQL database. This module
//! owns the SQL half (the `MembershipDb` handle and its schema) and defines
//! the `ReplicatedStore` trait, the external control surface of the raft
//! layer itself (leader lookup, leadership transfer, membership of the raft
//! configuration). The SQL handle behaves like a plain SQLite connection;
//! replication happens underneath it.

mod members;
mod raft;
mod resources;
mod standalone;

pub use members::{ClusterRole, Member};
pub use standalone::StandaloneStore;
pub use raft::{RaftNode, RaftRole};
pub use resources::{
    MemberConfigKey, NetworkInfo, ResourceState, StoragePoolInfo, NETWORK_MEMBER_KEYS,
    STORAGE_POOL_MEMBER_KEYS,
};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::Mutex;

use crate::error::Result;

/// Control surface of the raft layer backing the replicated database.
///
/// The membership subsystem never drives raft directly; everything it needs
/// from the consensus layer goes through this interface.
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    /// Address of the current raft leader, if one is elected.
    async fn leader_address(&self) -> Result<Option<String>>;

    /// Block until the local node has become leader.
    async fn wait_leadership(&self) -> Result<()>;

    /// Ask the raft layer to transfer leadership away from the local node.
    async fn transfer_leadership(&self) -> Result<()>;

    /// Remove the raft node at `address` from the raft configuration.
    async fn leave(&self, address: &str) -> Result<()>;

    /// Demote an offline raft node without contacting it.
    async fn demote_offline(&self, id: u64) -> Result<()>;

    /// Apply a declarative raft configuration on the local node.
    async fn assign(&self, nodes: &[RaftNode]) -> Result<()>;

    /// Drop all replication state and return the local database to
    /// standalone operation.
    async fn reset_standalone(&self) -> Result<()>;

    /// Handle on the replicated membership database. Valid once the local
    /// node participates in the raft configuration (after bootstrap or a
    /// raft join).
    async fn cluster_db(&self) -> Result<std::sync::Arc<MembershipDb>>;
}

/// Handle on the replicated membership database.
///
/// Mutating membership operations run on the main connection inside a single
/// SQL transaction. Heartbeats use a dedicated second connection so they
/// never queue behind a membership transaction.
pub struct MembershipDb {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) heartbeat_conn: Mutex<Connection>,
}

static EPHEMERAL_DB_SEQ: AtomicU64 = AtomicU64::new(0);

impl MembershipDb {
    /// Open (or create) the membership database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let heartbeat_conn = Connection::open(path)?;
        Self::from_connections(conn, heartbeat_conn)
    }

    /// Open a private in-memory database, shared between the two internal
    /// connections. Used by tests and by nodes that have not yet joined or
    /// bootstrapped a cluster.
    pub fn open_ephemeral() -> Result<Self> {
        let seq = EPHEMERAL_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:corral-memdb-{seq}?mode=memory&cache=shared");
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;

        let conn = Connection::open_with_flags(&uri, flags)?;
        let heartbeat_conn = Connection::open_with_flags(&uri, flags)?;
        Self::from_connections(conn, heartbeat_conn)
    }

    fn from_connections(conn: Connection, heartbeat_conn: Connection) -> Result<Self> {
        for c in [&conn, &heartbeat_conn] {
            c.pragma_update(None, "foreign_keys", "ON")?;
            c.busy_timeout(std::time::Duration::from_secs(5))?;
        }
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            heartbeat_conn: Mutex::new(heartbeat_conn),
        })
    }

    /// Initialize the schema
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS members (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                schema_version INTEGER NOT NULL,
                api_extensions INTEGER NOT NULL,
                heartbeat INTEGER NOT NULL DEFAULT 0,
                architecture TEXT NOT NULL DEFAULT '',
                failure_domain TEXT
            );

            CREATE TABLE IF NOT EXISTS members_roles (
                member_id INTEGER NOT NULL REFERENCES members(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                UNIQUE (member_id, role)
            );

            CREATE TABLE IF NOT EXISTS raft_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE,
                role INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS cluster_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS local_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS storage_pools (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                driver TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                state INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS storage_pools_config (
                pool_id INTEGER NOT NULL REFERENCES storage_pools(id) ON DELETE CASCADE,
                member_id INTEGER REFERENCES members(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE (pool_id, member_id, key)
            );

            CREATE TABLE IF NOT EXISTS networks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                driver TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                state INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS networks_config (
                network_id INTEGER NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
                member_id INTEGER REFERENCES members(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE (network_id, member_id, key)
            );

            CREATE TABLE IF NOT EXISTS peer_certificates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                certificate TEXT NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    /// Check whether this node is part of a cluster.
    pub async fn is_clustered(&self) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_ephemeral_shares_storage() {
        let db = MembershipDb::open_ephemeral().unwrap();

        {
            let conn = db.conn.lock().await;
            conn.execute(
                "INSERT INTO cluster_config (key, value) VALUES ('k', 'v')",
                [],
            )
            .unwrap();
        }

        // The heartbeat connection must see rows written by the main one.
        let hb = db.heartbeat_conn.lock().await;
        let value: String = hb
            .query_row("SELECT value FROM cluster_config WHERE key = 'k'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(value, "v");
    }

    #[tokio::test]
    async fn test_not_clustered_when_empty() {
        let db = MembershipDb::open_ephemeral().unwrap();
        assert!(!db.is_clustered().await.unwrap());
    }
}
