//! Raft Node Rows
//!
//! The raft_nodes table mirrors the raft configuration of the replicated
//! store. Only the leader writes it; followers receive the rows through
//! replication or through an explicit assign RPC.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::MembershipDb;
use crate::error::{Error, Result};

/// Role of a node within the raft configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RaftRole {
    /// Full consensus participant
    Voter,
    /// Replicating non-voter, hot candidate for promotion
    StandBy,
    /// Not replicating; kept in the cluster for routing and workloads
    Spare,
}

impl RaftRole {
    pub fn as_i64(self) -> i64 {
        match self {
            RaftRole::Voter => 0,
            RaftRole::StandBy => 1,
            RaftRole::Spare => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(RaftRole::Voter),
            1 => Ok(RaftRole::StandBy),
            2 => Ok(RaftRole::Spare),
            other => Err(Error::Store(format!("invalid raft role {other}"))),
        }
    }
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Voter => write!(f, "voter"),
            RaftRole::StandBy => write!(f, "stand-by"),
            RaftRole::Spare => write!(f, "spare"),
        }
    }
}

/// A node in the raft configuration of the replicated store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftNode {
    pub id: u64,
    pub address: String,
    pub role: RaftRole,
    pub name: String,
}

impl MembershipDb {
    /// Return all raft nodes, ordered by id.
    pub async fn raft_nodes(&self) -> Result<Vec<RaftNode>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, address, role, name FROM raft_nodes ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (id, address, role, name) = row?;
            nodes.push(RaftNode {
                id: id as u64,
                address,
                role: RaftRole::from_i64(role)?,
                name,
            });
        }

        Ok(nodes)
    }

    /// Add the founding raft node. Forces the row id to 1, matching the
    /// server id of the first raft log entry, replacing any existing row.
    pub async fn create_first_raft_node(&self, address: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO raft_nodes (id, address, role, name) VALUES (1, ?1, 0, ?2)",
            params![address, name],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM raft_nodes WHERE address = ?1",
            params![address],
            |row| row.get(0),
        )?;
        if id != 1 {
            return Err(Error::Store("could not set raft node id to 1".into()));
        }

        Ok(())
    }

    /// Add a raft node row, returning its id.
    pub async fn create_raft_node(
        &self,
        address: &str,
        role: RaftRole,
        name: &str,
    ) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO raft_nodes (address, role, name) VALUES (?1, ?2, ?3)",
            params![address, role.as_i64(), name],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Remove the raft node with the given address.
    pub async fn remove_raft_node(&self, address: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM raft_nodes WHERE address = ?1",
            params![address],
        )?;
        if deleted == 0 {
            return Err(Error::MemberNotFound(address.to_string()));
        }
        Ok(())
    }

    /// Replace the full raft node list.
    pub async fn replace_raft_nodes(&self, nodes: &[RaftNode]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM raft_nodes", [])?;
        for node in nodes {
            tx.execute(
                "INSERT INTO raft_nodes (id, address, role, name) VALUES (?1, ?2, ?3, ?4)",
                params![node.id as i64, node.address, node.role.as_i64(), node.name],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
