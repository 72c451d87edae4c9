//! Cluster Member Rows
//!
//! Reads and writes member records, capability roles, heartbeats and the
//! cluster-wide configuration key/value table.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use super::MembershipDb;
use crate::error::{Error, Result};

/// Default cluster.offline_threshold in seconds
pub const DEFAULT_OFFLINE_THRESHOLD_SECS: u64 = 20;

/// Lowest accepted cluster.offline_threshold in seconds
pub const MIN_OFFLINE_THRESHOLD_SECS: u64 = 10;

/// Default cluster.max_voters
pub const DEFAULT_MAX_VOTERS: u64 = 3;

/// Default cluster.max_standby
pub const DEFAULT_MAX_STANDBY: u64 = 2;

/// Named capability of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// The member hosts a replica of the cluster database
    Database,
}

impl ClusterRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterRole::Database => "database",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "database" => Ok(ClusterRole::Database),
            other => Err(Error::Store(format!("unknown cluster role {other:?}"))),
        }
    }
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster member record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub description: String,
    pub schema_version: u64,
    pub api_extensions: u64,
    pub heartbeat: DateTime<Utc>,
    pub architecture: String,
    pub failure_domain: Option<String>,
    pub roles: Vec<ClusterRole>,
}

impl Member {
    /// Check whether the member has missed its heartbeat window.
    pub fn is_offline(&self, threshold: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.heartbeat);
        age.num_seconds() < 0 || age.num_seconds() as u64 > threshold.as_secs()
    }

    /// Check whether the member carries the given capability role.
    pub fn has_role(&self, role: ClusterRole) -> bool {
        self.roles.contains(&role)
    }
}

fn member_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        id: row.get::<_, i64>(0)? as u64,
        name: row.get(1)?,
        address: row.get(2)?,
        description: row.get(3)?,
        schema_version: row.get::<_, i64>(4)? as u64,
        api_extensions: row.get::<_, i64>(5)? as u64,
        heartbeat: Utc
            .timestamp_opt(row.get::<_, i64>(6)?, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        architecture: row.get(7)?,
        failure_domain: row.get(8)?,
        roles: Vec::new(),
    })
}

const MEMBER_COLUMNS: &str = "id, name, address, description, schema_version, \
     api_extensions, heartbeat, architecture, failure_domain";

fn load_roles(tx: &rusqlite::Connection, member: &mut Member) -> Result<()> {
    let mut stmt =
        tx.prepare("SELECT role FROM members_roles WHERE member_id = ?1 ORDER BY role")?;
    let rows = stmt.query_map(params![member.id as i64], |row| row.get::<_, String>(0))?;
    for row in rows {
        member.roles.push(ClusterRole::from_str(&row?)?);
    }
    Ok(())
}

impl MembershipDb {
    /// Return all cluster members, ordered by id.
    pub async fn list_members(&self) -> Result<Vec<Member>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare(&format!("SELECT {MEMBER_COLUMNS} FROM members ORDER BY id"))?;
        let rows = stmt.query_map([], member_from_row)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        for member in &mut members {
            load_roles(&conn, member)?;
        }

        Ok(members)
    }

    /// Look up a member by name.
    pub async fn get_member_by_name(&self, name: &str) -> Result<Option<Member>> {
        let conn = self.conn.lock().await;
        let member = conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE name = ?1"),
                params![name],
                member_from_row,
            )
            .optional()?;

        match member {
            Some(mut member) => {
                load_roles(&conn, &mut member)?;
                Ok(Some(member))
            }
            None => Ok(None),
        }
    }

    /// Look up a member by cluster address.
    pub async fn get_member_by_address(&self, address: &str) -> Result<Option<Member>> {
        let conn = self.conn.lock().await;
        let member = conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE address = ?1"),
                params![address],
                member_from_row,
            )
            .optional()?;

        match member {
            Some(mut member) => {
                load_roles(&conn, &mut member)?;
                Ok(Some(member))
            }
            None => Ok(None),
        }
    }

    /// Look up a member by id.
    pub async fn get_member_by_id(&self, id: u64) -> Result<Option<Member>> {
        let conn = self.conn.lock().await;
        let member = conn
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1"),
                params![id as i64],
                member_from_row,
            )
            .optional()?;

        match member {
            Some(mut member) => {
                load_roles(&conn, &mut member)?;
                Ok(Some(member))
            }
            None => Ok(None),
        }
    }

    /// Insert a new member row, returning its id. The heartbeat starts at
    /// the current time so a freshly added member is online.
    pub async fn create_member(
        &self,
        name: &str,
        address: &str,
        schema_version: u64,
        api_extensions: u64,
        architecture: &str,
    ) -> Result<u64> {
        let conn = self.conn.lock().await;

        let name_taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM members WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if name_taken.is_some() {
            return Err(Error::NameExists(name.to_string()));
        }

        let address_taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM members WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        if address_taken.is_some() {
            return Err(Error::AddressExists(address.to_string()));
        }

        conn.execute(
            "INSERT INTO members (name, address, schema_version, api_extensions, \
             heartbeat, architecture) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                address,
                schema_version as i64,
                api_extensions as i64,
                Utc::now().timestamp(),
                architecture
            ],
        )?;

        Ok(conn.last_insert_rowid() as u64)
    }

    /// Update a member's description and failure domain.
    pub async fn update_member(
        &self,
        id: u64,
        description: &str,
        failure_domain: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE members SET description = ?1, failure_domain = ?2 WHERE id = ?3",
            params![description, failure_domain, id as i64],
        )?;
        if updated == 0 {
            return Err(Error::MemberNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace a member's capability roles.
    pub async fn update_roles(&self, id: u64, roles: &[ClusterRole]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM members_roles WHERE member_id = ?1",
            params![id as i64],
        )?;
        for role in roles {
            tx.execute(
                "INSERT INTO members_roles (member_id, role) VALUES (?1, ?2)",
                params![id as i64, role.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Rename a member.
    pub async fn rename_member(&self, old: &str, new: &str) -> Result<()> {
        let conn = self.conn.lock().await;

        let taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM members WHERE name = ?1",
                params![new],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(Error::NameExists(new.to_string()));
        }

        let updated = conn.execute(
            "UPDATE members SET name = ?1 WHERE name = ?2",
            params![new, old],
        )?;
        if updated == 0 {
            return Err(Error::MemberNotFound(old.to_string()));
        }
        Ok(())
    }

    /// Record a heartbeat for the member at `address`. Runs on a dedicated
    /// connection so it cannot queue behind a membership transaction.
    pub async fn set_heartbeat(&self, address: &str, when: DateTime<Utc>) -> Result<()> {
        let conn = self.heartbeat_conn.lock().await;
        conn.execute(
            "UPDATE members SET heartbeat = ?1 WHERE address = ?2",
            params![when.timestamp(), address],
        )?;
        Ok(())
    }

    /// Delete a member row, its capability roles and its raft node row in a
    /// single transaction.
    pub async fn delete_member(&self, id: u64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let address: Option<String> = tx
            .query_row(
                "SELECT address FROM members WHERE id = ?1",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?;
        let address = address.ok_or_else(|| Error::MemberNotFound(id.to_string()))?;

        delete_member_in_tx(&tx, id, &address)?;
        tx.commit()?;
        Ok(())
    }

    // Cluster configuration key/value

    /// Read a cluster configuration key.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM cluster_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a cluster configuration key. An empty value unsets the key.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        if value.is_empty() {
            conn.execute("DELETE FROM cluster_config WHERE key = ?1", params![key])?;
        } else {
            conn.execute(
                "INSERT INTO cluster_config (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        Ok(())
    }

    /// Dump the cluster configuration.
    pub async fn config_dump(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT key, value FROM cluster_config")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut config = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            config.insert(key, value);
        }
        Ok(config)
    }

    /// The heartbeat age beyond which a member is considered offline.
    pub async fn offline_threshold(&self) -> Result<Duration> {
        let secs = match self.config_get("cluster.offline_threshold").await? {
            Some(raw) => {
                let parsed: u64 = raw.parse().map_err(|_| {
                    Error::Config(format!("invalid cluster.offline_threshold {raw:?}"))
                })?;
                parsed.max(MIN_OFFLINE_THRESHOLD_SECS)
            }
            None => DEFAULT_OFFLINE_THRESHOLD_SECS,
        };
        Ok(Duration::from_secs(secs))
    }

    /// Target number of raft voters.
    pub async fn max_voters(&self) -> Result<u64> {
        match self.config_get("cluster.max_voters").await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid cluster.max_voters {raw:?}"))),
            None => Ok(DEFAULT_MAX_VOTERS),
        }
    }

    /// Target number of raft stand-bys.
    pub async fn max_standby(&self) -> Result<u64> {
        match self.config_get("cluster.max_standby").await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid cluster.max_standby {raw:?}"))),
            None => Ok(DEFAULT_MAX_STANDBY),
        }
    }

    /// Legacy cluster trust password, if the operator configured one.
    pub async fn trust_password(&self) -> Result<Option<String>> {
        self.config_get("cluster.trust_password").await
    }

    // Node-local configuration key/value (not replicated)

    /// Read a node-local configuration key.
    pub async fn local_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM local_config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a node-local configuration key.
    pub async fn local_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        if value.is_empty() {
            conn.execute("DELETE FROM local_config WHERE key = ?1", params![key])?;
        } else {
            conn.execute(
                "INSERT INTO local_config (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        Ok(())
    }
}

/// Delete a member and its raft node row inside an open transaction.
pub(crate) fn delete_member_in_tx(tx: &Transaction<'_>, id: u64, address: &str) -> Result<()> {
    tx.execute(
        "DELETE FROM members_roles WHERE member_id = ?1",
        params![id as i64],
    )?;
    tx.execute(
        "DELETE FROM storage_pools_config WHERE member_id = ?1",
        params![id as i64],
    )?;
    tx.execute(
        "DELETE FROM networks_config WHERE member_id = ?1",
        params![id as i64],
    )?;
    tx.execute("DELETE FROM members WHERE id = ?1", params![id as i64])?;
    tx.execute("DELETE FROM raft_nodes WHERE address = ?1", params![address])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_lookup() {
        let db = MembershipDb::open_ephemeral().unwrap();
        let id = db
            .create_member("a", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap();
        assert_eq!(id, 1);

        let member = db.get_member_by_name("a").await.unwrap().unwrap();
        assert_eq!(member.address, "10.0.0.1:8443");
        assert_eq!(member.schema_version, 4);
        assert!(member.roles.is_empty());

        assert!(db.get_member_by_name("b").await.unwrap().is_none());
        assert!(db
            .get_member_by_address("10.0.0.1:8443")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_uniqueness() {
        let db = MembershipDb::open_ephemeral().unwrap();
        db.create_member("a", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap();

        let err = db
            .create_member("a", "10.0.0.2:8443", 4, 12, "x86_64")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameExists(_)));

        let err = db
            .create_member("b", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressExists(_)));
    }

    #[tokio::test]
    async fn test_roles_round_trip() {
        let db = MembershipDb::open_ephemeral().unwrap();
        let id = db
            .create_member("a", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap();

        db.update_roles(id, &[ClusterRole::Database]).await.unwrap();
        let member = db.get_member_by_id(id).await.unwrap().unwrap();
        assert!(member.has_role(ClusterRole::Database));

        db.update_roles(id, &[]).await.unwrap();
        let member = db.get_member_by_id(id).await.unwrap().unwrap();
        assert!(member.roles.is_empty());
    }

    #[tokio::test]
    async fn test_rename_conflict() {
        let db = MembershipDb::open_ephemeral().unwrap();
        db.create_member("a", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap();
        db.create_member("b", "10.0.0.2:8443", 4, 12, "x86_64")
            .await
            .unwrap();

        assert!(matches!(
            db.rename_member("a", "b").await.unwrap_err(),
            Error::NameExists(_)
        ));
        db.rename_member("a", "c").await.unwrap();
        assert!(db.get_member_by_name("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_raft_row() {
        let db = MembershipDb::open_ephemeral().unwrap();
        let id = db
            .create_member("a", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap();
        db.create_first_raft_node("10.0.0.1:8443", "a").await.unwrap();

        db.delete_member(id).await.unwrap();
        assert!(db.get_member_by_id(id).await.unwrap().is_none());
        assert!(db.raft_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_detection() {
        let db = MembershipDb::open_ephemeral().unwrap();
        let id = db
            .create_member("a", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap();

        let member = db.get_member_by_id(id).await.unwrap().unwrap();
        assert!(!member.is_offline(Duration::from_secs(20)));

        let stale = Utc::now() - chrono::Duration::seconds(60);
        db.set_heartbeat("10.0.0.1:8443", stale).await.unwrap();
        let member = db.get_member_by_id(id).await.unwrap().unwrap();
        assert!(member.is_offline(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn test_config_defaults_and_floor() {
        let db = MembershipDb::open_ephemeral().unwrap();
        assert_eq!(
            db.offline_threshold().await.unwrap(),
            Duration::from_secs(DEFAULT_OFFLINE_THRESHOLD_SECS)
        );
        assert_eq!(db.max_voters().await.unwrap(), 3);
        assert_eq!(db.max_standby().await.unwrap(), 2);

        db.config_set("cluster.offline_threshold", "5").await.unwrap();
        assert_eq!(
            db.offline_threshold().await.unwrap(),
            Duration::from_secs(MIN_OFFLINE_THRESHOLD_SECS)
        );

        db.config_set("cluster.offline_threshold", "").await.unwrap();
        assert_eq!(
            db.offline_threshold().await.unwrap(),
            Duration::from_secs(DEFAULT_OFFLINE_THRESHOLD_SECS)
        );
    }
}
