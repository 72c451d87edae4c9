//! Replicated Configuration Resources
//!
//! Storage pools and networks are cluster-wide objects created on every
//! member. Creation walks a pending -> created state machine; a failure on
//! any member moves the resource to errored, which is terminal (delete and
//! recreate). A fixed subset of config keys is member-specific; all other
//! keys are global and must match across the cluster.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::MembershipDb;
use crate::error::{Error, Result};

/// Storage pool config keys that may differ between members
pub const STORAGE_POOL_MEMBER_KEYS: &[&str] = &[
    "source",
    "size",
    "zfs.pool_name",
    "lvm.vg_name",
    "lvm.thinpool_name",
];

/// Network config keys that may differ between members
pub const NETWORK_MEMBER_KEYS: &[&str] = &["bridge.external_interfaces", "parent"];

/// Lifecycle state of a replicated resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Pending,
    Created,
    Errored,
}

impl ResourceState {
    pub fn as_i64(self) -> i64 {
        match self {
            ResourceState::Pending => 0,
            ResourceState::Created => 1,
            ResourceState::Errored => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(ResourceState::Pending),
            1 => Ok(ResourceState::Created),
            2 => Ok(ResourceState::Errored),
            other => Err(Error::Store(format!("invalid resource state {other}"))),
        }
    }
}

/// A cluster-wide storage pool definition with its global config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePoolInfo {
    pub name: String,
    pub driver: String,
    pub description: String,
    pub state: ResourceState,
    pub config: HashMap<String, String>,
}

/// A cluster-wide network definition with its global config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub driver: String,
    pub description: String,
    pub state: ResourceState,
    pub config: HashMap<String, String>,
}

/// A member-specific config key of a defined pool or network, advertised to
/// joining nodes so they know which overrides they may supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfigKey {
    pub entity: String,
    pub name: String,
    pub key: String,
    pub description: String,
}

// The pools and networks tables have identical shapes; these helpers are
// parameterized on the table names.
struct ResourceTables {
    entity: &'static str,
    config: &'static str,
    fk: &'static str,
}

const POOL_TABLES: ResourceTables = ResourceTables {
    entity: "storage_pools",
    config: "storage_pools_config",
    fk: "pool_id",
};

const NETWORK_TABLES: ResourceTables = ResourceTables {
    entity: "networks",
    config: "networks_config",
    fk: "network_id",
};

impl MembershipDb {
    async fn create_resource(
        &self,
        tables: &ResourceTables,
        name: &str,
        driver: &str,
        config: &HashMap<String, String>,
        state: ResourceState,
    ) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let taken: Option<i64> = tx
            .query_row(
                &format!("SELECT id FROM {} WHERE name = ?1", tables.entity),
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(Error::NameExists(name.to_string()));
        }

        tx.execute(
            &format!(
                "INSERT INTO {} (name, driver, state) VALUES (?1, ?2, ?3)",
                tables.entity
            ),
            params![name, driver, state.as_i64()],
        )?;
        let id = tx.last_insert_rowid();

        for (key, value) in config {
            tx.execute(
                &format!(
                    "INSERT INTO {} ({}, member_id, key, value) VALUES (?1, NULL, ?2, ?3)",
                    tables.config, tables.fk
                ),
                params![id, key, value],
            )?;
        }

        tx.commit()?;
        Ok(id as u64)
    }

    async fn list_resources(
        &self,
        tables: &ResourceTables,
    ) -> Result<Vec<(String, String, String, ResourceState, HashMap<String, String>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, driver, description, state FROM {} ORDER BY id",
            tables.entity
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, name, driver, description, state) = row?;

            let mut config = HashMap::new();
            let mut cfg_stmt = conn.prepare(&format!(
                "SELECT key, value FROM {} WHERE {} = ?1 AND member_id IS NULL",
                tables.config, tables.fk
            ))?;
            let cfg_rows = cfg_stmt.query_map(params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for cfg in cfg_rows {
                let (key, value) = cfg?;
                config.insert(key, value);
            }

            out.push((name, driver, description, ResourceState::from_i64(state)?, config));
        }

        Ok(out)
    }

    async fn set_resource_state(
        &self,
        tables: &ResourceTables,
        name: &str,
        state: ResourceState,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            &format!("UPDATE {} SET state = ?1 WHERE name = ?2", tables.entity),
            params![state.as_i64(), name],
        )?;
        if updated == 0 {
            return Err(Error::MemberNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn set_resource_member_config(
        &self,
        tables: &ResourceTables,
        name: &str,
        member_id: u64,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let id: Option<i64> = tx
            .query_row(
                &format!("SELECT id FROM {} WHERE name = ?1", tables.entity),
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let id = id.ok_or_else(|| Error::MemberNotFound(name.to_string()))?;

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1 AND member_id = ?2",
                tables.config, tables.fk
            ),
            params![id, member_id as i64],
        )?;
        for (key, value) in config {
            tx.execute(
                &format!(
                    "INSERT INTO {} ({}, member_id, key, value) VALUES (?1, ?2, ?3, ?4)",
                    tables.config, tables.fk
                ),
                params![id, member_id as i64, key, value],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn member_specific_config(
        &self,
        tables: &ResourceTables,
        entity_label: &str,
        keys: &mut Vec<MemberConfigKey>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT e.name, c.key FROM {} e JOIN {} c ON c.{} = e.id \
             WHERE c.member_id IS NOT NULL ORDER BY e.name, c.key",
            tables.entity, tables.config, tables.fk
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (name, key) = row?;
            keys.push(MemberConfigKey {
                entity: entity_label.to_string(),
                description: format!("{key:?} property for {entity_label} {name:?}"),
                name,
                key,
            });
        }
        Ok(())
    }

    /// Create a storage pool definition.
    pub async fn create_storage_pool(
        &self,
        name: &str,
        driver: &str,
        config: &HashMap<String, String>,
        state: ResourceState,
    ) -> Result<u64> {
        self.create_resource(&POOL_TABLES, name, driver, config, state)
            .await
    }

    /// List all storage pools with their global config.
    pub async fn list_storage_pools(&self) -> Result<Vec<StoragePoolInfo>> {
        let rows = self.list_resources(&POOL_TABLES).await?;
        Ok(rows
            .into_iter()
            .map(|(name, driver, description, state, config)| StoragePoolInfo {
                name,
                driver,
                description,
                state,
                config,
            })
            .collect())
    }

    /// Set the lifecycle state of a storage pool.
    pub async fn set_storage_pool_state(&self, name: &str, state: ResourceState) -> Result<()> {
        self.set_resource_state(&POOL_TABLES, name, state).await
    }

    /// Replace the member-specific config of a storage pool for one member.
    pub async fn set_storage_pool_member_config(
        &self,
        name: &str,
        member_id: u64,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        self.set_resource_member_config(&POOL_TABLES, name, member_id, config)
            .await
    }

    /// Delete a storage pool definition and all its config rows.
    pub async fn delete_storage_pool(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM storage_pools WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(Error::MemberNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Create a network definition.
    pub async fn create_network(
        &self,
        name: &str,
        driver: &str,
        config: &HashMap<String, String>,
        state: ResourceState,
    ) -> Result<u64> {
        self.create_resource(&NETWORK_TABLES, name, driver, config, state)
            .await
    }

    /// List all networks with their global config.
    pub async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let rows = self.list_resources(&NETWORK_TABLES).await?;
        Ok(rows
            .into_iter()
            .map(|(name, driver, description, state, config)| NetworkInfo {
                name,
                driver,
                description,
                state,
                config,
            })
            .collect())
    }

    /// Set the lifecycle state of a network.
    pub async fn set_network_state(&self, name: &str, state: ResourceState) -> Result<()> {
        self.set_resource_state(&NETWORK_TABLES, name, state).await
    }

    /// Replace the member-specific config of a network for one member.
    pub async fn set_network_member_config(
        &self,
        name: &str,
        member_id: u64,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        self.set_resource_member_config(&NETWORK_TABLES, name, member_id, config)
            .await
    }

    /// Delete a network definition and all its config rows.
    pub async fn delete_network(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM networks WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(Error::MemberNotFound(name.to_string()));
        }
        Ok(())
    }

    /// All member-specific config keys currently set on defined pools and
    /// networks, advertised through `GET /cluster`.
    pub async fn member_config_keys(&self) -> Result<Vec<MemberConfigKey>> {
        let mut keys = Vec::new();
        self.member_specific_config(&POOL_TABLES, "storage-pool", &mut keys)
            .await?;
        self.member_specific_config(&NETWORK_TABLES, "network", &mut keys)
            .await?;
        Ok(keys)
    }
}
