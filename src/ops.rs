//! Background Operations
//!
//! Long-running cluster actions (bootstrap, join, member removal) run as
//! operations with a stable id that clients can poll. Join tokens are
//! operations too: Token-class records whose metadata carries the token and
//! whose cancellation consumes it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// A background task with a final success/failure outcome
    Task,
    /// A single-use credential; cancelled when redeemed
    Token,
}

/// What an operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ClusterBootstrap,
    ClusterJoin,
    ClusterJoinToken,
    ClusterMemberRemove,
}

/// Lifecycle status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Failure,
    Cancelled,
}

/// A single operation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub class: OperationClass,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// In-memory registry of operations
#[derive(Default)]
pub struct OpsRegistry {
    ops: RwLock<HashMap<Uuid, Operation>>,
}

impl OpsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new running operation record.
    pub async fn create(
        &self,
        class: OperationClass,
        kind: OperationKind,
        metadata: serde_json::Value,
    ) -> Operation {
        let op = Operation {
            id: Uuid::new_v4(),
            class,
            kind,
            status: OperationStatus::Running,
            metadata,
            created_at: Utc::now(),
            error: None,
        };
        self.ops.write().await.insert(op.id, op.clone());
        op
    }

    /// Fetch an operation by id.
    pub async fn get(&self, id: Uuid) -> Option<Operation> {
        self.ops.read().await.get(&id).cloned()
    }

    /// All running operations of the given kind.
    pub async fn running_of_kind(&self, kind: OperationKind) -> Vec<Operation> {
        self.ops
            .read()
            .await
            .values()
            .filter(|op| op.kind == kind && op.status == OperationStatus::Running)
            .cloned()
            .collect()
    }

    /// Mark an operation finished.
    pub async fn finish(&self, id: Uuid, outcome: Result<()>) {
        let mut ops = self.ops.write().await;
        if let Some(op) = ops.get_mut(&id) {
            match outcome {
                Ok(()) => op.status = OperationStatus::Success,
                Err(err) => {
                    op.status = OperationStatus::Failure;
                    op.error = Some(err.to_string());
                }
            }
        }
    }

    /// Cancel a running operation. For Token-class operations this consumes
    /// the token.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let mut ops = self.ops.write().await;
        let op = ops
            .get_mut(&id)
            .ok_or_else(|| Error::BadRequest(format!("no operation {id}")))?;
        if op.status != OperationStatus::Running {
            return Err(Error::Cancelled);
        }
        op.status = OperationStatus::Cancelled;
        Ok(())
    }

    /// Remove a finished operation record.
    pub async fn remove(&self, id: Uuid) {
        self.ops.write().await.remove(&id);
    }
}

/// Spawn `fut` as a Task-class operation and return the running record.
pub async fn spawn_task<F>(
    registry: Arc<OpsRegistry>,
    kind: OperationKind,
    metadata: serde_json::Value,
    fut: F,
) -> Operation
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let op = registry.create(OperationClass::Task, kind, metadata).await;
    let id = op.id;
    tokio::spawn(async move {
        let outcome = fut.await;
        if let Err(err) = &outcome {
            tracing::warn!(operation = %id, kind = ?kind, "operation failed: {err}");
        }
        registry.finish(id, outcome).await;
    });
    op
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_completion() {
        let registry = Arc::new(OpsRegistry::new());
        let op = spawn_task(
            Arc::clone(&registry),
            OperationKind::ClusterBootstrap,
            serde_json::json!({}),
            async { Ok(()) },
        )
        .await;

        // Yield until the spawned task finishes.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if registry.get(op.id).await.unwrap().status != OperationStatus::Running {
                break;
            }
        }
        assert_eq!(
            registry.get(op.id).await.unwrap().status,
            OperationStatus::Success
        );
    }

    #[tokio::test]
    async fn test_token_cancel_consumes() {
        let registry = OpsRegistry::new();
        let op = registry
            .create(
                OperationClass::Token,
                OperationKind::ClusterJoinToken,
                serde_json::json!({"serverName": "b"}),
            )
            .await;

        registry.cancel(op.id).await.unwrap();
        assert!(registry.cancel(op.id).await.is_err());
        assert_eq!(
            registry.get(op.id).await.unwrap().status,
            OperationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_running_of_kind_filters() {
        let registry = OpsRegistry::new();
        let a = registry
            .create(
                OperationClass::Token,
                OperationKind::ClusterJoinToken,
                serde_json::json!({}),
            )
            .await;
        registry
            .create(
                OperationClass::Task,
                OperationKind::ClusterJoin,
                serde_json::json!({}),
            )
            .await;

        registry.cancel(a.id).await.unwrap();
        assert!(registry
            .running_of_kind(OperationKind::ClusterJoinToken)
            .await
            .is_empty());
        assert_eq!(
            registry.running_of_kind(OperationKind::ClusterJoin).await.len(),
            1
        );
    }
}
