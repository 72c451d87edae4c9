//! HTTP API Server
//!
//! REST API for cluster membership management. The public surface is what
//! operators and clients use; the `/internal/cluster/*` endpoints are the
//! leader/peer protocol and carry no stability promise.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::membership::{
    JoinRequest, LeaderCheck, MemberConfigEntry, MembershipCoordinator, MemberUpdateRequest,
    RemovalOutcome,
};
use crate::ops::{spawn_task, OperationClass, OperationKind};
use crate::store::RaftNode;

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<MembershipCoordinator>,
}

/// HTTP API server
pub struct ApiServer {
    bind_address: String,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(bind_address: String, coordinator: Arc<MembershipCoordinator>) -> Self {
        Self {
            bind_address,
            state: Arc::new(AppState { coordinator }),
        }
    }

    /// Create the router
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Public cluster surface
            .route("/cluster", get(handle_cluster_get).put(handle_cluster_put))
            .route(
                "/cluster/members",
                get(handle_members_get).post(handle_members_post),
            )
            .route(
                "/cluster/members/:name",
                get(handle_member_get)
                    .put(handle_member_put)
                    .patch(handle_member_put)
                    .post(handle_member_rename)
                    .delete(handle_member_delete),
            )
            .route("/cluster/certificate", put(handle_certificate_put))
            .route("/operations/:id", get(handle_operation_get))
            // Internal leader/peer protocol
            .route("/internal/cluster/accept", post(handle_accept))
            .route("/internal/cluster/assign", post(handle_assign))
            .route("/internal/cluster/rebalance", post(handle_rebalance))
            .route("/internal/cluster/handover", post(handle_handover))
            .route(
                "/internal/cluster/raft-node/:address",
                delete(handle_raft_node_delete),
            )
            .route("/internal/cluster/trust", post(handle_trust))
            .route("/internal/cluster/trust/:name", delete(handle_trust_delete))
            .route("/internal/cluster/resources", get(handle_resources))
            .route("/internal/cluster/certificates", get(handle_certificates))
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = Self::router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// `PUT /cluster` request
#[derive(Debug, Deserialize)]
pub struct ClusterPutRequest {
    #[serde(default)]
    pub server_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub cluster_address: String,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub cluster_certificate: String,
    #[serde(default)]
    pub cluster_password: Option<String>,
    #[serde(default)]
    pub join_token: Option<String>,
    #[serde(default)]
    pub member_config: Vec<MemberConfigEntry>,
}

/// `POST /cluster/members` request
#[derive(Debug, Deserialize)]
pub struct MembersPostRequest {
    pub server_name: String,
}

/// `POST /cluster/members/{name}` rename request
#[derive(Debug, Deserialize)]
pub struct MemberRenameRequest {
    pub server_name: String,
}

/// `PUT /cluster/certificate` request
#[derive(Debug, Deserialize)]
pub struct CertificatePutRequest {
    pub cluster_certificate: String,
    pub cluster_certificate_key: String,
}

/// `POST /internal/cluster/assign` request
#[derive(Debug, Serialize, Deserialize)]
pub struct AssignRequest {
    pub raft_nodes: Vec<RaftNode>,
}

/// `POST /internal/cluster/handover` request
#[derive(Debug, Serialize, Deserialize)]
pub struct HandoverRequest {
    pub address: String,
}

/// `POST /internal/cluster/trust` request (token redemption)
#[derive(Debug, Serialize, Deserialize)]
pub struct TrustPostRequest {
    pub name: String,
    pub secret: String,
    pub certificate: String,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// Error wrapper mapping the taxonomy onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::AlreadyClustered
            | Error::NotClustered
            | Error::Config(_)
            | Error::ConfigParse(_)
            | Error::ConfigMismatch { .. }
            | Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NameExists(_) | Error::AddressExists(_) => StatusCode::CONFLICT,
            Error::SchemaMismatch { .. } | Error::PreconditionFailed(_) => {
                StatusCode::PRECONDITION_FAILED
            }
            Error::TokenInvalid => StatusCode::FORBIDDEN,
            Error::MemberNotFound(_) => StatusCode::NOT_FOUND,
            Error::PeerUnreachable { .. } | Error::Transient(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Redirects carry the leader address in the Location header; the
        // caller re-issues the same request there.
        if let Error::NotLeader(leader) = &self.0 {
            return (
                status,
                [(header::LOCATION, format!("https://{leader}"))],
                Json(ErrorResponse {
                    error: self.0.to_string(),
                    code: status.as_u16(),
                }),
            )
                .into_response();
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: status.as_u16(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn redirect_to_leader(leader: &str, path: &str) -> Response {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, format!("https://{leader}{path}"))],
    )
        .into_response()
}

/// Whether a request is the fan-out leg of a cluster-wide change rather
/// than an operator call.
fn is_cluster_notification(headers: &HeaderMap) -> bool {
    headers
        .get("x-corral-notify")
        .map(|value| value == "1")
        .unwrap_or(false)
}

// ============ Public Handlers ============

async fn handle_cluster_get(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let info = state.coordinator.cluster_info().await?;
    Ok(Json(info).into_response())
}

async fn handle_cluster_put(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClusterPutRequest>,
) -> ApiResult<Response> {
    if req.server_name.is_empty() && req.enabled {
        return Err(Error::BadRequest("server_name is required when enabling clustering".into())
            .into());
    }
    if !req.server_name.is_empty() && !req.enabled {
        return Err(Error::BadRequest(
            "server_name must be empty when disabling clustering".into(),
        )
        .into());
    }

    // Disable clustering on this node.
    if !req.enabled {
        state.coordinator.disable_clustering().await?;
        return Ok(Json(serde_json::json!({})).into_response());
    }

    // Bootstrap a new cluster, or join an existing one.
    let coordinator = Arc::clone(&state.coordinator);
    let op = if req.cluster_address.is_empty() && req.join_token.is_none() {
        let server_name = req.server_name.clone();
        spawn_task(
            Arc::clone(coordinator.ops()),
            OperationKind::ClusterBootstrap,
            serde_json::json!({ "server_name": server_name }),
            async move { coordinator.bootstrap(&server_name).await },
        )
        .await
    } else {
        let join = JoinRequest {
            server_name: req.server_name.clone(),
            cluster_address: req.cluster_address.clone(),
            cluster_certificate: req.cluster_certificate.clone(),
            join_token: req.join_token.clone(),
            cluster_password: req.cluster_password.clone(),
            server_address: req.server_address.clone(),
            member_config: req.member_config.clone(),
        };
        spawn_task(
            Arc::clone(coordinator.ops()),
            OperationKind::ClusterJoin,
            serde_json::json!({ "server_name": req.server_name }),
            async move { coordinator.join(join).await },
        )
        .await
    };

    Ok((StatusCode::ACCEPTED, Json(op)).into_response())
}

async fn handle_members_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let views = state.coordinator.list_member_views().await?;

    let recursive = query.get("recursion").map(|r| r == "1").unwrap_or(false);
    if recursive {
        return Ok(Json(views).into_response());
    }

    let urls: Vec<String> = views
        .iter()
        .map(|view| format!("/cluster/members/{}", view.name))
        .collect();
    Ok(Json(urls).into_response())
}

async fn handle_members_post(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MembersPostRequest>,
) -> ApiResult<Response> {
    let token = state.coordinator.issue_join_token(&req.server_name).await?;

    // The token lives as a Token-class operation; return the record so the
    // client can read the token from its metadata.
    let op = state
        .coordinator
        .ops()
        .running_of_kind(OperationKind::ClusterJoinToken)
        .await
        .into_iter()
        .find(|op| {
            op.metadata.get("server_name").and_then(|v| v.as_str()) == Some(&req.server_name)
        })
        .ok_or_else(|| Error::Internal("join token operation vanished".into()))?;

    let mut body = serde_json::to_value(&op).map_err(Error::from)?;
    body["metadata"]["token"] = serde_json::Value::String(token.encode().map_err(ApiError::from)?);
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

async fn handle_member_get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let view = state.coordinator.get_member_view(&name).await?;
    let etag = MembershipCoordinator::member_etag(&view);
    Ok(([(header::ETAG, etag)], Json(view)).into_response())
}

async fn handle_member_put(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MemberUpdateRequest>,
) -> ApiResult<Response> {
    let etag = headers
        .get(header::IF_MATCH)
        .and_then(|value| value.to_str().ok());
    state.coordinator.update_member(&name, &req, etag).await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_member_rename(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<MemberRenameRequest>,
) -> ApiResult<Response> {
    state.coordinator.rename_member(&name, &req.server_name).await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_member_delete(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let force = query.get("force").map(|f| f == "1").unwrap_or(false);

    // Removal is tracked as an operation but runs within the request: a
    // forwarded self-removal carries the self-removal guard, which must not
    // drop before the response body has been produced.
    let ops = Arc::clone(state.coordinator.ops());
    let op = ops
        .create(
            OperationClass::Task,
            OperationKind::ClusterMemberRemove,
            serde_json::json!({ "member": name, "force": force }),
        )
        .await;

    let outcome = state.coordinator.remove_member(&name, force).await;
    match &outcome {
        Ok(_) => ops.finish(op.id, Ok(())).await,
        Err(err) => {
            ops.finish(op.id, Err(Error::Internal(err.to_string())))
                .await
        }
    }

    // Keep any self-removal guard alive until the response exists.
    let _outcome: RemovalOutcome = outcome?;

    let op = ops.get(op.id).await.unwrap_or(op);
    Ok(Json(op).into_response())
}

async fn handle_certificate_put(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CertificatePutRequest>,
) -> ApiResult<Response> {
    state
        .coordinator
        .rotate_certificate(
            &req.cluster_certificate,
            &req.cluster_certificate_key,
            is_cluster_notification(&headers),
        )
        .await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_operation_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| Error::BadRequest(format!("invalid operation id {id:?}")))?;
    let op = state
        .coordinator
        .ops()
        .get(id)
        .await
        .ok_or_else(|| Error::MemberNotFound(id.to_string()))?;
    Ok(Json(op).into_response())
}

// ============ Internal Handlers ============

async fn handle_accept(
    State(state): State<Arc<AppState>>,
    Json(req): Json<crate::transport::AcceptRequest>,
) -> ApiResult<Response> {
    if let LeaderCheck::Forward(leader) = state.coordinator.leader_check().await? {
        return Ok(redirect_to_leader(&leader, "/internal/cluster/accept"));
    }

    let accepted = state.coordinator.accept_member(&req).await?;
    Ok(Json(accepted).into_response())
}

async fn handle_assign(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<Response> {
    state.coordinator.handle_assign(&req.raft_nodes).await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_rebalance(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    if let LeaderCheck::Forward(leader) = state.coordinator.leader_check().await? {
        return Ok(redirect_to_leader(&leader, "/internal/cluster/rebalance"));
    }

    state.coordinator.rebalance().await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_handover(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HandoverRequest>,
) -> ApiResult<Response> {
    if let LeaderCheck::Forward(leader) = state.coordinator.leader_check().await? {
        return Ok(redirect_to_leader(&leader, "/internal/cluster/handover"));
    }

    state.coordinator.handover(&req.address).await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_raft_node_delete(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<Response> {
    state.coordinator.delete_raft_node(&address).await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_trust(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TrustPostRequest>,
) -> ApiResult<Response> {
    state
        .coordinator
        .handle_redeem(&req.name, &req.secret, &req.certificate)
        .await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_trust_delete(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.coordinator.handle_revoke_trust(&name).await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn handle_resources(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let db = state.coordinator.db().await;
    let resources = crate::transport::ClusterResources {
        storage_pools: db.list_storage_pools().await?,
        networks: db.list_networks().await?,
    };
    Ok(Json(resources).into_response())
}

async fn handle_certificates(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let certs = state.coordinator.trust().list_peer_certs().await?;
    Ok(Json(certs).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::AlreadyClustered, StatusCode::BAD_REQUEST),
            (Error::NameExists("a".into()), StatusCode::CONFLICT),
            (Error::AddressExists("x".into()), StatusCode::CONFLICT),
            (
                Error::SchemaMismatch { member: 3, cluster: 4 },
                StatusCode::PRECONDITION_FAILED,
            ),
            (Error::TokenInvalid, StatusCode::FORBIDDEN),
            (Error::MemberNotFound("a".into()), StatusCode::NOT_FOUND),
            (
                Error::NotLeader("10.0.0.1:8443".into()),
                StatusCode::TEMPORARY_REDIRECT,
            ),
        ];

        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_redirect_carries_location() {
        let response = ApiError(Error::NotLeader("10.0.0.1:8443".into())).into_response();
        let location = response.headers().get(header::LOCATION).unwrap();
        assert_eq!(location, "https://10.0.0.1:8443");
    }

    #[test]
    fn test_notification_header() {
        let mut headers = HeaderMap::new();
        assert!(!is_cluster_notification(&headers));
        headers.insert("x-corral-notify", "1".parse().unwrap());
        assert!(is_cluster_notification(&headers));
    }
}
