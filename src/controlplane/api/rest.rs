//! REST API Handlers
//!
//! Exposes the reconciler operations of every endpoint type under
//! `/api/v2/{iscsi,nfs,nvme-of}`. Handlers are generic over the endpoint type;
//! only the route prefix differs.

use crate::controlplane::{Gateway, Reconciler};
use crate::domain::model::{parse_size_kib, VolumeConfig};
use crate::endpoints::Endpoint;
use crate::error::{Error, ErrorKind};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Body of `PUT .../{id}/volume/{nr}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    /// Size with unit (e.g., "5GiB")
    pub size: String,
    #[serde(default)]
    pub file_system: Option<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error wrapper mapping error kinds to HTTP statuses
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self.0.kind() {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation_failed"),
            ErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ErrorKind::Backend => (StatusCode::BAD_GATEWAY, "backend_error"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ApiErrorResponse {
                error: error.into(),
                message: self.0.to_string(),
                details: None,
            }),
        )
            .into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

fn not_found<E: Endpoint>(id: &E::Id) -> ApiError {
    ApiError(Error::not_found(E::PROTOCOL, id.to_string()))
}

fn found<E: Endpoint>(id: &E::Id, endpoint: Option<E>) -> ApiResult {
    match endpoint {
        Some(endpoint) => Ok((StatusCode::OK, Json(endpoint)).into_response()),
        None => Err(not_found::<E>(id)),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    gateway: Gateway,
}

impl RestRouter {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        Router::new()
            .nest("/api/v2/iscsi", endpoint_routes(self.gateway.iscsi))
            .nest("/api/v2/nfs", endpoint_routes(self.gateway.nfs))
            .nest("/api/v2/nvme-of", endpoint_routes(self.gateway.nvmeof))
            .route("/health", get(health_check))
    }
}

/// Routes of one endpoint type
fn endpoint_routes<E>(reconciler: Reconciler<E>) -> Router
where
    E: Endpoint + DeserializeOwned,
{
    Router::new()
        .route("/", get(list_endpoints::<E>).post(create_endpoint::<E>))
        .route("/:id", get(get_endpoint::<E>).delete(delete_endpoint::<E>))
        .route("/:id/start", post(start_endpoint::<E>))
        .route("/:id/stop", post(stop_endpoint::<E>))
        .route(
            "/:id/volume/:nr",
            put(add_volume::<E>).delete(delete_volume::<E>),
        )
        .with_state(reconciler)
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_endpoints<E: Endpoint>(State(reconciler): State<Reconciler<E>>) -> ApiResult {
    let endpoints = reconciler.list().await?;
    Ok((StatusCode::OK, Json(endpoints)).into_response())
}

async fn create_endpoint<E>(
    State(reconciler): State<Reconciler<E>>,
    Json(requested): Json<E>,
) -> ApiResult
where
    E: Endpoint + DeserializeOwned,
{
    info!("Creating {} {} via API", E::PROTOCOL, requested.id());
    let created = reconciler.create(requested).await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_endpoint<E: Endpoint>(
    State(reconciler): State<Reconciler<E>>,
    Path(raw): Path<String>,
) -> ApiResult {
    let id = E::parse_id(&raw)?;
    found(&id, reconciler.get(&id).await?)
}

async fn delete_endpoint<E: Endpoint>(
    State(reconciler): State<Reconciler<E>>,
    Path(raw): Path<String>,
) -> ApiResult {
    let id = E::parse_id(&raw)?;
    reconciler.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn start_endpoint<E: Endpoint>(
    State(reconciler): State<Reconciler<E>>,
    Path(raw): Path<String>,
) -> ApiResult {
    let id = E::parse_id(&raw)?;
    found(&id, reconciler.start(&id).await?)
}

async fn stop_endpoint<E: Endpoint>(
    State(reconciler): State<Reconciler<E>>,
    Path(raw): Path<String>,
) -> ApiResult {
    let id = E::parse_id(&raw)?;
    found(&id, reconciler.stop(&id).await?)
}

async fn add_volume<E: Endpoint>(
    State(reconciler): State<Reconciler<E>>,
    Path((raw, number)): Path<(String, u32)>,
    Json(request): Json<VolumeRequest>,
) -> ApiResult {
    let id = E::parse_id(&raw)?;
    let mut volume = VolumeConfig::new(number, parse_size_kib(&request.size)?);
    volume.file_system = request.file_system;
    found(&id, reconciler.add_volume(&id, volume).await?)
}

async fn delete_volume<E: Endpoint>(
    State(reconciler): State<Reconciler<E>>,
    Path((raw, number)): Path<(String, u32)>,
) -> ApiResult {
    let id = E::parse_id(&raw)?;
    found(&id, reconciler.delete_volume(&id, number).await?)
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{BackendFactory, InMemoryCluster};
    use crate::controlplane::WaitConfig;
    use crate::endpoints::NfsExport;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app() -> Router {
        let backends = BackendFactory::from_cluster(Arc::new(InMemoryCluster::new()));
        let wait = WaitConfig {
            timeout: Duration::from_millis(500),
            interval: Duration::from_millis(5),
        };
        RestRouter::new(Gateway::new(backends, wait, CancellationToken::new())).build()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn export1() -> serde_json::Value {
        serde_json::json!({
            "name": "export1",
            "service_ips": ["192.168.1.5/24"],
            "volumes": [{"number": 1, "size_kib": 2097152}]
        })
    }

    #[tokio::test]
    async fn test_nfs_lifecycle_over_http() {
        let app = app();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/v2/nfs", export1()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: NfsExport = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(created.status.service, crate::domain::model::ServiceState::Started);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/v2/nfs/export1/volume/2",
                serde_json::json!({"size": "5GiB"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "conflict");

        let response = app
            .clone()
            .oneshot(empty_request("POST", "/api/v2/nfs/export1/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/v2/nfs/export1/volume/2",
                serde_json::json!({"size": "5GiB"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/v2/nfs"))
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["volumes"][1]["size_kib"], 5 * 1024 * 1024);

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/v2/nfs/export1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", "/api/v2/nfs/export1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_identity_is_bad_request() {
        let response = app()
            .oneshot(empty_request("GET", "/api/v2/iscsi/not-an-iqn"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let response = app().oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
