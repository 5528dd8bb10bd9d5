//! HTTP API for the coordinator
//!
//! Read endpoints serve state snapshots for dashboards; write endpoints
//! drive the engine's proposal and instance operations. Paths mirror the
//! relay pool's layout so a proposal is addressed the same way on both
//! sides.

use crate::coordination::proposal::ProposalKey;
use crate::coordination::MultisigCoordinator;
use crate::error::CoordinatorError;
use crate::relay::PoolSignature;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use ethers::types::{Address, Bytes, H256, U256};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub fn router(engine: Arc<MultisigCoordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/proposals", get(proposals).post(create_proposal))
        .route(
            "/proposals/:instance/:nonce/:hash/signatures",
            post(sign_proposal),
        )
        .route("/proposals/:instance/:nonce/:hash/submit", post(submit_proposal))
        .route("/instances", post(create_instance))
        .route("/instance/active", put(select_instance))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serve the API on the configured host and port.
pub async fn serve(engine: Arc<MultisigCoordinator>, host: String, port: u16) {
    let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind API server on {}:{}: {}", host, port, e);
            return;
        }
    };
    info!("API server listening on {}:{}", host, port);

    if let Err(e) = axum::serve(listener, router(engine)).await {
        error!("API server error: {}", e);
    }
}

/// Engine errors carried to HTTP. Input problems map to 4xx, upstream
/// failures to 502, everything else to 500.
#[derive(Debug)]
struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn status_for(e: &CoordinatorError) -> StatusCode {
    match e {
        CoordinatorError::UnknownInstance { .. } => StatusCode::NOT_FOUND,
        // The request was well-formed but lost a race: another signature,
        // another submission, or an instance switch got there first.
        CoordinatorError::DuplicateSignature { .. }
        | CoordinatorError::StaleProposal { .. }
        | CoordinatorError::SubmissionInProgress { .. } => StatusCode::CONFLICT,
        e if e.is_input_error() => StatusCode::BAD_REQUEST,
        CoordinatorError::ChainConnection(_)
        | CoordinatorError::Relay(_)
        | CoordinatorError::Timeout { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct NewProposal {
    instance: String,
    to: String,
    /// Wei amount as a decimal string, zero when absent.
    #[serde(default)]
    value: Option<String>,
    /// Calldata as hex, empty when absent.
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewInstance {
    owners: Vec<String>,
    signatures_required: u64,
    #[serde(default)]
    funding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActiveInstance {
    instance: String,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn status(State(engine): State<Arc<MultisigCoordinator>>) -> impl IntoResponse {
    Json(engine.status().await)
}

async fn proposals(State(engine): State<Arc<MultisigCoordinator>>) -> impl IntoResponse {
    Json(engine.proposal_snapshots().await)
}

async fn create_proposal(
    State(engine): State<Arc<MultisigCoordinator>>,
    Json(body): Json<NewProposal>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = parse_address(&body.instance)?;
    let to = parse_address(&body.to)?;
    let value = parse_value(body.value.as_deref())?;
    let data = parse_calldata(body.data.as_deref())?;

    let key = engine.create_proposal(instance, to, value, data).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "instance": format!("{:?}", key.instance),
            "nonce": key.nonce,
            "payload_hash": format!("{:?}", key.payload_hash),
        })),
    ))
}

async fn sign_proposal(
    State(engine): State<Arc<MultisigCoordinator>>,
    Path((instance, nonce, hash)): Path<(String, u64, String)>,
    Json(body): Json<PoolSignature>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&instance, nonce, &hash)?;
    let owner = parse_address(&body.owner)?;
    let signature = parse_hex(&body.signature, "signature")?;

    let status = engine.sign_proposal(key, owner, signature).await?;
    Ok(Json(json!({ "status": status.as_str() })))
}

async fn submit_proposal(
    State(engine): State<Arc<MultisigCoordinator>>,
    Path((instance, nonce, hash)): Path<(String, u64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&instance, nonce, &hash)?;
    engine.submit_proposal(key).await?;
    Ok(Json(json!({ "status": "confirmed" })))
}

async fn create_instance(
    State(engine): State<Arc<MultisigCoordinator>>,
    Json(body): Json<NewInstance>,
) -> Result<impl IntoResponse, ApiError> {
    let funding = parse_value(body.funding.as_deref())?;
    let instance = engine
        .create_instance(&body.owners, body.signatures_required, funding)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "instance": format!("{:?}", instance) })),
    ))
}

async fn select_instance(
    State(engine): State<Arc<MultisigCoordinator>>,
    Json(body): Json<ActiveInstance>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = parse_address(&body.instance)?;
    engine.select_instance(instance).await?;
    Ok(Json(json!({ "active": format!("{:?}", instance) })))
}

fn parse_key(instance: &str, nonce: u64, hash: &str) -> Result<ProposalKey, ApiError> {
    Ok(ProposalKey {
        instance: parse_address(instance)?,
        nonce,
        payload_hash: H256::from_str(hash).map_err(|e| {
            ApiError(CoordinatorError::Validation(format!(
                "bad payload hash {}: {}",
                hash, e
            )))
        })?,
    })
}

fn parse_address(s: &str) -> Result<Address, ApiError> {
    Address::from_str(s).map_err(|e| {
        ApiError(CoordinatorError::Validation(format!(
            "bad address {}: {}",
            s, e
        )))
    })
}

fn parse_value(s: Option<&str>) -> Result<U256, ApiError> {
    match s {
        None => Ok(U256::zero()),
        Some(v) => U256::from_dec_str(v).map_err(|e| {
            ApiError(CoordinatorError::Validation(format!("bad value {}: {}", v, e)))
        }),
    }
}

fn parse_calldata(s: Option<&str>) -> Result<Bytes, ApiError> {
    match s {
        None => Ok(Bytes::new()),
        Some(data) => parse_hex(data, "calldata").map(Bytes::from),
    }
}

fn parse_hex(s: &str, what: &str) -> Result<Vec<u8>, ApiError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| {
        ApiError(CoordinatorError::Validation(format!(
            "bad {} hex: {}",
            what, e
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::engine::testkit;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&CoordinatorError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CoordinatorError::UnknownInstance {
                address: "0x".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CoordinatorError::StaleProposal {
                key: "k".into(),
                reason: "r".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CoordinatorError::SubmissionInProgress {
                instance: "0x".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CoordinatorError::Relay("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&CoordinatorError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_value_and_calldata_parsing() {
        assert_eq!(parse_value(None).unwrap(), U256::zero());
        assert_eq!(parse_value(Some("1000")).unwrap(), U256::from(1000u64));
        assert!(parse_value(Some("0x10")).is_err());

        assert_eq!(parse_calldata(None).unwrap(), Bytes::new());
        assert_eq!(
            parse_calldata(Some("0xcafe")).unwrap(),
            Bytes::from(vec![0xca, 0xfe])
        );
        assert!(parse_calldata(Some("zz")).is_err());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (engine, _stream) = testkit::coordinator().await;
        let response = router(engine)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_proposal_endpoint_roundtrip() {
        let (engine, _stream) = testkit::coordinator().await;
        let instance = Address::repeat_byte(0x11);
        testkit::feed(&engine, testkit::created(instance, 1, 10)).await;

        let body = json!({
            "instance": format!("{:?}", instance),
            "to": format!("{:?}", Address::repeat_byte(0xee)),
            "value": "42",
            "data": "0xcafe",
        });
        let request = Request::builder()
            .method("POST")
            .uri("/proposals")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router(engine.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let snapshots = engine.proposal_snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].nonce, 0);
    }

    #[tokio::test]
    async fn test_proposal_for_inactive_instance_rejected() {
        let (engine, _stream) = testkit::coordinator().await;
        testkit::feed(&engine, testkit::created(Address::repeat_byte(0x11), 1, 10)).await;

        let body = json!({
            "instance": format!("{:?}", Address::repeat_byte(0x22)),
            "to": format!("{:?}", Address::repeat_byte(0xee)),
        });
        let request = Request::builder()
            .method("POST")
            .uri("/proposals")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router(engine).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
