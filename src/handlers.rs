//! HTTP endpoints exposed by the allocator.
//!
//! The transport is deliberately thin: handlers extract the authenticated
//! sponsor (established upstream by the sign-in layer and forwarded in a
//! trusted header), hand the request to the [`AllocatorApi`], and translate
//! errors into HTTP responses. No admission logic lives here.

use alloy_primitives::{Address, B256};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::instrument;

use crate::service::{AdmissionError, AllocatorApi};
use crate::types::CompactSubmission;
use crate::validation;

/// Header carrying the session-verified sponsor address. Populated by the
/// sign-in proxy in front of this service; requests without it are treated as
/// unauthenticated.
pub const SESSION_ADDRESS_HEADER: &str = "x-session-address";

/// A flat error body, mirroring the service error's display form.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn routes<A>() -> Router<A>
where
    A: AllocatorApi + Clone + Send + Sync + 'static,
    A::Error: IntoResponse,
{
    Router::new()
        .route("/health", get(get_health))
        .route("/compact", post(post_compact::<A>))
        .route("/compact/{chain_id}/{claim_hash}", get(get_compact::<A>))
        .route("/compacts", get(get_compacts::<A>))
}

/// `GET /health`: liveness probe.
#[instrument(skip_all)]
pub async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": env!("CARGO_PKG_NAME") }))
}

/// `POST /compact`: admit a compact on behalf of the authenticated sponsor.
///
/// Responds with the claim hash, allocator signature, and the resolved nonce.
#[instrument(skip_all)]
pub async fn post_compact<A>(
    State(allocator): State<A>,
    headers: HeaderMap,
    Json(submission): Json<CompactSubmission>,
) -> Response
where
    A: AllocatorApi,
    A::Error: IntoResponse,
{
    let sponsor = match session_sponsor(&headers) {
        Ok(sponsor) => sponsor,
        Err(error) => return error.into_response(),
    };
    match allocator.admit(&submission, sponsor).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, chain_id = %submission.chain_id, "Admission rejected");
            error.into_response()
        }
    }
}

/// `GET /compact/{chainId}/{claimHash}`: look up one admitted compact.
#[instrument(skip_all)]
pub async fn get_compact<A>(
    State(allocator): State<A>,
    Path((chain_id, claim_hash)): Path<(String, String)>,
) -> Response
where
    A: AllocatorApi,
    A::Error: IntoResponse,
{
    let chain_id = match validation::assert_chain_id(&chain_id) {
        Ok(chain_id) => chain_id,
        Err(error) => return error.into_response(),
    };
    let claim_hash: B256 = match claim_hash.parse() {
        Ok(claim_hash) => claim_hash,
        Err(_) => {
            return AdmissionError::InvalidNumeric {
                field: "claimHash",
                detail: claim_hash,
            }
            .into_response();
        }
    };
    match allocator.lookup(chain_id, claim_hash).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no compact recorded under this claim hash".into(),
            }),
        )
            .into_response(),
        Err(error) => error.into_response(),
    }
}

/// `GET /compacts`: every compact admitted for the authenticated sponsor,
/// newest first.
#[instrument(skip_all)]
pub async fn get_compacts<A>(State(allocator): State<A>, headers: HeaderMap) -> Response
where
    A: AllocatorApi,
    A::Error: IntoResponse,
{
    let sponsor = match session_sponsor(&headers) {
        Ok(sponsor) => sponsor,
        Err(error) => return error.into_response(),
    };
    match allocator.list_by_sponsor(sponsor).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(error) => error.into_response(),
    }
}

fn session_sponsor(headers: &HeaderMap) -> Result<Address, AdmissionError> {
    let raw = headers
        .get(SESSION_ADDRESS_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AdmissionError::Unauthorised)?;
    raw.parse().map_err(|_| AdmissionError::InvalidAddress {
        field: "session",
        detail: raw.to_string(),
    })
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdmissionError::InvalidChainId(_)
            | AdmissionError::InvalidAddress { .. }
            | AdmissionError::InvalidAmount(_)
            | AdmissionError::InvalidNumeric { .. }
            | AdmissionError::WitnessInconsistent(_)
            | AdmissionError::Expired { .. }
            | AdmissionError::ExpiryTooFar { .. }
            | AdmissionError::ResetPeriodTooShort { .. }
            | AdmissionError::NonceMismatchSponsor
            | AdmissionError::NonceUsed
            | AdmissionError::LockNotFound
            | AdmissionError::ForcedWithdrawalEnabled { .. }
            | AdmissionError::AllocatorMismatch { .. }
            | AdmissionError::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
            AdmissionError::Unauthorised => StatusCode::FORBIDDEN,
            AdmissionError::Contention => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            // internal marker; never expected to escape the retry loop
            AdmissionError::NonceTaken => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
