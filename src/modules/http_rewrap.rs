use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::federation::PEER_UNWRAP_PATH;
use crate::modules::ratelimit::RateLimiter;
use crate::rewrap::validation::MAX_REQUEST_BYTES;
use crate::rewrap::{RequestMeta, RewrapError, RewrapResponse, RewrapService};

pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";
const DPOP_HEADER: &str = "dpop";

/// Server state shared with the HTTP handlers
pub struct RewrapState {
    pub service: Arc<RewrapService>,
    pub limiter: RateLimiter,
    /// Public base URL; DPoP `htu` is this plus the request path.
    pub public_url: String,
}

/// Hint sent with retryable upstream timeouts
const UPSTREAM_RETRY_AFTER_SECS: u64 = 1;

/// Error body returned for every failure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
    #[serde(skip)]
    pub retry_after: Option<u64>,
}

pub fn status_for(error: &RewrapError) -> StatusCode {
    match error {
        RewrapError::MalformedRequest(_)
        | RewrapError::PolicyBindingMismatch { .. }
        | RewrapError::SignatureInvalid { .. }
        | RewrapError::SplitReconstructionFailure(_) => StatusCode::BAD_REQUEST,
        RewrapError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        RewrapError::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
        RewrapError::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
        RewrapError::KeyRecoveryFailure(_) => StatusCode::BAD_GATEWAY,
        RewrapError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RewrapError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        RewrapError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RewrapError> for ErrorResponse {
    fn from(error: RewrapError) -> Self {
        let retry_after = match &error {
            RewrapError::RateLimited { retry_after } => Some(*retry_after),
            e if e.is_retryable() => Some(UPSTREAM_RETRY_AFTER_SECS),
            _ => None,
        };
        ErrorResponse {
            error: error.code().to_string(),
            message: error.public_message(),
            status: status_for(&error),
            retry_after,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status;
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Query parameters for the public key endpoint
#[derive(Debug, Deserialize)]
pub struct PublicKeyQuery {
    pub kid: Option<String>,
}

pub fn router(state: Arc<RewrapState>) -> Router {
    Router::new()
        .route("/rewrap", post(rewrap_handler))
        .route("/kas/v2/rewrap", post(rewrap_handler))
        .route(PEER_UNWRAP_PATH, post(peer_unwrap_handler))
        .route("/kas_public_key", get(kas_public_key_handler))
        .route("/kas/v2/kas_public_key", get(kas_public_key_handler))
        .route("/healthz", get(health_handler))
        // One byte over the ceiling reaches the handler so it can answer
        // with the protocol's own 413 body.
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES + 1))
        .with_state(state)
}

/// Main rewrap endpoint handler
/// POST /rewrap
pub async fn rewrap_handler(
    State(state): State<Arc<RewrapState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<RewrapResponse>, ErrorResponse> {
    info!("Received rewrap request from {}", addr.ip());
    let source = addr.ip().to_string();
    state.limiter.check(&source).await?;

    let body = read_body(body, &headers)?;
    let meta = request_meta(&state.public_url, "POST", &uri, &source, &headers)?;
    let response = state
        .service
        .handle_rewrap(
            &body,
            access_token(&headers),
            header_str(&headers, DPOP_HEADER),
            &meta,
        )
        .await?;
    Ok(Json(response))
}

/// Share request from a federated KAS
/// POST /federation/unwrap
pub async fn peer_unwrap_handler(
    State(state): State<Arc<RewrapState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ErrorResponse> {
    debug!("Received peer unwrap request from {}", addr.ip());
    let source = addr.ip().to_string();
    state.limiter.check(&source).await?;

    let body = read_body(body, &headers)?;
    let meta = request_meta(&state.public_url, "POST", &uri, &source, &headers)?;
    let response = state
        .service
        .handle_peer_unwrap(&body, access_token(&headers), &meta)
        .await?;
    Ok(Json(response).into_response())
}

/// KAS public key endpoint handler
/// GET /kas_public_key?kid=...
pub async fn kas_public_key_handler(
    State(state): State<Arc<RewrapState>>,
    Query(params): Query<PublicKeyQuery>,
) -> Result<String, ErrorResponse> {
    let kid = params
        .kid
        .ok_or_else(|| RewrapError::MalformedRequest("kid query parameter is required".to_string()))?;
    Ok(state.service.public_key(&kid).await?)
}

pub async fn health_handler() -> &'static str {
    "ok"
}

fn read_body(body: Result<Bytes, BytesRejection>, headers: &HeaderMap) -> Result<Bytes, RewrapError> {
    match body {
        Ok(bytes) => Ok(bytes),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            let size = header_str(headers, header::CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse().ok())
                .unwrap_or(MAX_REQUEST_BYTES + 1);
            Err(RewrapError::PayloadTooLarge {
                size,
                max: MAX_REQUEST_BYTES,
            })
        }
        Err(rejection) => Err(RewrapError::MalformedRequest(format!(
            "unreadable body: {}",
            rejection.body_text()
        ))),
    }
}

fn request_meta(
    public_url: &str,
    method: &str,
    uri: &Uri,
    source: &str,
    headers: &HeaderMap,
) -> Result<RequestMeta, RewrapError> {
    let deadline = match header_str(headers, REQUEST_TIMEOUT_HEADER) {
        Some(value) => {
            let millis: u64 = value.trim().parse().map_err(|_| {
                RewrapError::MalformedRequest(format!("{} must be an integer", REQUEST_TIMEOUT_HEADER))
            })?;
            Some(Duration::from_millis(millis))
        }
        None => None,
    };
    Ok(RequestMeta {
        method: method.to_string(),
        url: format!("{}{}", public_url.trim_end_matches('/'), uri.path()),
        source_addr: source.to_string(),
        deadline,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Token from `Authorization: Bearer ...` or `Authorization: DPoP ...`.
pub fn access_token(headers: &HeaderMap) -> Option<&str> {
    let value = header_str(headers, header::AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    (scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("dpop")).then_some(token)
}
