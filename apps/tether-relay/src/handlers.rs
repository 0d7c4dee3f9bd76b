use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tether_core::{TokenClaims, TokenScope};
use tracing::{debug, warn};

use crate::{error::RelayError, server::SharedState};

/// Query string accepted by bearer-protected routes.
#[derive(Debug, Default, Deserialize)]
pub struct CredentialQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub endpoints: usize,
    pub controllers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientList {
    pub clients: Vec<String>,
}

pub async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "tether-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        endpoints: state.registry.endpoint_count(),
        controllers: state.registry.controller_count(),
    })
}

/// Endpoint ids the operator console renders.
pub async fn control_handler(
    State(state): State<SharedState>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
) -> Result<Json<ClientList>, RelayError> {
    authorize_controller(&state, &headers, query.token.as_deref())?;
    Ok(Json(ClientList {
        clients: state.registry.endpoint_ids(),
    }))
}

pub async fn metrics_handler(State(state): State<SharedState>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Address filtering followed by rate limiting, applied to every request.
pub async fn admission_guard(
    State(state): State<SharedState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = remote_addr.ip();
    if !state.config.address_permitted(&ip) {
        warn!(remote_addr = %remote_addr, path = %request.uri().path(), "address rejected");
        return RelayError::AddressRejected(ip).into_response();
    }
    if let Err(err) = state.limiter.admit(ip) {
        return err.into_response();
    }
    next.run(request).await
}

/// Verify a controller-scoped bearer credential from the `Authorization`
/// header, falling back to the `token` query parameter.
pub fn authorize_controller(
    state: &SharedState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<TokenClaims, RelayError> {
    let result = bearer_token(headers)
        .or(query_token)
        .filter(|token| !token.is_empty())
        .ok_or(RelayError::MissingCredentials)
        .and_then(|token| {
            state
                .issuer
                .verify_scoped(token, TokenScope::Controller)
                .map_err(RelayError::from)
        });

    match &result {
        Ok(claims) => debug!(subject = claims.subject_id(), "controller credential accepted"),
        Err(err) => {
            warn!(error = %err, "controller credential rejected");
            counter!("tether_relay_auth_failures_total", "reason" => err.kind()).increment(1);
        }
    }
    result
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
}
