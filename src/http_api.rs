//! HTTP surface used by the executor: pull the next command, post results,
//! read diagnostics.
//!
//! Handlers never hold relay state; each request is a round-trip through
//! the [`RelayHandle`] to the control loop.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::protocol::parse_completion;
use crate::relay::CompletionOutcome;
use crate::service::RelayHandle;

pub const API_KEY_ENV: &str = "COMMAND_RELAY_API_KEY";

#[derive(Clone)]
struct ApiState {
    relay: RelayHandle,
    api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn relay_api_router(relay: RelayHandle) -> axum::Router {
    relay_api_router_with_auth(relay, configured_api_key())
}

fn configured_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn relay_api_router_with_auth(relay: RelayHandle, api_key: Option<String>) -> axum::Router {
    use axum::{middleware, routing, Router};

    let state = ApiState {
        relay,
        api_key: api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let protected = Router::new()
        .route("/poll", routing::get(api_poll))
        .route("/response", routing::post(api_response))
        .route("/status", routing::get(api_status))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_auth_middleware,
        ));

    Router::new()
        .route("/health", routing::get(api_health))
        .merge(protected)
        .with_state(state)
}

fn unauthorized_error_envelope() -> Value {
    json!({
        "error": {
            "code": "unauthorized",
            "message": "Missing or invalid API key",
            "retryable": false,
            "statusCode": 401,
        }
    })
}

async fn api_auth_middleware(
    State(state): State<ApiState>,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    // X-API-Key header or Authorization: Bearer <token>
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });

    if provided != Some(expected) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(unauthorized_error_envelope()),
        ));
    }

    Ok(next.run(request).await)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn api_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "command-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn unavailable(error: impl ToString) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

/// `204` when there is nothing to do, otherwise exactly one command.
async fn api_poll(State(state): State<ApiState>) -> Response {
    match state.relay.poll().await {
        Ok(Some(command)) => (StatusCode::OK, Json(command)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => unavailable(error),
    }
}

/// Always `200` for a well-formed result, whether or not anyone was waiting.
async fn api_response(State(state): State<ApiState>, body: Bytes) -> Response {
    let result = match parse_completion(&body) {
        Ok(result) => result,
        Err(error) => {
            tracing::warn!(error = %error, "executor posted an unreadable result");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": error.to_string() })),
            )
                .into_response();
        }
    };

    match state.relay.complete(result).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "delivered": outcome == CompletionOutcome::Delivered,
            })),
        )
            .into_response(),
        Err(error) => unavailable(error),
    }
}

async fn api_status(State(state): State<ApiState>) -> Response {
    match state.relay.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => unavailable(error),
    }
}
