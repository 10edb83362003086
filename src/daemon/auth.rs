use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use super::AppState;
use super::errors::ApiError;

pub const HEADER_API_KEY: &str = "x-api-key";
pub const QUERY_API_KEY: &str = "key";

/// Rejects requests without the configured API key before any handler (and
/// therefore the queue) sees them.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let accepted = extract_api_key(&req).is_some_and(|key| keys_match(&key, &state.api_key));
    if !accepted {
        tracing::warn!(
            method = %req.method(),
            path = %req.uri().path(),
            "rejected request with missing or invalid API key"
        );
        return Err(ApiError::unauthorized("Invalid or missing API key"));
    }

    Ok(next.run(req).await)
}

/// The `key` query parameter wins over the `X-API-Key` header.
fn extract_api_key(req: &Request<Body>) -> Option<String> {
    let from_query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(params)| params.get(QUERY_API_KEY).cloned())
        .filter(|key| !key.is_empty());

    from_query.or_else(|| {
        req.headers()
            .get(HEADER_API_KEY)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|key| !key.is_empty())
    })
}

pub fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
