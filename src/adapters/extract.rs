//! Request extractors shared by the handlers.
use axum::{
    body::to_bytes,
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
};
use eyre::eyre;
use serde::de::DeserializeOwned;
use serde_json::error::Category;

use crate::{adapters::error::ApiError, adapters::state::AppState, core::auth::RequestContext};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1_048_576;

/// JSON request body, read under the configured read timeout.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

impl<T> FromRequest<AppState> for JsonBody<T>
where
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let read_timeout = state.config.timeouts.read();

        let bytes = tokio::time::timeout(read_timeout, to_bytes(req.into_body(), MAX_BODY_BYTES))
            .await
            .map_err(|_| ApiError::BadRequest("body was not received in time".to_string()))?
            // the limit is the only failure a well-behaved client can cause
            .map_err(|_| {
                ApiError::BadRequest(format!(
                    "body must not be larger than {MAX_BODY_BYTES} bytes"
                ))
            })?;

        if bytes.is_empty() {
            return Err(ApiError::BadRequest("body must not be empty".to_string()));
        }

        serde_json::from_slice(&bytes)
            .map(JsonBody)
            .map_err(|e| ApiError::BadRequest(describe_json_error(&e)))
    }
}

fn describe_json_error(e: &serde_json::Error) -> String {
    match e.classify() {
        Category::Eof => "body contains badly-formed JSON".to_string(),
        Category::Syntax if e.to_string().starts_with("trailing characters") => {
            "body must only contain a single JSON value".to_string()
        }
        Category::Syntax => format!("body contains badly-formed JSON (at character {})", e.column()),
        Category::Data => format!("body contains incorrect JSON: {e}"),
        Category::Io => "body could not be read".to_string(),
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Only reachable if a route was mounted outside the authentication stage.
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| ApiError::server(eyre!("request context missing from request")))
    }
}

/// Parse a `{id}` path segment. Anything that is not a positive integer is
/// treated as a missing resource.
pub fn parse_id(raw: &str) -> Result<i64, ApiError> {
    match raw.parse::<i64>() {
        Ok(id) if id >= 1 => Ok(id),
        _ => Err(ApiError::NotFound),
    }
}
