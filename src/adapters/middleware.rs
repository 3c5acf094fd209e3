//! The request pipeline stages.
//!
//! Each stage is a plain async function taking the request, the rest of the
//! chain and whatever shared state it needs, plus a `create_*_middleware`
//! constructor returning a cloneable closure for `axum::middleware::from_fn`.
//! `server::build_router` fixes their order.
use std::{future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc, time::Instant};

use axum::{
    Json,
    extract::Request,
    http::{
        HeaderValue, Method, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_REQUEST_METHOD, AUTHORIZATION, CONNECTION, ORIGIN, VARY,
        },
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use eyre::eyre;
use futures_util::FutureExt;
use serde_json::json;
use tracing::Instrument;

use crate::{
    adapters::error::{ApiError, SERVER_ERROR_MESSAGE},
    core::{
        auth::{Gate, RequestContext, authorize, resolve_principal},
        rate_limiter::{ClientRegistry, client_identity},
    },
    metrics::RequestMetrics,
    ports::store::{PermissionStore, UserStore},
    tracing_setup::create_request_span,
    utils::background::panic_message,
};

/// Boxed future returned by the closures handed to `from_fn`.
pub type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

const PREFLIGHT_ALLOW_METHODS: &str = "POST, PUT, PATCH, DELETE";
const PREFLIGHT_ALLOW_HEADERS: &str = "Authorization, Content-Type";

/// Turn a panic anywhere further down the chain into a 500 and ask the client
/// to drop the connection.
pub async fn recover_panic(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            tracing::error!(
                http.method = %method,
                http.uri = %uri,
                panic = %panic_message(panic.as_ref()),
                "Recovered from panic while serving request"
            );

            let mut response = (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": SERVER_ERROR_MESSAGE })),
            )
                .into_response();
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
            response
        }
    }
}

/// Count the request, run the rest of the chain inside a request span and
/// record status and latency.
pub async fn track_metrics(req: Request, next: Next, metrics: Arc<RequestMetrics>) -> Response {
    let start = Instant::now();
    metrics.record_request();

    let span = create_request_span(req.method().as_str(), req.uri().path());
    let response = next.run(req).instrument(span.clone()).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    span.record("http.status_code", status);
    span.record("duration_ms", elapsed.as_millis() as u64);
    metrics.record_response(status, elapsed);

    response
}

pub fn create_metrics_middleware(
    metrics: Arc<RequestMetrics>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    move |req, next| {
        let metrics = metrics.clone();
        Box::pin(async move { track_metrics(req, next, metrics).await })
    }
}

/// Per-client token bucket check. `registry` is `None` when rate limiting is
/// switched off, in which case nothing is recorded.
pub async fn rate_limit(req: Request, next: Next, registry: Option<Arc<ClientRegistry>>) -> Response {
    let Some(registry) = registry else {
        return next.run(req).await;
    };

    let Some(identity) = client_identity(&req) else {
        return ApiError::server(eyre!("unable to determine client address")).into_response();
    };

    if !registry.check(&identity) {
        tracing::debug!(client = %identity, "Rate limit exceeded");
        return ApiError::RateLimitExceeded.into_response();
    }

    next.run(req).await
}

pub fn create_rate_limit_middleware(
    registry: Option<Arc<ClientRegistry>>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    move |req, next| {
        let registry = registry.clone();
        Box::pin(async move { rate_limit(req, next, registry).await })
    }
}

/// Credentialed CORS for an exact-match allow list of origins, including
/// preflight short-circuiting.
pub async fn enable_cors(req: Request, next: Next, trusted_origins: Arc<Vec<String>>) -> Response {
    let allowed_origin = req
        .headers()
        .get(ORIGIN)
        .filter(|origin| {
            origin
                .to_str()
                .is_ok_and(|origin| !origin.is_empty() && trusted_origins.iter().any(|t| t == origin))
        })
        .cloned();

    let is_preflight = allowed_origin.is_some()
        && req.method() == Method::OPTIONS
        && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD);

    let mut response = if is_preflight {
        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(PREFLIGHT_ALLOW_METHODS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(PREFLIGHT_ALLOW_HEADERS),
        );
        response
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.append(VARY, HeaderValue::from_static("Origin"));
    if let Some(origin) = allowed_origin {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }

    response
}

pub fn create_cors_middleware(
    trusted_origins: Arc<Vec<String>>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    move |req, next| {
        let trusted_origins = trusted_origins.clone();
        Box::pin(async move { enable_cors(req, next, trusted_origins).await })
    }
}

/// Resolve the bearer token into a principal and attach a [`RequestContext`]
/// to the request. Anonymous requests carry one too.
pub async fn authenticate(mut req: Request, next: Next, users: Arc<dyn UserStore>) -> Response {
    let header = req.headers().get(AUTHORIZATION).cloned();

    let mut response = match resolve_principal(users.as_ref(), header.as_ref()).await {
        Ok(principal) => {
            req.extensions_mut().insert(RequestContext { principal });
            next.run(req).await
        }
        Err(failure) => ApiError::from(failure).into_response(),
    };

    response
        .headers_mut()
        .append(VARY, HeaderValue::from_static("Authorization"));
    response
}

pub fn create_authenticate_middleware(
    users: Arc<dyn UserStore>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    move |req, next| {
        let users = users.clone();
        Box::pin(async move { authenticate(req, next, users).await })
    }
}

/// Enforce `gate` for the principal attached by [`authenticate`].
pub async fn require_gate(
    req: Request,
    next: Next,
    gate: Gate,
    permissions: Arc<dyn PermissionStore>,
) -> Response {
    let Some(principal) = req
        .extensions()
        .get::<RequestContext>()
        .map(|context| context.principal.clone())
    else {
        return ApiError::server(eyre!("request context missing before authorization"))
            .into_response();
    };

    let outcome = authorize(&principal, gate, permissions.as_ref()).await;
    match outcome {
        Ok(()) => next.run(req).await,
        Err(denial) => ApiError::from(denial).into_response(),
    }
}

fn create_gate_middleware(
    gate: Gate,
    permissions: Arc<dyn PermissionStore>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    move |req, next| {
        let permissions = permissions.clone();
        Box::pin(async move { require_gate(req, next, gate, permissions).await })
    }
}

/// Anonymous requests get 401.
pub fn require_authenticated_user(
    permissions: Arc<dyn PermissionStore>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    create_gate_middleware(Gate::Authenticated, permissions)
}

/// Anonymous requests get 401, inactive accounts 403.
pub fn require_activated_user(
    permissions: Arc<dyn PermissionStore>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    create_gate_middleware(Gate::Activated, permissions)
}

/// Activated users holding `code` pass; everyone else is refused.
pub fn require_permission(
    code: &'static str,
    permissions: Arc<dyn PermissionStore>,
) -> impl Fn(Request, Next) -> MiddlewareFuture + Clone {
    create_gate_middleware(Gate::Permission(code), permissions)
}
