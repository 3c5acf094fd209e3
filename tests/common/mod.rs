// Shared helpers for the integration tests
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use chrono::TimeDelta;
use cinedex::{
    AppState, BackgroundTasks, LogMailer, MemoryStore, build_router,
    config::ServerConfig,
    core::{
        token::{Token, TokenScope},
        user::{NewUser, PasswordHash, User},
    },
    ports::store::Models,
};
use once_cell::sync::Lazy;
use tower::ServiceExt; // for oneshot

pub const SEED_PASSWORD: &str = "pa55word-for-tests";

// Argon2 is slow in debug builds; every seeded user shares one hash.
static SEED_HASH: Lazy<PasswordHash> =
    Lazy::new(|| PasswordHash::from_plaintext(SEED_PASSWORD).unwrap());

pub fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50_000))
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub mailer: Arc<LogMailer>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

impl TestResponse {
    pub fn vary(&self) -> Vec<String> {
        self.headers
            .get_all(header::VARY)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(',').map(|s| s.trim().to_string()))
            .collect()
    }

    pub fn error(&self) -> &str {
        self.body["error"].as_str().unwrap_or_default()
    }
}

impl TestApp {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_models(config, MemoryStore::models())
    }

    pub fn with_models(config: ServerConfig, models: Models) -> Self {
        let mailer = Arc::new(LogMailer::new(config.mailer.sender.clone()));
        let state = AppState::new(config, models, mailer.clone(), BackgroundTasks::new());
        let router = build_router(state.clone());
        Self {
            state,
            router,
            mailer,
        }
    }

    pub async fn send(&self, req: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Insert a user directly and issue them an authentication token.
    pub async fn seed_user(&self, email: &str, activated: bool, permissions: &[&str]) -> (User, String) {
        let models = &self.state.models;
        let user = models
            .users
            .insert(NewUser {
                name: "Seeded".to_string(),
                email: email.to_string(),
                password: SEED_HASH.clone(),
                activated,
            })
            .await
            .unwrap();
        if !permissions.is_empty() {
            models.permissions.add_for_user(user.id, permissions).await.unwrap();
        }

        let token = Token::generate(user.id, TimeDelta::hours(1), TokenScope::Authentication);
        models.tokens.insert(&token).await.unwrap();
        (user, token.plaintext)
    }
}

pub fn request(method: Method, uri: &str) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(peer()));
    req
}

pub fn get(uri: &str) -> Request<Body> {
    request(Method::GET, uri)
}

pub fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(peer()));
    req
}

pub fn with_bearer(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
    req
}

pub fn with_header(mut req: Request<Body>, name: &'static str, value: &str) -> Request<Body> {
    req.headers_mut().insert(name, value.parse().unwrap());
    req
}

/// Config with the limiter out of the way unless a test turns it on.
pub fn quiet_config() -> ServerConfig {
    ServerConfig::builder().limiter(false, 2.0, 4).build()
}
