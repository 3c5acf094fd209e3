//! Route handlers. Access rules are attached in `server::build_router`, so a
//! handler only runs once its gate has passed.
use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::LOCATION},
    response::{IntoResponse, Response},
};
use chrono::TimeDelta;
use eyre::WrapErr;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;

use crate::{
    adapters::{
        error::ApiError,
        extract::{JsonBody, parse_id},
        state::AppState,
    },
    core::{
        auth::{MOVIES_READ, RequestContext},
        movie::{MovieInput, MoviePatch, validate_movie},
        token::{Token, TokenScope, validate_token_plaintext},
        user::{
            NewUser, PasswordHash, validate_email, validate_password_plaintext,
            validate_registration,
        },
        validator::Validator,
    },
    ports::{
        mailer::WelcomeEmail,
        store::{StoreError, bounded},
    },
};

/// Lifetime of the token mailed at registration.
pub const ACTIVATION_TOKEN_TTL: TimeDelta = TimeDelta::days(3);
/// Lifetime of a bearer token issued by `POST /v1/tokens/authentication`.
pub const AUTHENTICATION_TOKEN_TTL: TimeDelta = TimeDelta::hours(24);

/// Optional request header carrying the movie version a client last saw.
pub const EXPECTED_VERSION_HEADER: &str = "x-expected-version";

fn ensure_valid(v: Validator) -> Result<(), ApiError> {
    if v.valid() {
        Ok(())
    } else {
        Err(ApiError::FailedValidation(v.into_errors()))
    }
}

fn field_error(key: &str, message: &str) -> ApiError {
    ApiError::FailedValidation(BTreeMap::from([(key.to_string(), message.to_string())]))
}

pub async fn healthcheck(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "available",
        "system_info": {
            "environment": state.config.env.to_string(),
            "version": env!("CARGO_PKG_VERSION"),
        }
    }))
}

pub async fn list_movies(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let movies = bounded(state.models.movies.list()).await?;
    Ok(Json(json!({ "movies": movies })))
}

pub async fn create_movie(
    State(state): State<AppState>,
    context: RequestContext,
    JsonBody(input): JsonBody<MovieInput>,
) -> Result<Response, ApiError> {
    let mut v = Validator::new();
    validate_movie(&mut v, &input);
    ensure_valid(v)?;

    let movie = bounded(state.models.movies.insert(input)).await?;
    tracing::info!(
        movie.id = movie.id,
        user.id = context.principal.user().map(|u| u.id),
        "Movie created"
    );

    let location = HeaderValue::from_str(&format!("/v1/movies/{}", movie.id))
        .wrap_err("building Location header")?;
    Ok((
        StatusCode::CREATED,
        [(LOCATION, location)],
        Json(json!({ "movie": movie })),
    )
        .into_response())
}

pub async fn show_movie(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&raw_id)?;
    let movie = bounded(state.models.movies.get(id)).await?;
    Ok(Json(json!({ "movie": movie })))
}

pub async fn update_movie(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
    JsonBody(patch): JsonBody<MoviePatch>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&raw_id)?;
    let mut movie = bounded(state.models.movies.get(id)).await?;

    if let Some(expected) = headers.get(EXPECTED_VERSION_HEADER) {
        let current = movie.version.to_string();
        if expected.to_str().ok() != Some(current.as_str()) {
            return Err(ApiError::EditConflict);
        }
    }

    let mut input = MovieInput::from(&movie);
    patch.apply(&mut input);

    let mut v = Validator::new();
    validate_movie(&mut v, &input);
    ensure_valid(v)?;

    movie.title = input.title;
    movie.year = input.year;
    movie.runtime = input.runtime;
    movie.genres = input.genres;

    let movie = bounded(state.models.movies.update(&movie)).await?;
    Ok(Json(json!({ "movie": movie })))
}

pub async fn delete_movie(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&raw_id)?;
    bounded(state.models.movies.delete(id)).await?;
    Ok(Json(json!({ "message": "movie successfully deleted" })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterUserRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

pub async fn register_user(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<RegisterUserRequest>,
) -> Result<Response, ApiError> {
    let mut v = Validator::new();
    validate_registration(&mut v, &body.name, &body.email, &body.password);
    ensure_valid(v)?;

    let password = body.password;
    let hash = tokio::task::spawn_blocking(move || PasswordHash::from_plaintext(&password))
        .await
        .wrap_err("password hashing task failed")?
        .wrap_err("hashing password")?;

    let new_user = NewUser {
        name: body.name,
        email: body.email,
        password: hash,
        activated: false,
    };
    let user = match bounded(state.models.users.insert(new_user)).await {
        Ok(user) => user,
        Err(StoreError::DuplicateEmail) => {
            return Err(field_error(
                "email",
                "a user with this email address already exists",
            ));
        }
        Err(e) => return Err(e.into()),
    };

    bounded(state.models.permissions.add_for_user(user.id, &[MOVIES_READ])).await?;

    let token = Token::generate(user.id, ACTIVATION_TOKEN_TTL, TokenScope::Activation);
    bounded(state.models.tokens.insert(&token)).await?;

    let mailer = state.mailer.clone();
    let recipient = user.email.clone();
    let email = WelcomeEmail {
        user_id: user.id,
        name: user.name.clone(),
        activation_token: token.plaintext,
    };
    state.tasks.run("welcome_email", async move {
        mailer
            .send_welcome(&recipient, &email)
            .await
            .wrap_err_with(|| format!("sending welcome email to user {}", email.user_id))
    });

    tracing::info!(user.id = user.id, "User registered");
    Ok((StatusCode::ACCEPTED, Json(json!({ "user": user }))).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivateUserRequest {
    #[serde(default)]
    pub token: String,
}

pub async fn activate_user(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<ActivateUserRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut v = Validator::new();
    validate_token_plaintext(&mut v, &body.token);
    ensure_valid(v)?;

    let mut user = match bounded(
        state
            .models
            .users
            .get_for_token(TokenScope::Activation, &body.token),
    )
    .await
    {
        Ok(user) => user,
        Err(StoreError::NotFound) => {
            return Err(field_error("token", "invalid or expired activation token"));
        }
        Err(e) => return Err(e.into()),
    };

    user.activated = true;
    let user = bounded(state.models.users.update(&user)).await?;

    bounded(
        state
            .models
            .tokens
            .delete_all_for_user(TokenScope::Activation, user.id),
    )
    .await?;

    tracing::info!(user.id = user.id, "User activated");
    Ok(Json(json!({ "user": user })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

pub async fn create_authentication_token(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<CreateTokenRequest>,
) -> Result<Response, ApiError> {
    let mut v = Validator::new();
    validate_email(&mut v, &body.email);
    validate_password_plaintext(&mut v, &body.password);
    ensure_valid(v)?;

    let user = match bounded(state.models.users.get_by_email(&body.email)).await {
        Ok(user) => user,
        Err(StoreError::NotFound) => return Err(ApiError::InvalidCredentials),
        Err(e) => return Err(e.into()),
    };

    let hash = user.password.clone();
    let password = body.password;
    let matches = tokio::task::spawn_blocking(move || hash.matches(&password))
        .await
        .wrap_err("password check task failed")?
        .wrap_err("checking password")?;
    if !matches {
        return Err(ApiError::InvalidCredentials);
    }

    let token = Token::generate(user.id, AUTHENTICATION_TOKEN_TTL, TokenScope::Authentication);
    bounded(state.models.tokens.insert(&token)).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "authentication_token": token })),
    )
        .into_response())
}

pub async fn debug_vars(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "requests": state.metrics.snapshot(),
        "tracked_clients": state.registry.len(),
        "outstanding_tasks": state.tasks.outstanding(),
    }))
}

/// Prometheus text exposition of the request metrics.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .exporter
        .as_ref()
        .map(PrometheusHandle::render)
        .ok_or(ApiError::NotFound)
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}
