//! HTTP error responses.
//!
//! Every failure that reaches a client goes through [`ApiError`], which
//! renders as `{"error": <message or field map>}`.
use std::collections::BTreeMap;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    core::auth::{AuthFailure, Denial},
    ports::store::StoreError,
};

pub const SERVER_ERROR_MESSAGE: &str =
    "the server encountered a problem and could not process your request";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("internal error: {0:?}")]
    ServerError(eyre::Report),

    #[error("the requested resource could not be found")]
    NotFound,

    #[error("the requested method is not allowed for this resource")]
    MethodNotAllowed,

    #[error("{0}")]
    BadRequest(String),

    #[error("failed validation")]
    FailedValidation(BTreeMap<String, String>),

    #[error("unable to update the record due to an edit conflict, please try again")]
    EditConflict,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("invalid authentication credentials")]
    InvalidCredentials,

    #[error("invalid or missing authentication token")]
    InvalidAuthenticationToken,

    #[error("you must be authenticated to access this resource")]
    AuthenticationRequired,

    #[error("your user account must be activated to access this resource")]
    InactiveAccount,

    #[error("your user account doesn't have the necessary permissions to access this resource")]
    NotPermitted,
}

impl ApiError {
    pub fn server(err: impl Into<eyre::Report>) -> Self {
        ApiError::ServerError(err.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::FailedValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::EditConflict => StatusCode::CONFLICT,
            ApiError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidCredentials
            | ApiError::InvalidAuthenticationToken
            | ApiError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            ApiError::InactiveAccount | ApiError::NotPermitted => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::ServerError(report) => {
                tracing::error!(error = ?report, "Request failed");
                json!({ "error": SERVER_ERROR_MESSAGE })
            }
            ApiError::FailedValidation(errors) => json!({ "error": errors }),
            other => {
                if status.is_client_error() && status != StatusCode::NOT_FOUND {
                    tracing::debug!(status = status.as_u16(), error = %other, "Request rejected");
                }
                json!({ "error": other.to_string() })
            }
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::InvalidAuthenticationToken) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<eyre::Report> for ApiError {
    fn from(err: eyre::Report) -> Self {
        ApiError::ServerError(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::EditConflict => ApiError::EditConflict,
            other => ApiError::ServerError(eyre::Report::new(other)),
        }
    }
}

impl From<AuthFailure> for ApiError {
    fn from(err: AuthFailure) -> Self {
        match err {
            AuthFailure::InvalidToken => ApiError::InvalidAuthenticationToken,
            AuthFailure::Store(e) => {
                ApiError::ServerError(eyre::Report::new(e).wrap_err("resolving bearer token"))
            }
        }
    }
}

impl From<Denial> for ApiError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::AuthenticationRequired => ApiError::AuthenticationRequired,
            Denial::InactiveAccount => ApiError::InactiveAccount,
            Denial::NotPermitted => ApiError::NotPermitted,
            Denial::Store(e) => {
                ApiError::ServerError(eyre::Report::new(e).wrap_err("loading permissions"))
            }
        }
    }
}
