//! Who is making a request and what they may do.
//!
//! [`resolve_principal`] turns an `Authorization` header into a [`Principal`];
//! [`authorize`] checks a principal against a [`Gate`]. Neither mutates any
//! shared state. The HTTP wiring lives in `adapters::middleware`.
use std::{collections::BTreeSet, sync::Arc};

use http::HeaderValue;
use serde::Serialize;
use thiserror::Error;

use crate::{
    core::{
        token::{TOKEN_PLAINTEXT_LEN, TokenScope},
        user::User,
    },
    ports::store::{PermissionStore, StoreError, UserStore, bounded},
};

pub const MOVIES_READ: &str = "movies:read";
pub const MOVIES_WRITE: &str = "movies:write";

#[derive(Debug, Clone)]
pub enum Principal {
    Anonymous,
    User(Arc<User>),
}

impl Principal {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Principal::Anonymous => None,
            Principal::User(user) => Some(user),
        }
    }
}

/// Per-request state attached by the authentication stage. Every request that
/// reaches a handler carries exactly one.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
}

/// Permission codes held by one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Permissions(BTreeSet<String>);

impl Permissions {
    pub fn include(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Permissions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Malformed header, malformed token, or no live token matched
    #[error("invalid or missing authentication token")]
    InvalidToken,

    #[error("user lookup failed: {0}")]
    Store(StoreError),
}

/// Resolve the principal behind an `Authorization` header value.
pub async fn resolve_principal(
    users: &dyn UserStore,
    header: Option<&HeaderValue>,
) -> Result<Principal, AuthFailure> {
    let Some(header) = header else {
        return Ok(Principal::Anonymous);
    };

    let header = header.to_str().map_err(|_| AuthFailure::InvalidToken)?;
    // An empty header carries no credential at all.
    if header.is_empty() {
        return Ok(Principal::Anonymous);
    }
    let parts: Vec<&str> = header.split(' ').collect();
    let [scheme, token] = parts.as_slice() else {
        return Err(AuthFailure::InvalidToken);
    };
    if *scheme != "Bearer" || token.is_empty() || token.len() != TOKEN_PLAINTEXT_LEN {
        return Err(AuthFailure::InvalidToken);
    }

    match bounded(users.get_for_token(TokenScope::Authentication, token)).await {
        Ok(user) => Ok(Principal::User(Arc::new(user))),
        Err(StoreError::NotFound) => Err(AuthFailure::InvalidToken),
        Err(e) => Err(AuthFailure::Store(e)),
    }
}

/// Access requirement attached to a route. Each gate implies the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Authenticated,
    Activated,
    Permission(&'static str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Denial {
    #[error("you must be authenticated to access this resource")]
    AuthenticationRequired,

    #[error("your user account must be activated to access this resource")]
    InactiveAccount,

    #[error("your user account doesn't have the necessary permissions to access this resource")]
    NotPermitted,

    #[error("permission lookup failed: {0}")]
    Store(StoreError),
}

/// Check `principal` against `gate`, stopping at the first failed requirement.
/// Permission sets are read fresh on every call.
pub async fn authorize(
    principal: &Principal,
    gate: Gate,
    permissions: &dyn PermissionStore,
) -> Result<(), Denial> {
    let Some(user) = principal.user() else {
        return Err(Denial::AuthenticationRequired);
    };
    if gate == Gate::Authenticated {
        return Ok(());
    }

    if !user.activated {
        return Err(Denial::InactiveAccount);
    }
    let Gate::Permission(code) = gate else {
        return Ok(());
    };

    let held = bounded(permissions.all_for_user(user.id))
        .await
        .map_err(Denial::Store)?;
    if held.include(code) {
        Ok(())
    } else {
        Err(Denial::NotPermitted)
    }
}
