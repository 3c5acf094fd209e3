use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{
    auth::Permissions,
    movie::{Movie, MovieInput},
    token::{Token, TokenScope},
    user::{NewUser, User},
};

/// Upper bound on any single persistence call made on behalf of a request.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Persistence failures, classified at the storage boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// No record matched the lookup
    #[error("record not found")]
    NotFound,

    /// Another user already owns the email address
    #[error("duplicate email")]
    DuplicateEmail,

    /// The record changed (or vanished) since it was read
    #[error("edit conflict")]
    EditConflict,

    /// The store did not answer in time
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any other storage failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Run a store operation under [`QUERY_TIMEOUT`].
pub async fn bounded<T, F>(fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(QUERY_TIMEOUT, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout(QUERY_TIMEOUT)))
}

#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Persist a new user.
    ///
    /// # Returns
    /// The stored user with its id, creation time and version assigned, or
    /// [`StoreError::DuplicateEmail`] when the address is taken
    async fn insert(&self, user: NewUser) -> StoreResult<User>;

    async fn get_by_email(&self, email: &str) -> StoreResult<User>;

    /// Write back a modified user, guarded by its version.
    ///
    /// # Returns
    /// The user with its bumped version, [`StoreError::EditConflict`] when the
    /// stored version moved on, or [`StoreError::DuplicateEmail`]
    async fn update(&self, user: &User) -> StoreResult<User>;

    /// Look up the owner of an unexpired token with the given scope.
    ///
    /// # Arguments
    /// * `scope` - Which kind of token `plaintext` must be
    /// * `plaintext` - The token as presented by the client
    async fn get_for_token(&self, scope: TokenScope, plaintext: &str) -> StoreResult<User>;
}

#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    async fn insert(&self, token: &Token) -> StoreResult<()>;

    async fn delete_all_for_user(&self, scope: TokenScope, user_id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync + 'static {
    async fn all_for_user(&self, user_id: i64) -> StoreResult<Permissions>;

    async fn add_for_user(&self, user_id: i64, codes: &[&str]) -> StoreResult<()>;
}

#[async_trait]
pub trait MovieStore: Send + Sync + 'static {
    async fn insert(&self, input: MovieInput) -> StoreResult<Movie>;

    async fn get(&self, id: i64) -> StoreResult<Movie>;

    /// Replace the fields of `movie`, which must still be at `movie.version`.
    ///
    /// # Returns
    /// The movie with its bumped version or [`StoreError::EditConflict`]
    async fn update(&self, movie: &Movie) -> StoreResult<Movie>;

    async fn delete(&self, id: i64) -> StoreResult<()>;

    /// All movies ordered by id.
    async fn list(&self) -> StoreResult<Vec<Movie>>;
}

/// The set of stores a request handler can reach.
#[derive(Clone)]
pub struct Models {
    pub users: Arc<dyn UserStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub movies: Arc<dyn MovieStore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out_slow_operations() {
        let result: StoreResult<()> = bounded(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StoreError::Timeout(QUERY_TIMEOUT)));
    }

    #[tokio::test]
    async fn bounded_passes_results_through() {
        assert_eq!(bounded(async { Ok(5) }).await, Ok(5));
        assert_eq!(
            bounded::<(), _>(async { Err(StoreError::NotFound) }).await,
            Err(StoreError::NotFound)
        );
    }
}
