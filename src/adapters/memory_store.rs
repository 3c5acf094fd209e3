//! In-process implementation of every store port.
//!
//! All tables live behind one async `RwLock` so multi-table operations (for
//! example "user matching this token hash") see a consistent snapshot.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    core::{
        auth::Permissions,
        movie::{Movie, MovieInput},
        token::{Token, TokenHash, TokenScope, token_hash},
        user::{NewUser, User},
    },
    ports::store::{
        Models, MovieStore, PermissionStore, StoreError, StoreResult, TokenStore, UserStore,
    },
};

#[derive(Debug, Clone)]
struct TokenRecord {
    user_id: i64,
    expiry: DateTime<Utc>,
    scope: TokenScope,
}

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<i64, User>,
    /// Lower-cased email to user id.
    emails: HashMap<String, i64>,
    tokens: HashMap<TokenHash, TokenRecord>,
    permissions: HashMap<i64, BTreeSet<String>>,
    movies: BTreeMap<i64, Movie>,
    next_user_id: i64,
    next_movie_id: i64,
}

impl Tables {
    fn allocate_user_id(&mut self) -> i64 {
        self.next_user_id += 1;
        self.next_user_id
    }

    fn allocate_movie_id(&mut self) -> i64 {
        self.next_movie_id += 1;
        self.next_movie_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// One shared store wired into every port.
    pub fn models() -> Models {
        Self::new().into_models()
    }

    pub fn into_models(self) -> Models {
        let store = Arc::new(self);
        Models {
            users: store.clone(),
            tokens: store.clone(),
            permissions: store.clone(),
            movies: store,
        }
    }
}

fn email_key(email: &str) -> String {
    email.to_lowercase()
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert(&self, user: NewUser) -> StoreResult<User> {
        let mut tables = self.tables.write().await;

        let key = email_key(&user.email);
        if tables.emails.contains_key(&key) {
            return Err(StoreError::DuplicateEmail);
        }

        let id = tables.allocate_user_id();
        let stored = User {
            id,
            created_at: Utc::now(),
            name: user.name,
            email: user.email,
            password: user.password,
            activated: user.activated,
            version: 1,
        };
        tables.emails.insert(key, id);
        tables.users.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<User> {
        let tables = self.tables.read().await;
        tables
            .emails
            .get(&email_key(email))
            .and_then(|id| tables.users.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update(&self, user: &User) -> StoreResult<User> {
        let mut tables = self.tables.write().await;

        let current = tables.users.get(&user.id).ok_or(StoreError::EditConflict)?;
        if current.version != user.version {
            return Err(StoreError::EditConflict);
        }

        let old_key = email_key(&current.email);
        let new_key = email_key(&user.email);
        if old_key != new_key {
            if tables.emails.contains_key(&new_key) {
                return Err(StoreError::DuplicateEmail);
            }
            tables.emails.remove(&old_key);
            tables.emails.insert(new_key, user.id);
        }

        let mut updated = user.clone();
        updated.version += 1;
        tables.users.insert(user.id, updated.clone());
        Ok(updated)
    }

    async fn get_for_token(&self, scope: TokenScope, plaintext: &str) -> StoreResult<User> {
        let hash = token_hash(plaintext);
        let tables = self.tables.read().await;

        let record = tables.tokens.get(&hash).ok_or(StoreError::NotFound)?;
        if record.scope != scope || record.expiry <= Utc::now() {
            return Err(StoreError::NotFound);
        }
        tables
            .users
            .get(&record.user_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert(&self, token: &Token) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&token.user_id) {
            return Err(StoreError::Backend(format!(
                "token references unknown user {}",
                token.user_id
            )));
        }
        tables.tokens.insert(
            token.hash,
            TokenRecord {
                user_id: token.user_id,
                expiry: token.expiry,
                scope: token.scope,
            },
        );
        Ok(())
    }

    async fn delete_all_for_user(&self, scope: TokenScope, user_id: i64) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .tokens
            .retain(|_, record| !(record.scope == scope && record.user_id == user_id));
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn all_for_user(&self, user_id: i64) -> StoreResult<Permissions> {
        let tables = self.tables.read().await;
        Ok(tables
            .permissions
            .get(&user_id)
            .map(|codes| codes.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_for_user(&self, user_id: i64, codes: &[&str]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::Backend(format!("unknown user {user_id}")));
        }
        tables
            .permissions
            .entry(user_id)
            .or_default()
            .extend(codes.iter().map(|code| code.to_string()));
        Ok(())
    }
}

#[async_trait]
impl MovieStore for MemoryStore {
    async fn insert(&self, input: MovieInput) -> StoreResult<Movie> {
        let mut tables = self.tables.write().await;
        let id = tables.allocate_movie_id();
        let movie = Movie {
            id,
            created_at: Utc::now(),
            title: input.title,
            year: input.year,
            runtime: input.runtime,
            genres: input.genres,
            version: 1,
        };
        tables.movies.insert(id, movie.clone());
        Ok(movie)
    }

    async fn get(&self, id: i64) -> StoreResult<Movie> {
        if id < 1 {
            return Err(StoreError::NotFound);
        }
        self.tables
            .read()
            .await
            .movies
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update(&self, movie: &Movie) -> StoreResult<Movie> {
        let mut tables = self.tables.write().await;
        match tables.movies.get(&movie.id) {
            Some(current) if current.version == movie.version => {}
            _ => return Err(StoreError::EditConflict),
        }

        let mut updated = movie.clone();
        updated.version += 1;
        tables.movies.insert(movie.id, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .movies
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> StoreResult<Vec<Movie>> {
        Ok(self.tables.read().await.movies.values().cloned().collect())
    }
}
