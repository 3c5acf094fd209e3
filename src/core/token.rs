//! Activation and authentication tokens.
//!
//! Plaintexts are 26 characters drawn from the RFC 4648 base32 alphabet
//! (about 130 bits of entropy). Only the SHA-256 digest of the plaintext is
//! ever stored; the plaintext is handed to the user exactly once.
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::validator::Validator;

pub const TOKEN_PLAINTEXT_LEN: usize = 26;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    Activation,
    Authentication,
}

impl TokenScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScope::Activation => "activation",
            TokenScope::Authentication => "authentication",
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type TokenHash = [u8; 32];

#[derive(Debug, Clone, Serialize)]
pub struct Token {
    #[serde(rename = "token")]
    pub plaintext: String,
    #[serde(skip)]
    pub hash: TokenHash,
    #[serde(skip)]
    pub user_id: i64,
    pub expiry: DateTime<Utc>,
    #[serde(skip)]
    pub scope: TokenScope,
}

impl Token {
    /// Generate a fresh random token for `user_id` that lives for `ttl`.
    pub fn generate(user_id: i64, ttl: TimeDelta, scope: TokenScope) -> Self {
        let mut rng = rand::rng();
        let plaintext: String = (0..TOKEN_PLAINTEXT_LEN)
            .map(|_| char::from(BASE32_ALPHABET[rng.random_range(0..BASE32_ALPHABET.len())]))
            .collect();

        Self {
            hash: token_hash(&plaintext),
            plaintext,
            user_id,
            expiry: Utc::now() + ttl,
            scope,
        }
    }
}

pub fn token_hash(plaintext: &str) -> TokenHash {
    Sha256::digest(plaintext.as_bytes()).into()
}

/// Shape check only; says nothing about whether the token exists.
pub fn validate_token_plaintext(v: &mut Validator, plaintext: &str) {
    v.check(!plaintext.is_empty(), "token", "must be provided");
    v.check(
        plaintext.len() == TOKEN_PLAINTEXT_LEN,
        "token",
        "must be 26 bytes long",
    );
}
