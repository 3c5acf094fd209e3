pub mod auth;
pub mod movie;
pub mod rate_limiter;
pub mod token;
pub mod user;
pub mod validator;

pub use auth::{Gate, Principal, RequestContext};
pub use rate_limiter::{ClientRegistry, TokenBucket};
pub use validator::Validator;
