pub mod error;
pub mod extract;
pub mod handlers;
pub mod mailer;
pub mod memory_store;
pub mod middleware;
pub mod state;

/// Re-export commonly used types from adapters
pub use error::ApiError;
pub use mailer::LogMailer;
pub use memory_store::MemoryStore;
pub use state::AppState;
