pub mod background;
pub mod connection_tracker;
pub mod graceful_shutdown;

pub use background::BackgroundTasks;
pub use connection_tracker::{ConnectionActivity, RequestActivity};
pub use graceful_shutdown::{GracefulShutdown, ShutdownError, ShutdownReason, ShutdownToken};
