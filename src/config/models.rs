//! Configuration data structures for cinedex.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and
//! to `CINEDEX__`-prefixed environment variables. They are serde‑friendly and
//! carry defaults so that a missing file still yields a runnable development
//! server. The whole tree is loaded once at startup and is immutable afterwards.
use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Deployment environment reported by the healthcheck endpoint and used to pick
/// the log format.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        f.write_str(name)
    }
}

/// Per-client token bucket settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Toggle for the whole rate limiting stage
    pub enabled: bool,
    /// Refill rate in tokens (requests) per second
    pub rps: f64,
    /// Bucket capacity, i.e. the largest burst a client may send at once
    pub burst: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rps: 2.0,
            burst: 4,
        }
    }
}

/// Cross-origin settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CorsConfig {
    /// Origins (scheme://host[:port]) allowed to make credentialed requests
    pub trusted_origins: Vec<String>,
}

/// Connection level timeouts, all in seconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub idle_secs: u64,
    pub read_secs: u64,
    pub write_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            read_secs: 10,
            write_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
}

/// Bounds for the two shutdown phases.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight requests may keep running once the listener stops
    pub grace_period_secs: u64,
    /// How long to wait for outstanding background tasks afterwards
    pub background_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
            background_timeout_secs: 30,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MailerConfig {
    /// `From` address put on outgoing mail
    pub sender: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            sender: "Cinedex <no-reply@cinedex.local>".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub env: Environment,
    pub limiter: LimiterConfig,
    pub cors: CorsConfig,
    pub timeouts: TimeoutConfig,
    pub shutdown: ShutdownConfig,
    pub mailer: MailerConfig,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4000".to_string(),
            env: Environment::default(),
            limiter: LimiterConfig::default(),
            cors: CorsConfig::default(),
            timeouts: TimeoutConfig::default(),
            shutdown: ShutdownConfig::default(),
            mailer: MailerConfig::default(),
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn env(mut self, env: Environment) -> Self {
        self.config.env = env;
        self
    }

    /// Configure the per-client rate limiter
    pub fn limiter(mut self, enabled: bool, rps: f64, burst: u32) -> Self {
        self.config.limiter = LimiterConfig {
            enabled,
            rps,
            burst,
        };
        self
    }

    /// Add an origin to the CORS allow-list
    pub fn trusted_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.cors.trusted_origins.push(origin.into());
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.config.shutdown = shutdown;
        self
    }

    pub fn mail_sender(mut self, sender: impl Into<String>) -> Self {
        self.config.mailer.sender = sender.into();
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
