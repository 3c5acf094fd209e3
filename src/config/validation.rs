use std::net::SocketAddr;

use eyre::Result;
use url::Url;

use crate::config::models::{CorsConfig, LimiterConfig, ServerConfig, ShutdownConfig, TimeoutConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid trusted origin '{origin}': {reason}")]
    InvalidOrigin { origin: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        errors.extend(Self::validate_limiter(&config.limiter));
        errors.extend(Self::validate_cors(&config.cors));
        errors.extend(Self::validate_timeouts(&config.timeouts));
        errors.extend(Self::validate_shutdown(&config.shutdown));

        if config.mailer.sender.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "mailer.sender".to_string(),
                message: "Sender address cannot be empty".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:4000' or '0.0.0.0:4000')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_limiter(limiter: &LimiterConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !limiter.rps.is_finite() || limiter.rps < 0.0 {
            errors.push(ValidationError::InvalidField {
                field: "limiter.rps".to_string(),
                message: format!("Must be a finite, non-negative number, got {}", limiter.rps),
            });
        }

        // A zero burst rejects every request; only meaningful when the stage is off.
        if limiter.enabled && limiter.burst == 0 {
            errors.push(ValidationError::InvalidField {
                field: "limiter.burst".to_string(),
                message: "Must be greater than 0 when rate limiting is enabled".to_string(),
            });
        }

        errors
    }

    /// Trusted origins are compared byte-for-byte against the `Origin` header,
    /// so they must be bare `scheme://host[:port]` values.
    fn validate_cors(cors: &CorsConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for origin in &cors.trusted_origins {
            let parsed = match Url::parse(origin) {
                Ok(url) => url,
                Err(e) => {
                    errors.push(ValidationError::InvalidOrigin {
                        origin: origin.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !matches!(parsed.scheme(), "http" | "https") {
                errors.push(ValidationError::InvalidOrigin {
                    origin: origin.clone(),
                    reason: "Scheme must be http or https".to_string(),
                });
            } else if parsed.origin().ascii_serialization() != *origin {
                errors.push(ValidationError::InvalidOrigin {
                    origin: origin.clone(),
                    reason: format!(
                        "Must not carry a path, query or trailing slash (did you mean '{}'?)",
                        parsed.origin().ascii_serialization()
                    ),
                });
            }
        }

        errors
    }

    fn validate_timeouts(timeouts: &TimeoutConfig) -> Vec<ValidationError> {
        [
            ("timeouts.idle_secs", timeouts.idle_secs),
            ("timeouts.read_secs", timeouts.read_secs),
            ("timeouts.write_secs", timeouts.write_secs),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(field, _)| ValidationError::InvalidField {
            field: field.to_string(),
            message: "Timeout must be greater than 0".to_string(),
        })
        .collect()
    }

    fn validate_shutdown(shutdown: &ShutdownConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if shutdown.grace_period_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "shutdown.grace_period_secs".to_string(),
                message: "Grace period must be greater than 0".to_string(),
            });
        }
        if shutdown.background_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "shutdown.background_timeout_secs".to_string(),
                message: "Background drain timeout must be greater than 0".to_string(),
            });
        }
        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_default_config() {
        assert!(ServerConfigValidator::validate(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let config = ServerConfig::builder().listen_addr("localhost").build();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_negative_rps() {
        let config = ServerConfig::builder().limiter(true, -1.0, 4).build();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_allows_zero_burst_when_disabled() {
        let config = ServerConfig::builder().limiter(false, 2.0, 0).build();
        assert!(ServerConfigValidator::validate(&config).is_ok());

        let config = ServerConfig::builder().limiter(true, 2.0, 0).build();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_checks_trusted_origins() {
        let ok = ServerConfig::builder()
            .trusted_origin("https://trusted.example")
            .trusted_origin("http://localhost:9000")
            .build();
        assert!(ServerConfigValidator::validate(&ok).is_ok());

        for bad in ["trusted.example", "https://trusted.example/", "ftp://files.example"] {
            let config = ServerConfig::builder().trusted_origin(bad).build();
            assert!(
                ServerConfigValidator::validate(&config).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = ServerConfig::builder().listen_addr("nope").build();
        config.timeouts.read_secs = 0;
        config.shutdown.grace_period_secs = 0;

        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Found 3 validation errors"));
    }
}
