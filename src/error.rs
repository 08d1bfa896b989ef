use hyper::StatusCode;
use thiserror::Error;

use crate::cloud::ProviderError;

/// Unified error type for the proxy fleet
#[derive(Error, Debug)]
pub enum FleetError {
    // Provisioning errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Instance {instance} did not become ready within {elapsed_secs}s")]
    ProvisioningTimeout { instance: String, elapsed_secs: u64 },

    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    // Routing errors
    #[error("No ready backend available")]
    RoutingUnavailable,

    #[error("Backend connection failed: {0}")]
    BackendConnectFailure(String),

    #[error("All backends failed after {attempts} attempts")]
    BackendsExhausted { attempts: u32 },

    // Authentication errors
    #[error("Proxy authentication failed")]
    AuthenticationFailed,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// Get the HTTP status code reported to proxy clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            FleetError::InvalidRequest(_) | FleetError::Config(_) => StatusCode::BAD_REQUEST,

            // 407 Proxy Authentication Required
            FleetError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            FleetError::BackendConnectFailure(_)
            | FleetError::BackendsExhausted { .. }
            | FleetError::Http(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            FleetError::RoutingUnavailable | FleetError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            FleetError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            FleetError::Provider(_)
            | FleetError::ProvisioningTimeout { .. }
            | FleetError::HealthCheckFailure(_)
            | FleetError::Io(_)
            | FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for FleetError {
    fn from(err: hyper::Error) -> Self {
        FleetError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for FleetError {
    fn from(err: url::ParseError) -> Self {
        FleetError::InvalidRequest(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}
