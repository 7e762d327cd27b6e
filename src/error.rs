use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error during {operation}: {message}")]
    Network {
        operation: &'static str,
        message: String,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no GitHub token available for refresh")]
    NoToken,

    #[error("device authorization failed: {0}")]
    DeviceFlow(String),

    #[error("device authorization timed out")]
    DeviceFlowTimedOut,

    #[error("token endpoint rejected credentials (HTTP {status})")]
    Rejected { status: u16 },

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid value {value} for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("HOME directory could not be determined")]
    NoHome,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("request body too large (max {max} bytes)")]
    BodyTooLarge { max: usize },

    #[error("worker pool is not accepting jobs")]
    PoolStopped,

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl Error {
    /// HTTP status this error maps to at the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Auth(_) => 401,
            Error::Validation(_) => 400,
            Error::Proxy(ProxyError::CircuitOpen) => 503,
            Error::Proxy(ProxyError::PoolStopped) => 503,
            Error::Proxy(ProxyError::BodyTooLarge { .. }) => 413,
            Error::Timeout(_) => 408,
            _ => 500,
        }
    }

    /// Machine-readable error class for JSON error bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Auth(_) => "authentication_error",
            Error::Config(_) => "configuration_error",
            Error::Network { .. } => "network_error",
            Error::Validation(_) => "validation_error",
            Error::Proxy(_) => "proxy_error",
            Error::Timeout(_) => "timeout_error",
            Error::Io(_) | Error::Json(_) => "internal_error",
        }
    }

    /// Operator-facing hint for the CLI, where one exists.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Auth(AuthError::NoToken) => Some("Run 'github-copilot-svcs auth' to log in"),
            Error::Auth(AuthError::Rejected { .. }) => {
                Some("Run 'github-copilot-svcs auth' to re-authenticate")
            }
            Error::Auth(AuthError::DeviceFlowTimedOut) => {
                Some("Re-run 'github-copilot-svcs auth' and enter the code promptly")
            }
            Error::Network { .. } => Some("Check your internet connection and try again"),
            Error::Proxy(ProxyError::CircuitOpen) => {
                Some("Upstream is failing; wait for the recovery window to elapse")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
