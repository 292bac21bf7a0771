//! Shared HTTP client and runtime.
//!
//! Uses async reqwest internally but presents a sync interface so that plain
//! worker threads can issue requests with `SHARED_RUNTIME.handle().block_on`.

use std::sync::LazyLock;
use std::time::Duration;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP failure with optional status code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(s) => write!(f, "HTTP {s}: {}", self.message),
            None => write!(f, "HTTP error: {}", self.message),
        }
    }
}

impl std::error::Error for HttpError {}

impl HttpError {
    /// Create HTTP error from reqwest error.
    ///
    /// The URL is stripped so credentials embedded in endpoints never reach logs.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        Self {
            status: e.status().map(|s| s.as_u16()),
            message: e.without_url().to_string(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Timeouts, connection failures, 429 and 5xx
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(s) => s == 408 || s == 429 || s >= 500,
        }
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(16)
        .build()
        .expect("failed to build HTTP client")
});

/// Get shared HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ambrosia-http")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_status() {
        let err = HttpError::with_status(404, "test");
        assert_eq!(format!("{err}"), "HTTP 404: test");
    }

    #[test]
    fn display_without_status() {
        let err = HttpError {
            status: None,
            message: "timeout".to_string(),
        };
        assert_eq!(format!("{err}"), "HTTP error: timeout");
    }

    #[test]
    fn transient_statuses() {
        assert!(HttpError::with_status(429, "slow down").is_transient());
        assert!(HttpError::with_status(503, "unavailable").is_transient());
        assert!(HttpError::with_status(408, "timeout").is_transient());
        assert!(!HttpError::with_status(401, "bad key").is_transient());
        assert!(!HttpError::with_status(400, "bad request").is_transient());
    }

    #[test]
    fn missing_status_is_transient() {
        let err = HttpError {
            status: None,
            message: "connection refused".to_string(),
        };
        assert!(err.is_transient());
    }
}
