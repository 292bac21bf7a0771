//! Error type for provider calls

use ambrosia_core::HttpError;

/// Failure of one provider call.
///
/// The dispatcher's retry policy decides what to do with it; by default every
/// variant is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    Http(HttpError),
    /// Response body was not the expected shape
    Decode(String),
    /// Response carried no choices to take a completion from
    NoChoices,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(e) => write!(f, "{e}"),
            Self::Decode(msg) => write!(f, "malformed response: {msg}"),
            Self::NoChoices => f.write_str("response contained no choices"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HttpError> for ProviderError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl ProviderError {
    /// Worth retrying when only transient failures should be: network
    /// trouble, throttling, server errors and malformed bodies.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_transient(),
            Self::Decode(_) | Self::NoChoices => true,
        }
    }
}
