//! Provider client errors

use thiserror::Error;

/// Errors that can occur when interacting with the interface/subnet inventory API
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API returned an error
    #[error("Provider API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource not found (instance, interface, subnet)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., zero addresses requested)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Subnet has fewer remaining addresses than requested
    #[error("Subnet exhausted: {0}")]
    SubnetExhausted(String),

    /// Instance or interface hardware limit reached
    #[error("Interface limit reached: {0}")]
    InterfaceLimit(String),
}

impl ProviderError {
    /// Short, stable label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ProviderError::Http(_) => "http",
            ProviderError::Api(_) => "api",
            ProviderError::Serialization(_) => "serialization",
            ProviderError::NotFound(_) => "not_found",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::SubnetExhausted(_) => "subnet_exhausted",
            ProviderError::InterfaceLimit(_) => "interface_limit",
        }
    }
}
