//! Controller-specific error types.
//!
//! This module defines error types specific to the ENI IPAM controller
//! that are not covered by upstream library errors.

use eni_client::ProviderError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the ENI IPAM controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Inventory/provider API error
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Invalid configuration or malformed node resource
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Publishing node state to the resource store failed
    #[error("Resource store error: {0}")]
    Store(String),

    /// Metrics registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics/probe HTTP server failed
    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),
}

impl ControllerError {
    /// Short, stable label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Provider(e) => e.reason(),
            ControllerError::Kube(_) => "kube",
            ControllerError::InvalidConfig(_) => "invalid_config",
            ControllerError::Store(_) => "store",
            ControllerError::Metrics(_) => "metrics",
            ControllerError::Watch(_) => "watch",
            ControllerError::Server(_) => "server",
        }
    }
}
