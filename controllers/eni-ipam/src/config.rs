//! Controller configuration.
//!
//! `ManagerConfig` tunes the node manager; `Config` is the daemon
//! configuration loaded from environment variables.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Pre-allocation target applied when a node's spec leaves it at 0
pub const DEFAULT_PRE_ALLOCATE: u32 = 8;

/// Default interval between periodic reconciliation passes
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Node manager tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Periodic reconciliation cadence per node. Also the maximum age of
    /// the subnet inventory before it is refreshed from the provider.
    pub resync_interval: Duration,

    /// Pre-allocation target used when a node specifies 0
    pub default_pre_allocate: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            default_pre_allocate: DEFAULT_PRE_ALLOCATE,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Inventory service base URL
    pub provider_url: String,
    /// Bearer token for the inventory service
    pub provider_token: Option<String>,
    /// Address of the metrics/probe HTTP server
    pub metrics_addr: SocketAddr,
    pub manager: ManagerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `ENI_PROVIDER_URL` (required)
    /// - `ENI_PROVIDER_TOKEN` (optional)
    /// - `RESYNC_INTERVAL_SECS` (default 60)
    /// - `DEFAULT_PRE_ALLOCATE` (default 8)
    /// - `METRICS_ADDR` (default 0.0.0.0:9090)
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let provider_url = lookup("ENI_PROVIDER_URL").ok_or_else(|| {
            ControllerError::InvalidConfig("ENI_PROVIDER_URL environment variable is required".to_string())
        })?;
        let provider_token = lookup("ENI_PROVIDER_TOKEN").filter(|token| !token.is_empty());

        let resync_secs: u64 = parse_or(&lookup, "RESYNC_INTERVAL_SECS", 60)?;
        if resync_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "RESYNC_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        let default_pre_allocate = parse_or(&lookup, "DEFAULT_PRE_ALLOCATE", DEFAULT_PRE_ALLOCATE)?;
        let metrics_addr = parse_or(
            &lookup,
            "METRICS_ADDR",
            SocketAddr::from(([0, 0, 0, 0], 9090)),
        )?;

        Ok(Self {
            provider_url,
            provider_token,
            metrics_addr,
            manager: ManagerConfig {
                resync_interval: Duration::from_secs(resync_secs),
                default_pre_allocate,
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{} has invalid value '{}': {}", key, raw, e))
        }),
        None => Ok(default),
    }
}
