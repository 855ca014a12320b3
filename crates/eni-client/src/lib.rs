//! Interface/Subnet Inventory API Client
//!
//! A Rust client library for the cloud inventory service that owns subnets,
//! network interfaces (ENIs) and their secondary addresses.
//!
//! # Example
//!
//! ```no_run
//! use eni_client::{HttpProviderClient, ProviderApi};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpProviderClient::new("http://eni-inventory:8080".to_string(), None)?;
//!
//! // Subnets with their remaining address counts
//! let subnets = client.list_subnets().await?;
//!
//! // Interfaces of an instance, then two more addresses on the first one
//! let interfaces = client.list_interfaces("i-0123456789").await?;
//! if let Some(first) = interfaces.first() {
//!     client.allocate_addresses(&first.id, 2).await?;
//! }
//!
//! // Hardware limits of the instance type
//! let capacity = client.instance_capacity("m5.large");
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Subnet inventory**: zone, network, tags and remaining address counts
//! - **Interfaces**: listing, creation and address assignment
//! - **Capacity table**: interface and per-interface address limits per instance type
//! - **Mock**: in-memory provider with failure injection (`test-util` feature)

pub mod client;
pub mod error;
pub mod limits;
pub mod models;
#[path = "trait.rs"]
pub mod provider_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::HttpProviderClient;
pub use error::ProviderError;
pub use models::*;
pub use provider_trait::ProviderApi;
#[cfg(feature = "test-util")]
pub use mock::{CallCounts, MockProviderApi};
