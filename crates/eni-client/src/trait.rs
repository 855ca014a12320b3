//! ProviderApi trait for mocking
//!
//! This trait abstracts the interface/subnet inventory API so the controller
//! can run against the HTTP client in production and an in-memory mock in tests.

use crate::error::ProviderError;
use crate::limits;
use crate::models::*;

/// Trait for interface and subnet inventory operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ProviderApi: Send + Sync {
    /// List all subnets with their remaining address counts
    async fn list_subnets(&self) -> Result<Vec<Subnet>, ProviderError>;

    /// List the interfaces attached to an instance, ordered by device index
    async fn list_interfaces(&self, instance_id: &str) -> Result<Vec<Interface>, ProviderError>;

    /// Create and attach a new interface
    async fn create_interface(&self, request: &CreateInterfaceRequest) -> Result<Interface, ProviderError>;

    /// Assign `count` new secondary addresses to an interface
    async fn allocate_addresses(&self, interface_id: &str, count: u32) -> Result<Vec<AllocatedAddress>, ProviderError>;

    /// Hardware limits of an instance type, `None` if unknown
    fn instance_capacity(&self, instance_type: &str) -> Option<InstanceCapacity> {
        limits::lookup(instance_type)
    }
}
