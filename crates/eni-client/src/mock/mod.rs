//! Mock provider for unit testing
//!
//! This module provides an in-memory implementation of `ProviderApi` that can be
//! used in unit tests without a running inventory service.
//!
//! - `inventory.rs` - subnet, interface and address operations
//!
//! Subnet counters are decremented as addresses are handed out, so tests can
//! observe how allocations spread across subnets. Failures can be injected for
//! the next N calls of an operation.

mod inventory;

use crate::error::ProviderError;
use crate::models::*;
use crate::provider_trait::ProviderApi;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Remaining injected failures per operation
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct InjectedFailures {
    pub(crate) list_subnets: u32,
    pub(crate) list_interfaces: u32,
    pub(crate) create_interface: u32,
    pub(crate) allocate_addresses: u32,
}

/// Call counters, for assertions on how often the provider was hit
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub list_subnets: u64,
    pub list_interfaces: u64,
    pub create_interface: u64,
    pub allocate_addresses: u64,
}

/// Mock provider for testing
///
/// Stores subnets and interfaces in memory. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MockProviderApi {
    pub(crate) subnets: Arc<Mutex<BTreeMap<String, Subnet>>>,
    pub(crate) interfaces: Arc<Mutex<BTreeMap<String, Interface>>>,
    pub(crate) capacities: Arc<Mutex<HashMap<String, InstanceCapacity>>>,
    pub(crate) failures: Arc<Mutex<InjectedFailures>>,
    pub(crate) calls: Arc<Mutex<CallCounts>>,
    // Counter for generating addresses
    pub(crate) next_address: Arc<Mutex<u32>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProviderApi {
    /// Create a new mock provider with the given subnets
    pub fn new(subnets: Vec<Subnet>) -> Self {
        let mock = Self::default();
        for subnet in subnets {
            mock.add_subnet(subnet);
        }
        mock
    }

    /// Add or replace a subnet (for test setup)
    pub fn add_subnet(&self, subnet: Subnet) {
        lock(&self.subnets).insert(subnet.id.clone(), subnet);
    }

    /// Current state of a subnet
    pub fn subnet(&self, id: &str) -> Option<Subnet> {
        lock(&self.subnets).get(id).cloned()
    }

    /// Override the capacity of an instance type (for test setup)
    pub fn set_instance_capacity(&self, instance_type: &str, capacity: InstanceCapacity) {
        lock(&self.capacities).insert(instance_type.to_string(), capacity);
    }

    /// Attach an interface directly (for test setup)
    pub fn add_interface(&self, interface: Interface) {
        lock(&self.interfaces).insert(interface.id.clone(), interface);
    }

    /// Interfaces of an instance, ordered by device index
    pub fn interfaces_of(&self, instance_id: &str) -> Vec<Interface> {
        inventory::interfaces_of(self, instance_id)
    }

    /// Number of addresses handed out per subnet
    pub fn addresses_by_subnet(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for interface in lock(&self.interfaces).values() {
            *counts.entry(interface.subnet_id.clone()).or_insert(0) += interface.addresses.len();
        }
        counts
    }

    /// Fail the next `count` calls to `allocate_addresses`
    pub fn fail_next_allocations(&self, count: u32) {
        lock(&self.failures).allocate_addresses = count;
    }

    /// Fail the next `count` calls to `create_interface`
    pub fn fail_next_interface_creations(&self, count: u32) {
        lock(&self.failures).create_interface = count;
    }

    /// Fail the next `count` calls to `list_subnets`
    pub fn fail_next_subnet_listings(&self, count: u32) {
        lock(&self.failures).list_subnets = count;
    }

    /// Fail the next `count` calls to `list_interfaces`
    pub fn fail_next_interface_listings(&self, count: u32) {
        lock(&self.failures).list_interfaces = count;
    }

    /// Number of calls per operation so far
    pub fn calls(&self) -> CallCounts {
        *lock(&self.calls)
    }

    /// Generate the next address
    pub(crate) fn next_address(&self) -> String {
        let mut next = lock(&self.next_address);
        *next += 1;
        let n = *next;
        format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)
    }
}

#[async_trait::async_trait]
impl ProviderApi for MockProviderApi {
    async fn list_subnets(&self) -> Result<Vec<Subnet>, ProviderError> {
        inventory::list_subnets(self)
    }

    async fn list_interfaces(&self, instance_id: &str) -> Result<Vec<Interface>, ProviderError> {
        inventory::list_interfaces(self, instance_id)
    }

    async fn create_interface(&self, request: &CreateInterfaceRequest) -> Result<Interface, ProviderError> {
        inventory::create_interface(self, request)
    }

    async fn allocate_addresses(&self, interface_id: &str, count: u32) -> Result<Vec<AllocatedAddress>, ProviderError> {
        inventory::allocate_addresses(self, interface_id, count)
    }

    fn instance_capacity(&self, instance_type: &str) -> Option<InstanceCapacity> {
        lock(&self.capacities)
            .get(instance_type)
            .copied()
            .or_else(|| crate::limits::lookup(instance_type))
    }
}
