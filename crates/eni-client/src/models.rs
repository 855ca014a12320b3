//! Provider API models
//!
//! These models match the JSON documents of the inventory service.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag set of a provider resource
pub type Tags = BTreeMap<String, String>;

/// Address subnet within an availability zone and virtual network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub id: String,
    pub availability_zone: String,
    pub vpc_id: String,
    /// Number of addresses that can still be assigned from this subnet
    pub available_addresses: u32,
    #[serde(default)]
    pub tags: Tags,
}

impl Subnet {
    /// Whether the subnet is usable by an instance in `availability_zone`/`vpc_id`
    /// that requires every tag in `required_tags`.
    pub fn matches(&self, availability_zone: &str, vpc_id: &str, required_tags: &Tags) -> bool {
        self.availability_zone == availability_zone
            && self.vpc_id == vpc_id
            && required_tags
                .iter()
                .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

/// Network interface attached to an instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub id: String,
    pub instance_id: String,
    pub subnet_id: String,
    /// Device index on the instance, assigned in creation order
    pub index: u32,
    /// Secondary addresses assigned to the interface
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

/// Request body for interface creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateInterfaceRequest {
    pub instance_id: String,
    pub subnet_id: String,
    pub index: u32,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

/// Request body for address allocation on an interface
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocateAddressesRequest {
    pub count: u32,
}

/// Address assigned by the provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedAddress {
    pub address: String,
    pub interface_id: String,
}

/// Hardware limits of an instance type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCapacity {
    pub max_interfaces: u32,
    pub max_addresses_per_interface: u32,
}

impl InstanceCapacity {
    pub const fn new(max_interfaces: u32, max_addresses_per_interface: u32) -> Self {
        Self {
            max_interfaces,
            max_addresses_per_interface,
        }
    }

    /// Total number of addresses the instance can hold
    pub fn total(&self) -> u32 {
        self.max_interfaces
            .saturating_mul(self.max_addresses_per_interface)
    }
}
