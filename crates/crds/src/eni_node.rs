//! ENINode CRD
//!
//! Declarative per-node resource for ENI-backed address pools.
//! The spec carries the instance metadata, allocation policy and the
//! address pool; the status carries the in-use addresses (written by the
//! node agent) and the interface/stats view published by the controller.

use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "ipam.microscaler.io",
    version = "v1alpha1",
    kind = "ENINode",
    status = "ENINodeStatus",
    shortname = "eninode"
)]
#[serde(rename_all = "camelCase")]
pub struct ENINodeSpec {
    /// Instance metadata and allocation policy
    pub eni: EniSpec,

    /// Address pool of the node
    #[serde(default)]
    pub ipam: IpamSpec,
}

/// Instance metadata and allocation policy of a node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EniSpec {
    /// Cloud instance ID (e.g., "i-0123456789")
    pub instance_id: String,

    /// Instance type, used to look up interface capacity (e.g., "m5.large")
    pub instance_type: String,

    /// Availability zone the instance runs in
    pub availability_zone: String,

    /// Virtual network the instance is attached to
    pub vpc_id: String,

    /// Number of free addresses to keep ahead of demand.
    /// 0 selects the controller default, a negative value disables the buffer.
    #[serde(default)]
    pub pre_allocate: i32,

    /// Minimum number of addresses in the pool regardless of usage
    #[serde(default)]
    pub min_allocate: i32,

    /// Only subnets carrying all of these tags are used
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subnet_tags: BTreeMap<String, String>,

    /// Security groups attached to interfaces created for this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
}

/// Address pool, keyed by address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpamSpec {
    #[serde(default)]
    pub pool: BTreeMap<String, AllocationIP>,
}

/// A single allocated address
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationIP {
    /// Interface the address is assigned to
    pub resource: String,

    /// Workload using the address, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ENINodeStatus {
    /// In-use addresses, maintained by the node agent
    #[serde(default)]
    pub ipam: IpamStatus,

    /// Interfaces attached to the instance (observed state)
    #[serde(default)]
    pub eni: EniStatus,

    /// Pool statistics derived from the pool on the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<PoolStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpamStatus {
    #[serde(default)]
    pub used: BTreeMap<String, AllocationIP>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EniStatus {
    /// Interfaces keyed by interface ID
    #[serde(default)]
    pub enis: BTreeMap<String, EniInterface>,
}

/// Observed state of one interface
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EniInterface {
    pub id: String,

    /// Device index on the instance (creation order)
    pub index: u32,

    pub subnet_id: String,

    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub available: u32,
    pub used: u32,
    pub needed: u32,
    #[serde(default)]
    pub at_capacity: bool,
}

impl ENINode {
    /// Addresses of the pool that the node agent reports as in use.
    ///
    /// Entries of `status.ipam.used` that are not part of the pool are ignored.
    pub fn in_use(&self) -> BTreeSet<String> {
        let Some(status) = self.status.as_ref() else {
            return BTreeSet::new();
        };
        status
            .ipam
            .used
            .keys()
            .filter(|address| self.spec.ipam.pool.contains_key(*address))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(resource: &str) -> AllocationIP {
        AllocationIP {
            resource: resource.to_string(),
            owner: None,
        }
    }

    #[test]
    fn test_in_use_ignores_addresses_outside_pool() {
        let mut node = ENINode::new("node1", ENINodeSpec::default());
        node.spec.ipam.pool.insert("10.0.0.1".to_string(), allocation("eni-1"));
        node.spec.ipam.pool.insert("10.0.0.2".to_string(), allocation("eni-1"));

        let mut status = ENINodeStatus::default();
        status.ipam.used.insert("10.0.0.1".to_string(), allocation("eni-1"));
        status.ipam.used.insert("10.9.9.9".to_string(), allocation("eni-x"));
        node.status = Some(status);

        let in_use = node.in_use();
        assert_eq!(in_use.len(), 1);
        assert!(in_use.contains("10.0.0.1"));
    }

    #[test]
    fn test_in_use_without_status() {
        let node = ENINode::new("node1", ENINodeSpec::default());
        assert!(node.in_use().is_empty());
    }

    #[test]
    fn test_spec_defaults_from_minimal_json() {
        let spec: ENINodeSpec = serde_json::from_value(serde_json::json!({
            "eni": {
                "instanceId": "i-1",
                "instanceType": "m4.large",
                "availabilityZone": "us-west-1",
                "vpcId": "vpc-1"
            }
        }))
        .unwrap();

        assert_eq!(spec.eni.pre_allocate, 0);
        assert_eq!(spec.eni.min_allocate, 0);
        assert!(spec.eni.subnet_tags.is_empty());
        assert!(spec.ipam.pool.is_empty());
    }
}
