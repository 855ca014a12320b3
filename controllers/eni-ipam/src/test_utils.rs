//! Test utilities for unit testing the node manager
//!
//! This module provides builders for test resources, a metrics sink that
//! records what it is told, and polling helpers for asynchronous convergence.

use crate::config::ManagerConfig;
use crate::metrics::{MetricsSink, NodeGauges};
use crate::node::NodeView;
use crate::node_manager::NodeManager;
use crate::store::InMemoryResourceStore;
use crds::{AllocationIP, ENINode, ENINodeSpec, ENINodeStatus, EniSpec};
use eni_client::{MockProviderApi, Subnet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};

pub const TEST_ZONE: &str = "us-west-1";
pub const TEST_VPC: &str = "vpc-1";

/// Subnet in the test zone and VPC
pub fn test_subnet(id: &str, available: u32) -> Subnet {
    Subnet {
        id: id.to_string(),
        availability_zone: TEST_ZONE.to_string(),
        vpc_id: TEST_VPC.to_string(),
        available_addresses: available,
        tags: BTreeMap::new(),
    }
}

/// Helper to create a test ENINode with an empty pool
pub fn new_eni_node(
    name: &str,
    instance_id: &str,
    instance_type: &str,
    pre_allocate: i32,
    min_allocate: i32,
) -> ENINode {
    ENINode {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: ENINodeSpec {
            eni: EniSpec {
                instance_id: instance_id.to_string(),
                instance_type: instance_type.to_string(),
                availability_zone: TEST_ZONE.to_string(),
                vpc_id: TEST_VPC.to_string(),
                pre_allocate,
                min_allocate,
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    }
}

/// Snapshot of `node` carrying the pool the manager currently holds
pub fn with_pool(mut node: ENINode, pool: BTreeMap<String, AllocationIP>) -> ENINode {
    node.spec.ipam.pool = pool;
    node
}

/// Mark the first `used` pool addresses as in use, the way the node agent does
pub fn with_usage(mut node: ENINode, used: usize) -> ENINode {
    let in_use: BTreeMap<String, AllocationIP> = node
        .spec
        .ipam
        .pool
        .iter()
        .take(used)
        .map(|(address, allocation)| {
            (
                address.clone(),
                AllocationIP {
                    resource: allocation.resource.clone(),
                    owner: Some(format!("pod-{}", address)),
                },
            )
        })
        .collect();
    let status = node.status.get_or_insert_with(ENINodeStatus::default);
    status.ipam.used = in_use;
    node
}

/// Manager wired to in-memory collaborators
pub struct TestHarness {
    pub provider: MockProviderApi,
    pub store: Arc<InMemoryResourceStore>,
    pub metrics: Arc<RecordingMetrics>,
    pub manager: NodeManager,
}

/// Build a manager over the given subnets with a short resync interval
pub fn harness(subnets: Vec<Subnet>) -> TestHarness {
    let provider = MockProviderApi::new(subnets);
    let store = Arc::new(InMemoryResourceStore::new());
    let metrics = Arc::new(RecordingMetrics::default());
    let config = ManagerConfig {
        resync_interval: Duration::from_millis(200),
        ..ManagerConfig::default()
    };
    let manager = NodeManager::new(
        Arc::new(provider.clone()),
        store.clone(),
        metrics.clone(),
        config,
    );
    TestHarness {
        provider,
        store,
        metrics,
        manager,
    }
}

/// Poll a node until `predicate` holds or `timeout` elapses
pub async fn wait_for_node<F>(manager: &NodeManager, name: &str, timeout: Duration, predicate: F) -> Option<NodeView>
where
    F: Fn(&NodeView) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(view) = manager.get(name).await {
            if predicate(&view) {
                return Some(view);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Metrics sink that records events for assertions
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub attempts: Mutex<u64>,
    pub allocated: Mutex<u64>,
    pub failures: Mutex<HashMap<String, u64>>,
    pub interfaces_created: Mutex<u64>,
    pub nodes: Mutex<HashMap<String, NodeGauges>>,
    pub removed: Mutex<Vec<String>>,
}

impl RecordingMetrics {
    pub fn failures(&self, reason: &str) -> u64 {
        self.failures.lock().unwrap().get(reason).copied().unwrap_or(0)
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.lock().unwrap().values().sum()
    }
}

impl MetricsSink for RecordingMetrics {
    fn allocation_attempt(&self, _node: &str) {
        *self.attempts.lock().unwrap() += 1;
    }

    fn allocation_success(&self, _node: &str, count: u32) {
        *self.allocated.lock().unwrap() += u64::from(count);
    }

    fn allocation_failure(&self, _node: &str, reason: &str) {
        *self
            .failures
            .lock()
            .unwrap()
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    fn interface_created(&self, _node: &str) {
        *self.interfaces_created.lock().unwrap() += 1;
    }

    fn set_node_stats(&self, node: &str, gauges: NodeGauges) {
        self.nodes.lock().unwrap().insert(node.to_string(), gauges);
    }

    fn remove_node(&self, node: &str) {
        self.nodes.lock().unwrap().remove(node);
        self.removed.lock().unwrap().push(node.to_string());
    }
}
