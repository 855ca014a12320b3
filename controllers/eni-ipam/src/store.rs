//! Publishing node state.
//!
//! The controller writes two things back for each node: the address pool in
//! `spec.ipam.pool`, and the observed interfaces plus pool statistics in
//! `status.eni`/`status.stats`. `status.ipam.used` belongs to the node agent
//! and is never written here.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::ENINode;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Destination of published node state
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Publish the node's address pool
    async fn update(&self, node: &ENINode) -> Result<(), ControllerError>;

    /// Publish the node's interfaces and pool statistics
    async fn update_status(&self, node: &ENINode) -> Result<(), ControllerError>;
}

fn node_name(node: &ENINode) -> Result<String, ControllerError> {
    node.metadata
        .name
        .clone()
        .ok_or_else(|| ControllerError::InvalidConfig("ENINode has no name".to_string()))
}

/// Store backed by the `ENINode` custom resource
#[derive(Clone)]
pub struct KubeResourceStore {
    api: Api<ENINode>,
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn update(&self, node: &ENINode) -> Result<(), ControllerError> {
        let name = node_name(node)?;
        let patch = json!({
            "spec": {
                "ipam": {
                    "pool": node.spec.ipam.pool
                }
            }
        });

        let pp = PatchParams::default();
        self.api
            .patch(&name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::Store(format!("Failed to update ENINode {} pool: {}", name, e)))?;
        debug!("Published pool of ENINode {} ({} addresses)", name, node.spec.ipam.pool.len());
        Ok(())
    }

    async fn update_status(&self, node: &ENINode) -> Result<(), ControllerError> {
        let name = node_name(node)?;
        let Some(status) = node.status.as_ref() else {
            return Ok(());
        };
        let status_patch = json!({
            "status": {
                "eni": status.eni,
                "stats": status.stats
            }
        });

        let pp = PatchParams::default();
        self.api
            .patch_status(&name, &pp, &Patch::Merge(&status_patch))
            .await
            .map_err(|e| ControllerError::Store(format!("Failed to update ENINode {} status: {}", name, e)))?;
        debug!("Published status of ENINode {}", name);
        Ok(())
    }
}

/// In-memory store that keeps the last published resource per node
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    nodes: Mutex<HashMap<String, ENINode>>,
    updates: Mutex<u64>,
    status_updates: Mutex<u64>,
    failing: Mutex<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail until reset
    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    /// Last published state of a node
    pub fn get(&self, name: &str) -> Option<ENINode> {
        lock(&self.nodes).get(name).cloned()
    }

    /// Number of successful pool publishes
    pub fn updates(&self) -> u64 {
        *lock(&self.updates)
    }

    /// Number of successful status publishes
    pub fn status_updates(&self) -> u64 {
        *lock(&self.status_updates)
    }

    fn check_failing(&self, name: &str) -> Result<(), ControllerError> {
        if *lock(&self.failing) {
            return Err(ControllerError::Store(format!("Store unavailable for ENINode {}", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn update(&self, node: &ENINode) -> Result<(), ControllerError> {
        let name = node_name(node)?;
        self.check_failing(&name)?;

        let mut nodes = lock(&self.nodes);
        let stored = nodes.entry(name).or_insert_with(|| node.clone());
        stored.spec = node.spec.clone();
        *lock(&self.updates) += 1;
        Ok(())
    }

    async fn update_status(&self, node: &ENINode) -> Result<(), ControllerError> {
        let name = node_name(node)?;
        self.check_failing(&name)?;

        let mut nodes = lock(&self.nodes);
        let stored = nodes.entry(name).or_insert_with(|| node.clone());
        stored.status = node.status.clone();
        *lock(&self.status_updates) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::new_eni_node;

    #[tokio::test]
    async fn test_in_memory_store_keeps_last_publish() {
        let store = InMemoryResourceStore::new();
        let mut node = new_eni_node("node1", "i-1", "m4.large", 0, 0);
        node.spec.ipam.pool.insert(
            "10.0.0.1".to_string(),
            crds::AllocationIP {
                resource: "eni-1".to_string(),
                owner: None,
            },
        );

        store.update(&node).await.unwrap();
        store.update_status(&node).await.unwrap();

        let stored = store.get("node1").unwrap();
        assert_eq!(stored.spec.ipam.pool.len(), 1);
        assert_eq!(store.updates(), 1);
        assert_eq!(store.status_updates(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_store_failure_mode() {
        let store = InMemoryResourceStore::new();
        let node = new_eni_node("node1", "i-1", "m4.large", 0, 0);

        store.set_failing(true);
        assert!(matches!(store.update(&node).await, Err(ControllerError::Store(_))));
        assert!(store.get("node1").is_none());

        store.set_failing(false);
        store.update(&node).await.unwrap();
        assert!(store.get("node1").is_some());
    }

    #[tokio::test]
    async fn test_unnamed_node_rejected() {
        let store = InMemoryResourceStore::new();
        let mut node = new_eni_node("node1", "i-1", "m4.large", 0, 0);
        node.metadata.name = None;
        assert!(matches!(store.update(&node).await, Err(ControllerError::InvalidConfig(_))));
    }
}
