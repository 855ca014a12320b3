//! Node manager.
//!
//! Registry of nodes keyed by name. Every registered node gets a long-lived
//! task that reconciles it when triggered by an upsert and on a fixed
//! cadence. While a pass makes progress and addresses are still missing, the
//! task goes again right away, yielding in between so one node cannot starve
//! the others.

use crate::config::ManagerConfig;
use crate::error::ControllerError;
use crate::metrics::{AggregateGauges, MetricsSink, NodeGauges};
use crate::node::{Node, NodeView, ReconcileContext, ReconcileOutcome};
use crate::store::ResourceStore;
use crate::subnets::SubnetInventory;
use crds::ENINode;
use eni_client::ProviderApi;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Totals across all registered nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Registered nodes
    pub nodes: usize,
    /// Addresses in all pools
    pub available: u64,
    /// Pool addresses in use
    pub used: u64,
    /// Addresses missing across all nodes
    pub needed: u64,
    /// Nodes whose instance cannot hold more addresses
    pub nodes_at_capacity: usize,
}

struct NodeHandle {
    node: Arc<Node>,
    trigger: mpsc::Sender<()>,
    // Detached on drop; the task exits once `trigger` is gone
    _task: JoinHandle<()>,
}

impl NodeHandle {
    fn trigger(&self) {
        // A full channel already has a pass queued
        let _ = self.trigger.try_send(());
    }
}

/// Keeps the address pools of all registered nodes at their target size
pub struct NodeManager {
    nodes: RwLock<HashMap<String, NodeHandle>>,
    ctx: Arc<ReconcileContext>,
}

impl NodeManager {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        store: Arc<dyn ResourceStore>,
        metrics: Arc<dyn MetricsSink>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            ctx: Arc::new(ReconcileContext {
                provider,
                store,
                metrics,
                inventory: Arc::new(SubnetInventory::new()),
                config,
            }),
        }
    }

    /// Shared subnet inventory
    pub fn inventory(&self) -> &SubnetInventory {
        &self.ctx.inventory
    }

    /// Register a node or apply a newer snapshot of it, then schedule a pass.
    pub async fn upsert(&self, resource: ENINode) -> Result<(), ControllerError> {
        let name = resource
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidConfig("ENINode snapshot has no name".to_string()))?;

        let mut nodes = self.nodes.write().await;
        if let Some(handle) = nodes.get(&name) {
            let stats = handle.node.update(resource).await;
            debug!(
                "Updated node {}: {} available, {} used, {} needed",
                name, stats.available_ips, stats.used_ips, stats.needed_ips
            );
            handle.trigger();
            return Ok(());
        }

        let node = Arc::new(Node::new(resource, &self.ctx.config)?);
        let stats = node.stats().await;
        info!(
            "Registered node {}: {} available, {} used, {} needed",
            name, stats.available_ips, stats.used_ips, stats.needed_ips
        );
        self.ctx.metrics.set_node_stats(
            &name,
            NodeGauges {
                available: stats.available_ips,
                used: stats.used_ips,
                needed: stats.needed_ips,
                at_capacity: false,
            },
        );

        let (trigger, triggers) = mpsc::channel(1);
        let task = tokio::spawn(run_node(node.clone(), self.ctx.clone(), triggers));
        let handle = NodeHandle {
            node,
            trigger,
            _task: task,
        };
        handle.trigger();
        nodes.insert(name, handle);
        Ok(())
    }

    /// Unregister a node and stop reconciling it. Unknown names are ignored.
    pub async fn delete(&self, name: &str) {
        let Some(handle) = self.nodes.write().await.remove(name) else {
            debug!("Delete of unknown node {} ignored", name);
            return;
        };
        handle.node.retire();
        self.ctx.metrics.remove_node(name);
        info!("Deleted node {}", name);
    }

    /// Current view of a node
    pub async fn get(&self, name: &str) -> Option<NodeView> {
        let node = self.nodes.read().await.get(name).map(|h| h.node.clone())?;
        Some(node.view().await)
    }

    /// Names of all registered nodes, in no particular order
    pub async fn get_names(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Refresh the subnet inventory and schedule a pass for every node
    pub async fn resync(&self) -> Result<(), ControllerError> {
        let refreshed = self.ctx.inventory.refresh(self.ctx.provider.as_ref()).await;

        let count = {
            let nodes = self.nodes.read().await;
            for handle in nodes.values() {
                handle.trigger();
            }
            nodes.len()
        };

        let stats = self.stats().await;
        info!(
            "Resync: {} nodes, {} available, {} used, {} needed, {} at capacity",
            count, stats.available, stats.used, stats.needed, stats.nodes_at_capacity
        );

        match refreshed {
            Ok(subnets) => {
                debug!("Subnet inventory holds {} subnets", subnets);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to refresh subnet inventory during resync: {}", e);
                Err(e)
            }
        }
    }

    /// Totals across all registered nodes; also exported as gauges
    pub async fn stats(&self) -> ManagerStats {
        let nodes: Vec<Arc<Node>> = self
            .nodes
            .read()
            .await
            .values()
            .map(|h| h.node.clone())
            .collect();

        let mut stats = ManagerStats {
            nodes: nodes.len(),
            ..ManagerStats::default()
        };
        for node in nodes {
            let view = node.stats().await;
            stats.available += u64::from(view.available_ips);
            stats.used += u64::from(view.used_ips);
            stats.needed += u64::from(view.needed_ips);
            if node.at_capacity().await {
                stats.nodes_at_capacity += 1;
            }
        }

        self.ctx.metrics.set_aggregate(AggregateGauges {
            nodes: stats.nodes,
            available: stats.available,
            used: stats.used,
            needed: stats.needed,
            nodes_at_capacity: stats.nodes_at_capacity,
        });
        stats
    }
}

/// Reconciliation task of one node.
///
/// Runs a pass on every trigger and every resync tick until the trigger
/// sender is dropped or the node is retired.
async fn run_node(node: Arc<Node>, ctx: Arc<ReconcileContext>, mut triggers: mpsc::Receiver<()>) {
    let period = ctx.config.resync_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        loop {
            match node.reconcile(&ctx).await {
                ReconcileOutcome::Allocated { needed, .. } if needed > 0 => {
                    tokio::task::yield_now().await;
                }
                ReconcileOutcome::Retired => {
                    debug!("Node {} retired, stopping reconciliation", node.name());
                    return;
                }
                _ => break,
            }
        }
    }
    debug!("Reconciliation task of node {} stopped", node.name());
}
