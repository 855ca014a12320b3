//! Per-node reconciliation.
//!
//! A `Node` owns the last snapshot of one `ENINode` resource and the derived
//! pool statistics. Each call to `reconcile()` computes the node's deficit and,
//! if addresses are missing, performs at most one allocation step: reserve on
//! the shared subnet inventory, create an interface if needed, ask the
//! provider for addresses, and merge them into the pool. Addresses the
//! instance already holds but the pool lacks are adopted first. The new pool
//! is then published through the resource store.
//!
//! State lives behind an async `RwLock` that is never held across provider or
//! store calls. A separate mutex keeps reconciliation passes of one node from
//! overlapping.

use crate::allocator::{self, AllocationPlan, Blocked, PlanInput};
use crate::config::ManagerConfig;
use crate::error::ControllerError;
use crate::metrics::{MetricsSink, NodeGauges};
use crate::store::ResourceStore;
use crate::subnets::SubnetInventory;
use chrono::{DateTime, Utc};
use crds::{AllocationIP, ENINode, ENINodeStatus, EniInterface, EniSpec, PoolStats};
use eni_client::{AllocatedAddress, CreateInterfaceRequest, InstanceCapacity, Interface, ProviderApi};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Collaborators shared by all nodes
pub struct ReconcileContext {
    /// Inventory service client
    pub provider: Arc<dyn ProviderApi>,
    /// Where pools and status are published
    pub store: Arc<dyn ResourceStore>,
    /// Allocation and pool metrics
    pub metrics: Arc<dyn MetricsSink>,
    /// Subnets shared by all nodes
    pub inventory: Arc<SubnetInventory>,
    /// Manager settings
    pub config: ManagerConfig,
}

/// Pool statistics of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Addresses in the pool
    pub available_ips: u32,
    /// Pool addresses in use by workloads
    pub used_ips: u32,
    /// Addresses the pool is short of
    pub needed_ips: u32,
}

impl NodeStats {
    fn compute(resource: &ENINode, default_pre_allocate: u32) -> Self {
        let available_ips = len_u32(resource.spec.ipam.pool.len());
        let used_ips = len_u32(resource.in_use().len());
        let pre_allocate = effective_pre_allocate(resource.spec.eni.pre_allocate, default_pre_allocate);
        Self {
            available_ips,
            used_ips,
            needed_ips: calculate_needed(available_ips, used_ips, resource.spec.eni.min_allocate, pre_allocate),
        }
    }
}

/// Snapshot of a node returned to callers
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    /// Resource name
    pub name: String,
    /// Cloud instance backing the node
    pub instance_id: String,
    /// Instance type, which sets the interface and address limits
    pub instance_type: String,
    /// Current pool statistics
    pub stats: NodeStats,
    /// Address pool keyed by address
    pub pool: BTreeMap<String, AllocationIP>,
    /// Pool addresses the node agent reports as in use
    pub in_use: BTreeSet<String>,
    /// Interfaces attached to the instance, as last observed
    pub interfaces: Vec<Interface>,
    /// The instance holds as many addresses as its type allows
    pub at_capacity: bool,
    /// End of the last reconciliation pass
    pub last_reconciled: Option<DateTime<Utc>>,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pool satisfies the node's policy
    Converged,
    /// `count` addresses were added; `needed` are still missing
    Allocated { count: u32, needed: u32 },
    /// Addresses are missing but the instance cannot hold more
    AtCapacity,
    /// Addresses are missing and no allocation is possible right now
    Blocked(Blocked),
    /// The chosen subnet was drained by another node in the meantime
    Deferred,
    /// A provider call failed
    Failed,
    /// The node has been deleted
    Retired,
}

/// Pre-allocation target for a configured value: 0 selects the default, a
/// negative value disables the buffer
pub fn effective_pre_allocate(pre_allocate: i32, default_pre_allocate: u32) -> u32 {
    match pre_allocate {
        0 => default_pre_allocate,
        p => u32::try_from(p).unwrap_or(0),
    }
}

/// Addresses a pool is short of:
/// `max(0, min_allocate - available, pre_allocate - (available - used))`
pub fn calculate_needed(available: u32, used: u32, min_allocate: i32, pre_allocate: u32) -> u32 {
    let available = i64::from(available);
    let free = available - i64::from(used);
    let below_min = i64::from(min_allocate) - available;
    let below_buffer = i64::from(pre_allocate) - free;
    u32::try_from(below_min.max(below_buffer).max(0)).unwrap_or(u32::MAX)
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[derive(Debug)]
struct NodeState {
    resource: ENINode,
    stats: NodeStats,
    interfaces: Vec<Interface>,
    at_capacity: bool,
    last_reconciled: Option<DateTime<Utc>>,
    publish_pending: bool,
    // Added to the pool here but not yet seen in an incoming snapshot
    unacknowledged: BTreeMap<String, AllocationIP>,
}

impl NodeState {
    fn recompute(&mut self, default_pre_allocate: u32) {
        self.stats = NodeStats::compute(&self.resource, default_pre_allocate);
    }

    /// The stored resource with the controller-owned status fields filled in
    fn published_resource(&self) -> ENINode {
        let mut resource = self.resource.clone();
        let status = resource.status.get_or_insert_with(ENINodeStatus::default);
        status.eni.enis = self
            .interfaces
            .iter()
            .map(|interface| {
                (
                    interface.id.clone(),
                    EniInterface {
                        id: interface.id.clone(),
                        index: interface.index,
                        subnet_id: interface.subnet_id.clone(),
                        addresses: interface.addresses.clone(),
                        security_groups: interface.security_groups.clone(),
                    },
                )
            })
            .collect();
        status.stats = Some(PoolStats {
            available: self.stats.available_ips,
            used: self.stats.used_ips,
            needed: self.stats.needed_ips,
            at_capacity: self.at_capacity,
        });
        resource
    }
}

/// Interfaces recorded in a resource's status
fn interfaces_from_status(resource: &ENINode) -> Vec<Interface> {
    let Some(status) = resource.status.as_ref() else {
        return Vec::new();
    };
    let mut interfaces: Vec<Interface> = status
        .eni
        .enis
        .values()
        .map(|eni| Interface {
            id: eni.id.clone(),
            instance_id: resource.spec.eni.instance_id.clone(),
            subnet_id: eni.subnet_id.clone(),
            index: eni.index,
            addresses: eni.addresses.clone(),
            security_groups: eni.security_groups.clone(),
        })
        .collect();
    interfaces.sort_by_key(|interface| interface.index);
    interfaces
}

/// Where the addresses of an allocation step go
enum Target {
    Existing(String),
    Create(u32),
}

/// Reconciliation unit for one cluster node
#[derive(Debug)]
pub struct Node {
    name: String,
    default_pre_allocate: u32,
    state: RwLock<NodeState>,
    reconcile_lock: Mutex<()>,
    retired: AtomicBool,
}

impl Node {
    /// Create a node from its first snapshot
    pub fn new(resource: ENINode, config: &ManagerConfig) -> Result<Self, ControllerError> {
        let name = resource
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidConfig("ENINode snapshot has no name".to_string()))?;

        let mut state = NodeState {
            interfaces: interfaces_from_status(&resource),
            resource,
            stats: NodeStats::default(),
            at_capacity: false,
            last_reconciled: None,
            publish_pending: false,
            unacknowledged: BTreeMap::new(),
        };
        state.recompute(config.default_pre_allocate);

        Ok(Self {
            name,
            default_pre_allocate: config.default_pre_allocate,
            state: RwLock::new(state),
            reconcile_lock: Mutex::new(()),
            retired: AtomicBool::new(false),
        })
    }

    /// Resource name of the node
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the stored resource with a newer snapshot.
    ///
    /// Addresses allocated by this node that the snapshot does not contain yet
    /// are merged back in, so a snapshot taken before our own publish landed
    /// cannot shrink the pool.
    pub async fn update(&self, snapshot: ENINode) -> NodeStats {
        let mut state = self.state.write().await;
        let mut resource = snapshot;

        state
            .unacknowledged
            .retain(|address, _| !resource.spec.ipam.pool.contains_key(address));
        for (address, allocation) in &state.unacknowledged {
            resource
                .spec
                .ipam
                .pool
                .insert(address.clone(), allocation.clone());
        }
        if !state.unacknowledged.is_empty() {
            debug!(
                "Snapshot of node {} is missing {} allocated addresses, keeping them",
                self.name,
                state.unacknowledged.len()
            );
            state.publish_pending = true;
        }

        state.resource = resource;
        state.recompute(self.default_pre_allocate);
        state.stats
    }

    /// Current pool statistics
    pub async fn stats(&self) -> NodeStats {
        self.state.read().await.stats
    }

    pub async fn at_capacity(&self) -> bool {
        self.state.read().await.at_capacity
    }

    /// Copy of the node's current state
    pub async fn view(&self) -> NodeView {
        let state = self.state.read().await;
        NodeView {
            name: self.name.clone(),
            instance_id: state.resource.spec.eni.instance_id.clone(),
            instance_type: state.resource.spec.eni.instance_type.clone(),
            stats: state.stats,
            pool: state.resource.spec.ipam.pool.clone(),
            in_use: state.resource.in_use(),
            interfaces: state.interfaces.clone(),
            at_capacity: state.at_capacity,
            last_reconciled: state.last_reconciled,
        }
    }

    /// Mark the node deleted. A retired node stops allocating and publishing.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Run one reconciliation pass: at most one allocation step, then publish.
    pub async fn reconcile(&self, ctx: &ReconcileContext) -> ReconcileOutcome {
        let _guard = self.reconcile_lock.lock().await;
        if self.is_retired() {
            return ReconcileOutcome::Retired;
        }

        let instance_type = self.state.read().await.resource.spec.eni.instance_type.clone();
        let capacity = match ctx.provider.instance_capacity(&instance_type) {
            Some(capacity) => capacity,
            None => {
                warn!(
                    "Unknown instance type '{}' for node {}, no addresses can be allocated",
                    instance_type, self.name
                );
                InstanceCapacity::default()
            }
        };

        let outcome = self.allocation_step(ctx, capacity).await;

        let (stats, at_capacity) = {
            let mut state = self.state.write().await;
            state.at_capacity = state.stats.available_ips >= capacity.total();
            state.last_reconciled = Some(Utc::now());
            (state.stats, state.at_capacity)
        };

        if self.is_retired() {
            return ReconcileOutcome::Retired;
        }
        self.publish(ctx).await;
        ctx.metrics.set_node_stats(
            &self.name,
            NodeGauges {
                available: stats.available_ips,
                used: stats.used_ips,
                needed: stats.needed_ips,
                at_capacity,
            },
        );
        outcome
    }

    async fn allocation_step(&self, ctx: &ReconcileContext, capacity: InstanceCapacity) -> ReconcileOutcome {
        let (spec, stats) = {
            let state = self.state.read().await;
            (state.resource.spec.eni.clone(), state.stats)
        };

        if stats.needed_ips == 0 {
            return ReconcileOutcome::Converged;
        }
        if stats.available_ips >= capacity.total() {
            debug!(
                "Node {} is at capacity ({} addresses), {} more needed",
                self.name, stats.available_ips, stats.needed_ips
            );
            return ReconcileOutcome::AtCapacity;
        }

        if let Err(e) = ctx
            .inventory
            .refresh_if_stale(ctx.provider.as_ref(), ctx.config.resync_interval)
            .await
        {
            return self.fail(ctx, "Failed to refresh subnet inventory", e);
        }

        let interfaces = match ctx.provider.list_interfaces(&spec.instance_id).await {
            Ok(interfaces) => interfaces,
            Err(e) => return self.fail(ctx, "Failed to list interfaces", e.into()),
        };
        let stats = self.adopt(&interfaces).await;
        if stats.needed_ips == 0 {
            return ReconcileOutcome::Converged;
        }
        if stats.available_ips >= capacity.total() {
            return ReconcileOutcome::AtCapacity;
        }

        let subnets = ctx
            .inventory
            .candidates(&spec.availability_zone, &spec.vpc_id, &spec.subnet_tags)
            .await;

        let plan = allocator::plan(PlanInput {
            needed: stats.needed_ips,
            available: stats.available_ips,
            capacity,
            interfaces: &interfaces,
            subnets: &subnets,
        });

        match plan {
            AllocationPlan::Existing {
                interface_id,
                subnet_id,
                count,
            } => {
                self.execute(ctx, &spec, Target::Existing(interface_id), subnet_id, count)
                    .await
            }
            AllocationPlan::Create {
                index,
                subnet_id,
                count,
            } => {
                self.execute(ctx, &spec, Target::Create(index), subnet_id, count)
                    .await
            }
            AllocationPlan::Blocked(Blocked::AtCapacity) => ReconcileOutcome::AtCapacity,
            AllocationPlan::Blocked(blocked) => {
                warn!(
                    "Node {} needs {} addresses but none can be allocated: {}",
                    self.name,
                    stats.needed_ips,
                    blocked.reason()
                );
                ctx.metrics.allocation_failure(&self.name, blocked.reason());
                ReconcileOutcome::Blocked(blocked)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &ReconcileContext,
        spec: &EniSpec,
        target: Target,
        subnet_id: String,
        count: u32,
    ) -> ReconcileOutcome {
        let reserved = ctx.inventory.reserve(&subnet_id, count).await;
        if reserved == 0 {
            debug!("Subnet {} drained before node {} could reserve addresses", subnet_id, self.name);
            return ReconcileOutcome::Deferred;
        }

        ctx.metrics.allocation_attempt(&self.name);

        let interface_id = match target {
            Target::Existing(interface_id) => interface_id,
            Target::Create(index) => {
                let request = CreateInterfaceRequest {
                    instance_id: spec.instance_id.clone(),
                    subnet_id: subnet_id.clone(),
                    index,
                    security_groups: spec.security_groups.clone(),
                };
                match ctx.provider.create_interface(&request).await {
                    Ok(interface) => {
                        info!(
                            "Created interface {} (index {}) in subnet {} for node {}",
                            interface.id, interface.index, subnet_id, self.name
                        );
                        ctx.metrics.interface_created(&self.name);
                        let id = interface.id.clone();
                        self.state.write().await.interfaces.push(interface);
                        id
                    }
                    Err(e) => {
                        ctx.inventory.release(&subnet_id, reserved).await;
                        return self.fail(ctx, "Failed to create interface", e.into());
                    }
                }
            }
        };

        let allocated = match ctx.provider.allocate_addresses(&interface_id, reserved).await {
            Ok(allocated) => allocated,
            Err(e) => {
                ctx.inventory.release(&subnet_id, reserved).await;
                return self.fail(ctx, "Failed to allocate addresses", e.into());
            }
        };

        let count = len_u32(allocated.len());
        if count < reserved {
            ctx.inventory.release(&subnet_id, reserved - count).await;
        }
        if count == 0 {
            return ReconcileOutcome::Deferred;
        }

        let stats = self.merge(allocated).await;
        ctx.metrics.allocation_success(&self.name, count);
        info!(
            "Allocated {} addresses on interface {} for node {} ({} available, {} needed)",
            count, interface_id, self.name, stats.available_ips, stats.needed_ips
        );

        ReconcileOutcome::Allocated {
            count,
            needed: stats.needed_ips,
        }
    }

    /// Record the interfaces the provider reports. Addresses they hold that
    /// the pool lacks are taken into the pool as free entries.
    async fn adopt(&self, interfaces: &[Interface]) -> NodeStats {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let mut adopted = 0;
        for interface in interfaces {
            for address in &interface.addresses {
                if state.resource.spec.ipam.pool.contains_key(address) {
                    continue;
                }
                let allocation = AllocationIP {
                    resource: interface.id.clone(),
                    owner: None,
                };
                state.unacknowledged.insert(address.clone(), allocation.clone());
                state.resource.spec.ipam.pool.insert(address.clone(), allocation);
                adopted += 1;
            }
        }
        state.interfaces = interfaces.to_vec();

        if adopted > 0 {
            info!(
                "Adopted {} addresses already attached to the instance of node {}",
                adopted, self.name
            );
            state.publish_pending = true;
            state.recompute(self.default_pre_allocate);
        }
        state.stats
    }

    /// Add freshly allocated addresses to the pool as free entries
    async fn merge(&self, allocated: Vec<AllocatedAddress>) -> NodeStats {
        let mut state = self.state.write().await;
        for address in allocated {
            let allocation = AllocationIP {
                resource: address.interface_id.clone(),
                owner: None,
            };
            if let Some(interface) = state
                .interfaces
                .iter_mut()
                .find(|interface| interface.id == address.interface_id)
            {
                if !interface.addresses.contains(&address.address) {
                    interface.addresses.push(address.address.clone());
                }
            }
            state
                .unacknowledged
                .insert(address.address.clone(), allocation.clone());
            state
                .resource
                .spec
                .ipam
                .pool
                .insert(address.address, allocation);
        }
        state.publish_pending = true;
        state.recompute(self.default_pre_allocate);
        state.stats
    }

    fn fail(&self, ctx: &ReconcileContext, context: &str, error: ControllerError) -> ReconcileOutcome {
        warn!("{} for node {}: {}", context, self.name, error);
        ctx.metrics.allocation_failure(&self.name, error.reason());
        ReconcileOutcome::Failed
    }

    /// Publish pool and status if they changed since the last publish.
    /// Failures leave the publish pending for the next pass.
    async fn publish(&self, ctx: &ReconcileContext) {
        let resource = {
            let state = self.state.read().await;
            let resource = state.published_resource();
            if !state.publish_pending && state.resource.status == resource.status {
                return;
            }
            resource
        };

        match self.push(ctx, &resource).await {
            Ok(()) => {
                let mut state = self.state.write().await;
                state.publish_pending = false;
                if let Some(published) = resource.status {
                    let status = state.resource.status.get_or_insert_with(ENINodeStatus::default);
                    status.eni = published.eni;
                    status.stats = published.stats;
                }
                debug!("Published node {}", self.name);
            }
            Err(e) => {
                warn!("Failed to publish node {}, will retry: {}", self.name, e);
                self.state.write().await.publish_pending = true;
            }
        }
    }

    async fn push(&self, ctx: &ReconcileContext, resource: &ENINode) -> Result<(), ControllerError> {
        ctx.store.update(resource).await?;
        ctx.store.update_status(resource).await
    }
}
