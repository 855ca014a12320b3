//! Allocation planning.
//!
//! Decides where the next batch of addresses for a node comes from: an
//! existing interface with room left, or a new interface on the subnet with
//! the most addresses remaining. Planning is pure; the node carries out the
//! plan against the provider.

use eni_client::{InstanceCapacity, Interface, Subnet};
use std::collections::BTreeSet;

/// Why no allocation can be made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// The instance holds as many addresses as its type allows
    AtCapacity,
    /// No eligible subnet has addresses left
    NoEligibleSubnet,
    /// Every interface slot is taken and none of them has room
    InterfaceLimit,
}

impl Blocked {
    pub fn reason(&self) -> &'static str {
        match self {
            Blocked::AtCapacity => "at_capacity",
            Blocked::NoEligibleSubnet => "no_eligible_subnet",
            Blocked::InterfaceLimit => "interface_limit",
        }
    }
}

/// Next allocation step for a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationPlan {
    /// Add `count` addresses to an attached interface
    Existing {
        interface_id: String,
        subnet_id: String,
        count: u32,
    },
    /// Attach a new interface at `index` in `subnet_id`, then add `count` addresses
    Create {
        index: u32,
        subnet_id: String,
        count: u32,
    },
    Blocked(Blocked),
}

/// Inputs of one planning step
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    /// Addresses the pool is short of (> 0)
    pub needed: u32,
    /// Current pool size
    pub available: u32,
    pub capacity: InstanceCapacity,
    /// Interfaces attached to the instance
    pub interfaces: &'a [Interface],
    /// Eligible subnets with addresses remaining
    pub subnets: &'a [Subnet],
}

/// Plan the next allocation step.
///
/// Existing interfaces are preferred: among those with room left on an
/// eligible subnet, the one whose subnet has the most addresses remaining
/// wins, then the lowest device index. Otherwise a new interface is planned
/// at the lowest free device index in the subnet with the most addresses
/// remaining (ties by subnet ID). The batch is limited by the deficit, the
/// interface's room, the subnet's remaining addresses and the instance's
/// total capacity.
pub fn plan(input: PlanInput<'_>) -> AllocationPlan {
    let total = input.capacity.total();
    if input.available >= total {
        return AllocationPlan::Blocked(Blocked::AtCapacity);
    }
    let headroom = total - input.available;
    let per_interface = input.capacity.max_addresses_per_interface;

    let existing = input
        .interfaces
        .iter()
        .filter_map(|interface| {
            let used = u32::try_from(interface.addresses.len()).unwrap_or(u32::MAX);
            let spare = per_interface.saturating_sub(used);
            if spare == 0 {
                return None;
            }
            let subnet = input.subnets.iter().find(|s| s.id == interface.subnet_id)?;
            Some((interface, subnet, spare))
        })
        .max_by(|(a, a_subnet, _), (b, b_subnet, _)| {
            a_subnet
                .available_addresses
                .cmp(&b_subnet.available_addresses)
                .then_with(|| b.index.cmp(&a.index))
        });

    if let Some((interface, subnet, spare)) = existing {
        return AllocationPlan::Existing {
            interface_id: interface.id.clone(),
            subnet_id: subnet.id.clone(),
            count: batch_size(input.needed, spare, subnet.available_addresses, headroom),
        };
    }

    if input.interfaces.len() >= input.capacity.max_interfaces as usize {
        return AllocationPlan::Blocked(Blocked::InterfaceLimit);
    }

    let subnet = input
        .subnets
        .iter()
        .filter(|subnet| subnet.available_addresses > 0)
        .max_by(|a, b| {
            a.available_addresses
                .cmp(&b.available_addresses)
                .then_with(|| b.id.cmp(&a.id))
        });
    let Some(subnet) = subnet else {
        return AllocationPlan::Blocked(Blocked::NoEligibleSubnet);
    };
    if per_interface == 0 {
        return AllocationPlan::Blocked(Blocked::AtCapacity);
    }

    AllocationPlan::Create {
        index: next_free_index(input.interfaces),
        subnet_id: subnet.id.clone(),
        count: batch_size(input.needed, per_interface, subnet.available_addresses, headroom),
    }
}

fn batch_size(needed: u32, spare: u32, subnet_remaining: u32, headroom: u32) -> u32 {
    needed.min(spare).min(subnet_remaining).min(headroom)
}

/// Lowest device index not used by an attached interface
fn next_free_index(interfaces: &[Interface]) -> u32 {
    let taken: BTreeSet<u32> = interfaces.iter().map(|i| i.index).collect();
    (0..).find(|index| !taken.contains(index)).unwrap_or(0)
}
