//! ENI IPAM Controller
//!
//! Keeps the address pool of every cluster node at the size its
//! pre-allocation and minimum-allocation policy asks for, within the
//! interface and per-interface address limits of the node's instance type.
//!
//! - `node_manager`: registry of nodes and their reconciliation tasks
//! - `node`: deficit computation and one allocation step per pass
//! - `allocator`: choice of interface and subnet for the next batch
//! - `subnets`: shared subnet inventory with reservations
//! - `store`: publishing pools and status back to `ENINode` resources
//! - `metrics`, `server`: Prometheus metrics and their HTTP endpoint
//! - `watcher`: `ENINode` watch feeding the manager

pub mod allocator;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod node_manager;
pub mod server;
pub mod store;
pub mod subnets;
pub mod watcher;

#[cfg(test)]
mod node_manager_test;
#[cfg(test)]
mod test_utils;

pub use config::{Config, ManagerConfig};
pub use error::ControllerError;
pub use node::{NodeStats, NodeView};
pub use node_manager::{ManagerStats, NodeManager};
