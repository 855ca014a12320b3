//! ENI IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the ENI IPAM controller.

pub mod eni_node;

pub use eni_node::*;
