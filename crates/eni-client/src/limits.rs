//! Interface limits per instance type
//!
//! Maximum number of network interfaces and addresses per interface for
//! common instance types, as published by the cloud provider.

use crate::models::InstanceCapacity;

/// Look up the capacity of an instance type.
///
/// Returns `None` for instance types that are not in the table.
pub fn lookup(instance_type: &str) -> Option<InstanceCapacity> {
    let (interfaces, addresses) = match instance_type {
        "a1.medium" => (2, 4),
        "a1.large" => (3, 10),
        "a1.xlarge" => (4, 15),
        "c4.large" => (3, 10),
        "c4.xlarge" => (4, 15),
        "c4.2xlarge" => (4, 15),
        "c4.4xlarge" => (8, 30),
        "c4.8xlarge" => (8, 30),
        "c5.large" => (3, 10),
        "c5.xlarge" => (4, 15),
        "c5.2xlarge" => (4, 15),
        "c5.4xlarge" => (8, 30),
        "c5.9xlarge" => (8, 30),
        "c5.18xlarge" => (15, 50),
        "m4.large" => (2, 10),
        "m4.xlarge" => (4, 15),
        "m4.2xlarge" => (4, 15),
        "m4.4xlarge" => (8, 30),
        "m4.10xlarge" => (8, 30),
        "m4.16xlarge" => (8, 30),
        "m5.large" => (3, 10),
        "m5.xlarge" => (4, 15),
        "m5.2xlarge" => (4, 15),
        "m5.4xlarge" => (8, 30),
        "m5.12xlarge" => (8, 30),
        "m5.24xlarge" => (15, 50),
        "r5.large" => (3, 10),
        "r5.xlarge" => (4, 15),
        "r5.2xlarge" => (4, 15),
        "r5.4xlarge" => (8, 30),
        "r5.12xlarge" => (8, 30),
        "t2.nano" => (2, 2),
        "t2.micro" => (2, 2),
        "t2.small" => (3, 4),
        "t2.medium" => (3, 6),
        "t2.large" => (3, 12),
        "t2.xlarge" => (3, 15),
        "t2.2xlarge" => (3, 15),
        "t3.nano" => (2, 2),
        "t3.micro" => (2, 2),
        "t3.small" => (3, 4),
        "t3.medium" => (3, 6),
        "t3.large" => (3, 12),
        "t3.xlarge" => (4, 15),
        "t3.2xlarge" => (4, 15),
        _ => return None,
    };

    Some(InstanceCapacity::new(interfaces, addresses))
}
