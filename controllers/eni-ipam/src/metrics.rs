//! Allocation metrics.
//!
//! The node manager reports through the `MetricsSink` trait. `PrometheusMetrics`
//! keeps counters and gauges in its own registry and renders them in the text
//! exposition format for the `/metrics` endpoint. `NoopMetrics` discards
//! everything.

use crate::error::ControllerError;
use std::fmt;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Pool statistics of one node, as reported to metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeGauges {
    /// Addresses in the pool
    pub available: u32,
    /// Pool addresses in use
    pub used: u32,
    /// Addresses the pool is short of
    pub needed: u32,
    /// The instance cannot hold more addresses
    pub at_capacity: bool,
}

/// Totals across all registered nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateGauges {
    /// Registered nodes
    pub nodes: usize,
    /// Addresses in all pools
    pub available: u64,
    /// Pool addresses in use
    pub used: u64,
    /// Addresses missing across all nodes
    pub needed: u64,
    /// Nodes whose instance is full
    pub nodes_at_capacity: usize,
}

/// Receiver of allocation events and pool gauges
pub trait MetricsSink: Send + Sync {
    /// An allocation step is about to call the provider
    fn allocation_attempt(&self, node: &str);

    /// The provider handed out `count` addresses
    fn allocation_success(&self, node: &str, count: u32);

    /// An allocation step failed
    fn allocation_failure(&self, node: &str, reason: &str);

    /// A new interface was attached to the node's instance
    fn interface_created(&self, node: &str);

    /// Pool statistics of a node changed
    fn set_node_stats(&self, node: &str, gauges: NodeGauges);

    /// The node was deleted; drop its series
    fn remove_node(&self, node: &str);

    /// Totals across all nodes
    fn set_aggregate(&self, _gauges: AggregateGauges) {}
}

/// Metrics sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn allocation_attempt(&self, _node: &str) {}
    fn allocation_success(&self, _node: &str, _count: u32) {}
    fn allocation_failure(&self, _node: &str, _reason: &str) {}
    fn interface_created(&self, _node: &str) {}
    fn set_node_stats(&self, _node: &str, _gauges: NodeGauges) {}
    fn remove_node(&self, _node: &str) {}
}

/// Prometheus-backed metrics sink
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    allocation_attempts: IntCounterVec,
    allocation_successes: IntCounterVec,
    allocated_addresses: IntCounterVec,
    allocation_failures: IntCounterVec,
    interfaces_created: IntCounterVec,
    node_available: IntGaugeVec,
    node_used: IntGaugeVec,
    node_needed: IntGaugeVec,
    node_at_capacity: IntGaugeVec,
    nodes: IntGauge,
    available: IntGauge,
    used: IntGauge,
    needed: IntGauge,
    nodes_at_capacity: IntGauge,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, ControllerError> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str) -> Result<IntGaugeVec, ControllerError> {
    let metric = IntGaugeVec::new(Opts::new(name, help), &["node"])?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, ControllerError> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Create the metric families in a fresh registry
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        Ok(Self {
            allocation_attempts: counter_vec(
                &registry,
                "eni_ipam_allocation_attempts_total",
                "Allocation steps that called the provider.",
                &["node"],
            )?,
            allocation_successes: counter_vec(
                &registry,
                "eni_ipam_allocation_successes_total",
                "Allocation steps that succeeded.",
                &["node"],
            )?,
            allocated_addresses: counter_vec(
                &registry,
                "eni_ipam_allocated_addresses_total",
                "Addresses added to node pools.",
                &["node"],
            )?,
            allocation_failures: counter_vec(
                &registry,
                "eni_ipam_allocation_failures_total",
                "Allocation steps that failed, by reason.",
                &["node", "reason"],
            )?,
            interfaces_created: counter_vec(
                &registry,
                "eni_ipam_interfaces_created_total",
                "Interfaces attached to node instances.",
                &["node"],
            )?,
            node_available: gauge_vec(&registry, "eni_ipam_node_available_ips", "Addresses in the node pool.")?,
            node_used: gauge_vec(&registry, "eni_ipam_node_used_ips", "Pool addresses in use on the node.")?,
            node_needed: gauge_vec(&registry, "eni_ipam_node_needed_ips", "Addresses the node pool is short of.")?,
            node_at_capacity: gauge_vec(
                &registry,
                "eni_ipam_node_at_capacity",
                "1 if the node's instance cannot hold more addresses.",
            )?,
            nodes: gauge(&registry, "eni_ipam_nodes", "Registered nodes.")?,
            available: gauge(&registry, "eni_ipam_available_ips", "Addresses in all node pools.")?,
            used: gauge(&registry, "eni_ipam_used_ips", "Pool addresses in use on all nodes.")?,
            needed: gauge(&registry, "eni_ipam_needed_ips", "Addresses all node pools are short of.")?,
            nodes_at_capacity: gauge(
                &registry,
                "eni_ipam_nodes_at_capacity",
                "Nodes whose instance cannot hold more addresses.",
            )?,
            registry,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, ControllerError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics output is not UTF-8: {}", e)).into())
    }
}

impl MetricsSink for PrometheusMetrics {
    fn allocation_attempt(&self, node: &str) {
        self.allocation_attempts.with_label_values(&[node]).inc();
    }

    fn allocation_success(&self, node: &str, count: u32) {
        self.allocation_successes.with_label_values(&[node]).inc();
        self.allocated_addresses
            .with_label_values(&[node])
            .inc_by(u64::from(count));
    }

    fn allocation_failure(&self, node: &str, reason: &str) {
        self.allocation_failures
            .with_label_values(&[node, reason])
            .inc();
    }

    fn interface_created(&self, node: &str) {
        self.interfaces_created.with_label_values(&[node]).inc();
    }

    fn set_node_stats(&self, node: &str, gauges: NodeGauges) {
        self.node_available
            .with_label_values(&[node])
            .set(i64::from(gauges.available));
        self.node_used.with_label_values(&[node]).set(i64::from(gauges.used));
        self.node_needed
            .with_label_values(&[node])
            .set(i64::from(gauges.needed));
        self.node_at_capacity
            .with_label_values(&[node])
            .set(i64::from(gauges.at_capacity));
    }

    fn remove_node(&self, node: &str) {
        // Missing series are not an error here
        for vec in [&self.node_available, &self.node_used, &self.node_needed, &self.node_at_capacity] {
            let _ = vec.remove_label_values(&[node]);
        }
        for vec in [
            &self.allocation_attempts,
            &self.allocation_successes,
            &self.allocated_addresses,
            &self.interfaces_created,
        ] {
            let _ = vec.remove_label_values(&[node]);
        }
    }

    fn set_aggregate(&self, gauges: AggregateGauges) {
        self.nodes.set(saturating_i64(gauges.nodes as u64));
        self.available.set(saturating_i64(gauges.available));
        self.used.set(saturating_i64(gauges.used));
        self.needed.set(saturating_i64(gauges.needed));
        self.nodes_at_capacity
            .set(saturating_i64(gauges.nodes_at_capacity as u64));
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_values() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.allocation_attempt("node1");
        metrics.allocation_success("node1", 8);
        metrics.allocation_failure("node1", "subnet_exhausted");
        metrics.set_node_stats(
            "node1",
            NodeGauges {
                available: 8,
                used: 2,
                needed: 0,
                at_capacity: false,
            },
        );

        let text = metrics.encode().unwrap();
        assert!(format!("{:?}", metrics).starts_with("PrometheusMetrics"));
        assert!(text.contains("eni_ipam_allocated_addresses_total{node=\"node1\"} 8"));
        assert!(text.contains("eni_ipam_node_used_ips{node=\"node1\"} 2"));
        assert!(text.contains("reason=\"subnet_exhausted\""));
    }

    #[test]
    fn test_remove_node_drops_series() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_node_stats("node1", NodeGauges::default());
        metrics.set_node_stats("node2", NodeGauges::default());
        metrics.remove_node("node1");

        let text = metrics.encode().unwrap();
        assert!(!text.contains("node=\"node1\""));
        assert!(text.contains("node=\"node2\""));
    }

    #[test]
    fn test_aggregate_gauges() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_aggregate(AggregateGauges {
            nodes: 3,
            available: 30,
            used: 12,
            needed: 4,
            nodes_at_capacity: 1,
        });

        let text = metrics.encode().unwrap();
        assert!(text.contains("eni_ipam_nodes 3"));
        assert!(text.contains("eni_ipam_needed_ips 4"));
        assert!(text.contains("eni_ipam_nodes_at_capacity 1"));
    }
}
