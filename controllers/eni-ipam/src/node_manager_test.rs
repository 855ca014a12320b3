//! Unit tests for the node manager

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::node::NodeStats;
    use crate::test_utils::*;
    use crds::ENINode;
    use eni_client::Interface;
    use futures::future::join_all;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn stats(available_ips: u32, used_ips: u32, needed_ips: u32) -> NodeStats {
        NodeStats {
            available_ips,
            used_ips,
            needed_ips,
        }
    }

    /// Snapshot as the node agent would report it: the current pool with
    /// `used` addresses in use
    async fn agent_snapshot(h: &TestHarness, node: ENINode, used: usize) -> ENINode {
        let name = node.metadata.name.clone().unwrap();
        let view = h.manager.get(&name).await.expect("node not registered");
        with_usage(with_pool(node, view.pool), used)
    }

    /// Interface already attached to `i-1` holding `count` addresses
    fn attached(id: &str, index: u32, count: u32) -> Interface {
        Interface {
            id: id.to_string(),
            instance_id: "i-1".to_string(),
            subnet_id: "s-1".to_string(),
            index,
            addresses: (0..count).map(|n| format!("10.9.{}.{}", index, n)).collect(),
            security_groups: vec![],
        }
    }

    async fn converge(h: &TestHarness, name: &str, expected: NodeStats) {
        let view = wait_for_node(&h.manager, name, TIMEOUT, |v| v.stats == expected).await;
        assert!(
            view.is_some(),
            "node {} did not converge to {:?}, last seen {:?}",
            name,
            expected,
            h.manager.get(name).await.map(|v| v.stats)
        );
    }

    #[tokio::test]
    async fn test_get_names() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 0)).await.unwrap();
        h.manager.upsert(new_eni_node("node2", "i-2", "m4.large", 0, 0)).await.unwrap();

        let mut names = h.manager.get_names().await;
        names.sort();
        assert_eq!(names, vec!["node1".to_string(), "node2".to_string()]);
    }

    #[tokio::test]
    async fn test_get() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        assert!(h.manager.get("node1").await.is_none());

        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 0)).await.unwrap();
        let view = h.manager.get("node1").await.unwrap();
        assert_eq!(view.name, "node1");
        assert_eq!(view.instance_id, "i-1");
        assert_eq!(view.instance_type, "m4.large");
    }

    #[tokio::test]
    async fn test_upsert_without_name_rejected() {
        let h = harness(vec![]);
        let mut node = new_eni_node("node1", "i-1", "m4.large", 0, 0);
        node.metadata.name = None;

        let result = h.manager.upsert(node).await;
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
        assert!(h.manager.get_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 0)).await.unwrap();
        converge(&h, "node1", stats(8, 0, 0)).await;

        h.manager.delete("node1").await;
        assert!(h.manager.get("node1").await.is_none());
        assert!(h.manager.get_names().await.is_empty());
        assert_eq!(*h.metrics.removed.lock().unwrap(), vec!["node1".to_string()]);

        // Deleting again is a no-op
        h.manager.delete("node1").await;
    }

    #[tokio::test]
    async fn test_scenario_default_pre_allocate() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        let node = || new_eni_node("node1", "i-1", "m4.large", 0, 0);

        h.manager.upsert(node()).await.unwrap();
        converge(&h, "node1", stats(8, 0, 0)).await;

        h.manager.upsert(agent_snapshot(&h, node(), 7).await).await.unwrap();
        converge(&h, "node1", stats(15, 7, 0)).await;

        // The pool is published and stays put
        assert!(wait_until(TIMEOUT, || h.store.get("node1").map(|n| n.spec.ipam.pool.len()) == Some(15)).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.manager.get("node1").await.unwrap().stats, stats(15, 7, 0));
        assert_eq!(h.provider.addresses_by_subnet().get("s-1"), Some(&15));
    }

    #[tokio::test]
    async fn test_scenario_buffer_disabled() {
        let h = harness(vec![test_subnet("s-1", 1000)]);

        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", -1, 10)).await.unwrap();
        converge(&h, "node1", stats(10, 0, 0)).await;

        let snapshot = agent_snapshot(&h, new_eni_node("node1", "i-1", "m4.large", -1, 10), 8).await;
        h.manager.upsert(snapshot).await.unwrap();
        converge(&h, "node1", stats(10, 8, 0)).await;

        let snapshot = agent_snapshot(&h, new_eni_node("node1", "i-1", "m4.large", -1, 20), 8).await;
        h.manager.upsert(snapshot).await.unwrap();
        converge(&h, "node1", stats(20, 8, 0)).await;
    }

    #[tokio::test]
    async fn test_scenario_small_buffer() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        let node = || new_eni_node("node1", "i-1", "m4.large", 1, 10);

        h.manager.upsert(node()).await.unwrap();
        converge(&h, "node1", stats(10, 0, 0)).await;

        h.manager.upsert(agent_snapshot(&h, node(), 9).await).await.unwrap();
        converge(&h, "node1", stats(10, 9, 0)).await;

        h.manager.upsert(agent_snapshot(&h, node(), 10).await).await.unwrap();
        converge(&h, "node1", stats(11, 10, 0)).await;

        // Usage drops; the pool does not shrink
        h.manager.upsert(agent_snapshot(&h, node(), 8).await).await.unwrap();
        converge(&h, "node1", stats(11, 8, 0)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.manager.get("node1").await.unwrap().stats, stats(11, 8, 0));
    }

    #[tokio::test]
    async fn test_scenario_capacity_limit() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        let node = || new_eni_node("node1", "i-1", "m4.large", 8, 20);

        h.manager.upsert(node()).await.unwrap();
        converge(&h, "node1", stats(20, 0, 0)).await;

        h.manager.upsert(agent_snapshot(&h, node(), 16).await).await.unwrap();
        let view = wait_for_node(&h.manager, "node1", TIMEOUT, |v| v.stats.needed_ips == 4 && v.at_capacity).await;
        assert!(view.is_some(), "node never reported the capacity deficit");

        let converged = wait_for_node(&h.manager, "node1", Duration::from_secs(1), |v| v.stats.needed_ips == 0).await;
        assert!(converged.is_none(), "a node at capacity must not converge");
        assert_eq!(h.manager.get("node1").await.unwrap().stats, stats(20, 16, 4));
        assert_eq!(h.provider.interfaces_of("i-1").len(), 2);

        let manager_stats = h.manager.stats().await;
        assert_eq!(manager_stats.nodes_at_capacity, 1);
        assert_eq!(manager_stats.needed, 4);
    }

    #[tokio::test]
    async fn test_scenario_many_nodes_spread_across_subnets() {
        let h = harness(vec![
            test_subnet("s-1", 400),
            test_subnet("s-2", 400),
            test_subnet("s-3", 400),
        ]);

        for i in 0..100 {
            let node = new_eni_node(&format!("node{}", i), &format!("i-{}", i), "m4.large", 1, 10);
            h.manager.upsert(node).await.unwrap();
        }

        for i in 0..100 {
            converge(&h, &format!("node{}", i), stats(10, 0, 0)).await;
        }

        let by_subnet = h.provider.addresses_by_subnet();
        assert_eq!(by_subnet.len(), 3, "allocations by subnet: {:?}", by_subnet);
        assert!(by_subnet.values().all(|&count| count > 0));
        assert_eq!(by_subnet.values().sum::<usize>(), 1000);

        let manager_stats = h.manager.stats().await;
        assert_eq!(manager_stats.nodes, 100);
        assert_eq!(manager_stats.available, 1000);
        assert_eq!(manager_stats.needed, 0);
    }

    #[tokio::test]
    async fn test_transient_provider_failures_are_retried() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.provider.fail_next_allocations(2);
        h.provider.fail_next_interface_listings(1);

        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 0)).await.unwrap();
        converge(&h, "node1", stats(8, 0, 0)).await;

        assert_eq!(h.metrics.failures("api"), 3);
        assert_eq!(*h.metrics.allocated.lock().unwrap(), 8);
        // Failed allocations never leaked reservations
        assert_eq!(h.provider.subnet("s-1").unwrap().available_addresses, 992);
        assert_eq!(h.provider.interfaces_of("i-1").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failures_are_retried() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.store.set_failing(true);

        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 0)).await.unwrap();
        converge(&h, "node1", stats(8, 0, 0)).await;
        assert!(h.store.get("node1").is_none());

        h.store.set_failing(false);
        let published = wait_until(TIMEOUT, || {
            h.store.get("node1").map(|n| n.spec.ipam.pool.len()) == Some(8)
        })
        .await;
        assert!(published, "pool was never published after the store recovered");

        let status = h.store.get("node1").unwrap().status.unwrap();
        let published_stats = status.stats.unwrap();
        assert_eq!((published_stats.available, published_stats.needed), (8, 0));
        assert_eq!(status.eni.enis.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_stops_reconciliation() {
        // No subnets yet: the node stays short of addresses
        let h = harness(vec![]);
        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 0)).await.unwrap();
        assert!(wait_until(TIMEOUT, || h.metrics.failures("no_eligible_subnet") > 0).await);

        h.manager.delete("node1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listings = h.provider.calls().list_interfaces;

        h.provider.add_subnet(test_subnet("s-1", 1000));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(h.provider.calls().list_interfaces, listings);
        assert_eq!(h.provider.calls().allocate_addresses, 0);
        assert!(h.manager.get("node1").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_instance_type_never_converges() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.manager.upsert(new_eni_node("node1", "i-1", "x9.unknown", 0, 0)).await.unwrap();

        let view = wait_for_node(&h.manager, "node1", TIMEOUT, |v| v.last_reconciled.is_some()).await.unwrap();
        assert!(view.at_capacity);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.manager.get("node1").await.unwrap().stats, stats(0, 0, 8));
        assert_eq!(h.provider.calls().allocate_addresses, 0);
        assert_eq!(h.metrics.nodes.lock().unwrap().get("node1").map(|g| g.needed), Some(8));
    }

    #[tokio::test]
    async fn test_subnet_tags_restrict_subnet_choice() {
        let mut tagged = test_subnet("s-tagged", 100);
        tagged.tags.insert("tier".to_string(), "pods".to_string());
        let h = harness(vec![test_subnet("s-plain", 1000), tagged]);

        let mut node = new_eni_node("node1", "i-1", "m4.large", 0, 0);
        node.spec.eni.subnet_tags = BTreeMap::from([("tier".to_string(), "pods".to_string())]);
        node.spec.eni.security_groups = vec!["sg-pods".to_string()];
        h.manager.upsert(node).await.unwrap();
        converge(&h, "node1", stats(8, 0, 0)).await;

        let by_subnet = h.provider.addresses_by_subnet();
        assert_eq!(by_subnet.get("s-tagged"), Some(&8));
        assert_eq!(by_subnet.get("s-plain"), None);

        let interfaces = h.provider.interfaces_of("i-1");
        assert_eq!(interfaces[0].security_groups, vec!["sg-pods".to_string()]);
    }

    #[tokio::test]
    async fn test_reapplying_snapshot_is_idempotent() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        let node = || new_eni_node("node1", "i-1", "m4.large", 0, 0);
        h.manager.upsert(node()).await.unwrap();
        converge(&h, "node1", stats(8, 0, 0)).await;

        let snapshot = agent_snapshot(&h, node(), 3).await;
        h.manager.upsert(snapshot.clone()).await.unwrap();
        converge(&h, "node1", stats(11, 3, 0)).await;

        // The same (now stale) snapshot again: nothing allocated, nothing lost
        let allocations = h.provider.calls().allocate_addresses;
        h.manager.upsert(snapshot).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.manager.get("node1").await.unwrap().stats, stats(11, 3, 0));
        assert_eq!(h.provider.calls().allocate_addresses, allocations);
    }

    #[tokio::test]
    async fn test_resync_refreshes_inventory() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.manager.resync().await.unwrap();
        assert_eq!(h.manager.inventory().get("s-1").await.unwrap().available_addresses, 1000);

        h.provider.add_subnet(test_subnet("s-2", 50));
        h.manager.resync().await.unwrap();
        assert!(h.manager.inventory().get("s-2").await.is_some());

        h.provider.fail_next_subnet_listings(1);
        assert!(h.manager.resync().await.is_err());
    }

    #[tokio::test]
    async fn test_addresses_on_instance_are_adopted() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.provider.add_interface(attached("eni-a", 0, 10));
        h.provider.add_interface(attached("eni-b", 1, 7));

        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 0)).await.unwrap();
        converge(&h, "node1", stats(17, 0, 0)).await;

        let view = h.manager.get("node1").await.unwrap();
        assert_eq!(view.pool.get("10.9.1.3").map(|a| a.resource.as_str()), Some("eni-b"));
        assert!(wait_until(TIMEOUT, || h.store.get("node1").map(|n| n.spec.ipam.pool.len()) == Some(17)).await);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.manager.get("node1").await.unwrap().stats, stats(17, 0, 0));
        assert_eq!(h.provider.calls().allocate_addresses, 0);
        assert_eq!(h.metrics.total_failures(), 0);
    }

    #[tokio::test]
    async fn test_full_instance_with_lost_pool_is_at_capacity() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        h.provider.add_interface(attached("eni-a", 0, 10));
        h.provider.add_interface(attached("eni-b", 1, 10));

        h.manager.upsert(new_eni_node("node1", "i-1", "m4.large", 0, 25)).await.unwrap();
        let view = wait_for_node(&h.manager, "node1", TIMEOUT, |v| v.at_capacity).await;
        assert!(view.is_some(), "node never reported being at capacity");

        tokio::time::sleep(Duration::from_millis(500)).await;
        let view = h.manager.get("node1").await.unwrap();
        assert_eq!(view.stats, stats(20, 0, 5));
        assert!(view.at_capacity);
        assert_eq!(h.metrics.total_failures(), 0);
        assert_eq!(h.provider.calls().create_interface, 0);
        assert_eq!(h.provider.calls().allocate_addresses, 0);
    }

    #[tokio::test]
    async fn test_trigger_burst_runs_one_pass_at_a_time() {
        let h = harness(vec![test_subnet("s-1", 1000)]);
        // The first pass fails once, so triggers pile up behind its retry
        h.provider.fail_next_allocations(1);

        let node = || new_eni_node("node1", "i-1", "m4.large", 0, 0);
        h.manager.upsert(node()).await.unwrap();
        join_all((0..50).map(|_| h.manager.upsert(node())))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        converge(&h, "node1", stats(8, 0, 0)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // One failed attempt and one successful batch, however many triggers arrived
        assert_eq!(h.provider.calls().allocate_addresses, 2);
        assert_eq!(h.provider.calls().create_interface, 1);
        assert_eq!(h.metrics.total_failures(), 1);

        let view = h.manager.get("node1").await.unwrap();
        let interfaces = h.provider.interfaces_of("i-1");
        assert_eq!(interfaces.len(), 1);
        let mut on_instance = interfaces[0].addresses.clone();
        on_instance.sort();
        assert_eq!(view.pool.keys().cloned().collect::<Vec<_>>(), on_instance);
        assert_eq!(h.provider.subnet("s-1").unwrap().available_addresses, 992);
    }
}
