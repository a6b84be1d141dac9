//! End-to-end DHT behavior over the in-memory transport: replication,
//! value lookup, routing churn, lookup convergence, and request
//! correlation across failures.

mod common;

use std::time::Duration;

use lattica::node_id::{distance_cmp, key_for_bytes, NODE_ID_LEN};
use lattica::{Node, NodeId, TransportHub};

use common::{spawn_chain, spawn_dht, spawn_full_mesh, wait_until};

fn id_with_first_byte(b: u8) -> NodeId {
    let mut bytes = [0u8; NODE_ID_LEN];
    bytes[0] = b;
    NodeId::from_bytes(bytes)
}

#[tokio::test]
async fn store_and_find_across_a_small_mesh() {
    let hub = TransportHub::new();
    let nodes = spawn_full_mesh(&hub, 10_000, 5, 2, 2).await;

    let key = key_for_bytes(b"k");
    assert!(nodes[0].store(key, b"v".to_vec()).await, "store should land somewhere");

    let result = nodes[1].find_value(key).await;
    assert!(result.found, "replicated value should be locatable from another node");
    assert_eq!(result.value.as_deref(), Some(b"v".as_slice()));
}

#[tokio::test]
async fn values_replicate_to_closest_nodes() {
    let hub = TransportHub::new();
    let nodes = spawn_full_mesh(&hub, 10_100, 5, 2, 2).await;

    let key = key_for_bytes(b"profile:dana");
    nodes[0].store(key, b"dana".to_vec()).await;

    // At least one node other than the writer can answer locally,
    // which shows a remote STORE was acknowledged.
    let mut remote_hits = 0;
    for node in nodes.iter().skip(1) {
        let stats = node.stats().await;
        if stats.stored_keys > 0 {
            remote_hits += 1;
        }
    }
    assert!(remote_hits >= 1, "store should replicate beyond the writer");
}

#[tokio::test]
async fn partition_and_heal_tracks_routing_size() {
    let hub = TransportHub::new();
    let dht = spawn_dht(&hub, 10_200, 20, 2).await;

    let partition_one: Vec<Node> = (1u8..=5)
        .map(|b| Node::new(id_with_first_byte(b), "10.1.0.1", 7000 + b as u16))
        .collect();
    let partition_two: Vec<Node> = (6u8..=10)
        .map(|b| Node::new(id_with_first_byte(b), "10.2.0.1", 7100 + b as u16))
        .collect();

    for node in &partition_one {
        dht.add_node(node.clone()).await;
    }
    assert_eq!(dht.routing_table_size().await, 5);

    for node in &partition_one {
        assert!(dht.remove_node(&node.id).await);
    }
    assert_eq!(dht.routing_table_size().await, 0);

    for node in &partition_two {
        dht.add_node(node.clone()).await;
    }
    assert_eq!(dht.routing_table_size().await, 5);

    for node in &partition_one {
        dht.add_node(node.clone()).await;
    }
    assert!(dht.routing_table_size().await >= 10, "healed table holds both partitions");
}

#[tokio::test]
async fn iterative_lookup_converges_across_a_chain() {
    let hub = TransportHub::new();
    let nodes = spawn_chain(&hub, 10_300, 10, 8, 2).await;

    let target = nodes[9].node_id();
    let starting_best = nodes[0]
        .closest_nodes(&target, 1)
        .await
        .first()
        .map(|n| target.xor_distance(&n.id))
        .expect("chain head knows its neighbor");

    let result = nodes[0].find_node(target).await;
    assert!(
        result.nodes.iter().any(|n| n.id == target),
        "lookup should walk the chain to the target"
    );

    // Monotone improvement: the best result is at least as close as
    // the best starting contact.
    let best = result
        .nodes
        .first()
        .map(|n| target.xor_distance(&n.id))
        .expect("lookup returns contacts");
    assert_ne!(distance_cmp(&best, &starting_best), std::cmp::Ordering::Greater);
}

#[tokio::test]
async fn lookups_tolerate_unreachable_nodes() {
    let hub = TransportHub::new();
    let nodes = spawn_full_mesh(&hub, 10_400, 6, 4, 2).await;

    // Knock out two nodes; lookups from the rest still complete.
    hub.set_unreachable(&nodes[4].local_node().endpoint(), true).await;
    hub.set_unreachable(&nodes[5].local_node().endpoint(), true).await;

    let target = NodeId::random();
    let result = nodes[0].find_node(target).await;
    assert!(!result.nodes.is_empty(), "partial results from live arms");

    // Every waiter resolved: the pending map drains even with dead arms.
    let drained = wait_until(Duration::from_secs(3), || async {
        nodes[0].stats().await.pending_requests == 0
    })
    .await;
    assert!(drained, "pending requests must not leak");
}

#[tokio::test]
async fn bootstrap_populates_buckets_from_a_seed() {
    let hub = TransportHub::new();
    let nodes = spawn_full_mesh(&hub, 10_500, 6, 8, 2).await;
    let joiner = spawn_dht(&hub, 10_590, 8, 2).await;

    let result = joiner.bootstrap(&[nodes[0].local_node()]).await;
    assert!(!result.nodes.is_empty(), "self lookup should return contacts");
    assert!(
        joiner.routing_table_size().await >= 2,
        "bootstrap should learn peers beyond the seed"
    );
}

#[tokio::test]
async fn stopped_engine_rejects_work_gracefully() {
    let hub = TransportHub::new();
    let nodes = spawn_full_mesh(&hub, 10_600, 3, 4, 2).await;

    nodes[0].start().await;
    nodes[0].stop().await;
    nodes[0].stop().await;

    let key = key_for_bytes(b"post:late");
    assert!(!nodes[0].store(key, b"x".to_vec()).await);
    assert!(!nodes[0].find_value(key).await.found);

    // The rest of the mesh is unaffected.
    assert!(nodes[1].ping(&nodes[2].local_node()).await);
}
