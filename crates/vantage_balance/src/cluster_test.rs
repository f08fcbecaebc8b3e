//! Multi-host scenarios over the in-process network.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use vantage_dispatch::in_memory::{FaultPlan, InProcessNetwork};
use vantage_dispatch::messages::{NodeOperationRequest, OperationOutcome, SuitableHostRequest};
use vantage_dispatch::{NetworkEndpoint, Reply};

use crate::actions::ActionKind;
use crate::config::FabricConfig;
use crate::decision::TickOutcome;
use crate::host::Host;
use crate::node::NodeFactoryRegistry;
use crate::test_utils::{FakeClock, VectorBucket, VectorBucketFactory, TEST_ENGINE_TAG};

const H1: NetworkEndpoint = NetworkEndpoint::v4(10, 0, 2, 1, 7000);
const H2: NetworkEndpoint = NetworkEndpoint::v4(10, 0, 2, 2, 7000);
const H3: NetworkEndpoint = NetworkEndpoint::v4(10, 0, 2, 3, 7000);
const H4: NetworkEndpoint = NetworkEndpoint::v4(10, 0, 2, 4, 7000);

const WINDOW: Duration = Duration::from_secs(1);

struct Cluster {
    network: InProcessNetwork,
    clock: Arc<FakeClock>,
    hosts: Vec<Arc<Host>>,
}

impl Cluster {
    fn new(reply_timeout: Duration) -> Self {
        crate::test_utils::init_test_tracing();
        Self {
            network: InProcessNetwork::new(reply_timeout),
            clock: Arc::new(FakeClock::new()),
            hosts: Vec::new(),
        }
    }

    fn add_host(&mut self, endpoint: NetworkEndpoint) -> Arc<Host> {
        let mut config = FabricConfig::default();
        config.balancing.delta_t = Duration::from_secs(1);
        config.balancing.min_busy_load = 1;
        config.balancing.min_single_load = 1;
        config.meters.busy_window = WINDOW;
        config.meters.single_samples = 4;
        let factories = Arc::new(NodeFactoryRegistry::new());
        factories.register(TEST_ENGINE_TAG, Arc::new(VectorBucketFactory));
        let host = Arc::new(
            Host::new(
                endpoint,
                config,
                self.network.dispatcher(endpoint),
                factories,
                self.clock.clone(),
            )
            .unwrap(),
        );
        self.network.attach(endpoint, host.handler());
        self.hosts.push(host.clone());
        host
    }

    /// One full round: every host gossips once.
    async fn gossip_round(&self) {
        for host in &self.hosts {
            host.core().gossip_once().await;
        }
    }

    fn total_weight(&self) -> f64 {
        self.hosts.iter().map(|host| host.core().estimator.weight()).sum()
    }
}

async fn run_ops(host: &Host, count: usize) {
    for _ in 0..count {
        host.execute_operation(Vec::new()).await.unwrap();
    }
}

/// S1: one loaded node next to an empty host ends in a split across both.
#[tokio::test]
async fn loaded_host_splits_onto_empty_peer() {
    let mut cluster = Cluster::new(Duration::from_secs(5));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);

    let bucket = VectorBucket::new(vec![1, 2, 3, 4], 10);
    h1.bootstrap_node(TEST_ENGINE_TAG, bucket.clone());
    h2.announce(H1).await.unwrap();

    run_ops(&h1, 4).await;
    cluster.clock.advance(WINDOW);
    for _ in 0..6 {
        cluster.gossip_round().await;
    }

    // The load jumps: recent queries got much more expensive than what the
    // cluster average has absorbed.
    bucket.set_cost(30);
    run_ops(&h1, 4).await;

    // First tick observes the overload, the recheck acts on it.
    assert_matches!(h1.core().balance_once().await, TickOutcome::Pending(_));
    assert_eq!(h1.core().balance_once().await, TickOutcome::Acted(ActionKind::Split));

    assert_eq!(h1.core().node_count(), 1);
    assert_eq!(h2.core().node_count(), 1);
    assert_eq!(h1.core().loads.data(), 2);
    assert_eq!(h2.core().loads.data(), 2);
    // Source meters were reset: the old window is no longer representative.
    assert_eq!(h1.core().loads.reading().busy, None);

    // Gossip repopulates the directories with the new shape.
    cluster.gossip_round().await;
    assert!(h1.core().unloaded_peers().iter().any(|p| p.endpoint == H2 && p.data == 2));
}

/// S2: a migration to a dead peer reverts, and messages queued against the
/// moving node drain back to the revived node.
#[tokio::test(start_paused = true)]
async fn failed_migration_reverts_and_drains_queued_messages() {
    let mut cluster = Cluster::new(Duration::from_secs(1));
    let h1 = cluster.add_host(H1);
    let _h3 = cluster.add_host(H3);

    let id = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1, 2], 3));
    let node = h1.core().node(id).unwrap();

    // The reservation succeeds while the peer is alive; afterwards every
    // remote message is dropped.
    assert!(h1.core().reserve(H3, SuitableHostRequest::with_added(0, 0)).await);
    cluster.network.set_faults(Some(FaultPlan::new(7, 1.0)));

    let core = h1.core().clone();
    let node_for_migration = node.clone();
    let migration =
        tokio::spawn(async move { core.migrate_node(&node_for_migration, H3).await });
    tokio::task::yield_now().await;

    // A message addressed to the moving node queues against the pending
    // entry and is answered once the migration resolves.
    let core = h1.core().clone();
    let queued = tokio::spawn(async move {
        core.route_node_operation(NodeOperationRequest {
            target: Some(id),
            payload: b"late".to_vec(),
        })
        .await
    });

    assert!(migration.await.unwrap().is_err());
    let reply = queued.await.unwrap();
    assert_matches!(
        reply,
        Reply::NodeOperation { outcome: OperationOutcome::Completed(bytes) } if bytes == b"late"
    );

    // The node is live on the source again; no forwarding state remains.
    assert!(h1.core().node(id).is_some());
    assert!(h1.core().forwarding.lock().unwrap().is_empty());
    assert!(h1.core().deferred.lock().unwrap().is_empty());
    cluster.network.set_faults(None);
}

/// S3: an underloaded primary sheds one replica via Unify.
#[tokio::test]
async fn underloaded_primary_unifies_one_replica() {
    let mut cluster = Cluster::new(Duration::from_secs(5));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);
    let h3 = cluster.add_host(H3);

    let id = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1, 2], 1));
    let node = h1.core().node(id).unwrap();
    h1.core().silent_replicate(&node, H2).await.unwrap();
    h1.core().silent_replicate(&node, H3).await.unwrap();
    assert_eq!(node.replicas().len(), 2);

    // H2 carries the cluster's traffic; H1 idles below half the average.
    let loaded = VectorBucket::new(vec![5, 6], 50);
    h2.bootstrap_node(TEST_ENGINE_TAG, loaded);
    h2.announce(H1).await.unwrap();
    h3.announce(H1).await.unwrap();
    run_ops(&h2, 4).await;
    cluster.clock.advance(WINDOW);
    for _ in 0..6 {
        cluster.gossip_round().await;
    }

    let replica_wrappers =
        |host: &Host| host.core().node_count() - host.core().primaries().len();
    assert_eq!(replica_wrappers(&h2) + replica_wrappers(&h3), 2);

    assert_matches!(h1.core().balance_once().await, TickOutcome::Pending(_));
    assert_eq!(h1.core().balance_once().await, TickOutcome::Acted(ActionKind::Unify));

    // One replica fewer, removed from whichever host agreed to it.
    assert_eq!(node.replicas().len(), 1);
    assert_eq!(replica_wrappers(&h2) + replica_wrappers(&h3), 1);
}

/// S5: push-sum mass is conserved in a closed cluster and degrades only
/// under message loss.
#[tokio::test]
async fn gossip_mass_is_conserved_and_averages_converge() {
    let mut cluster = Cluster::new(Duration::from_secs(5));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);
    let h3 = cluster.add_host(H3);
    let h4 = cluster.add_host(H4);

    let costs = [40u64, 20, 8, 4];
    for (host, cost) in [&h1, &h2, &h3, &h4].iter().zip(costs) {
        host.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1], cost));
    }
    h2.announce(H1).await.unwrap();
    h3.announce(H1).await.unwrap();
    h4.announce(H1).await.unwrap();

    for host in [&h1, &h2, &h3, &h4] {
        run_ops(host, 4).await;
    }
    cluster.clock.advance(WINDOW);

    for _ in 0..40 {
        cluster.gossip_round().await;
    }

    let total = cluster.total_weight();
    assert!((total - 4.0).abs() < 1e-6, "weight sum drifted: {total}");

    // True averages: busy is 4 ops x cost per host.
    let true_busy = f64::from(4u32 * (40 + 20 + 8 + 4)) / 4.0;
    for host in &cluster.hosts {
        let averages = host.core().estimator.averages().unwrap();
        let deviation = (averages.busy - true_busy).abs() / true_busy;
        assert!(
            deviation < 0.01,
            "host {} off by {:.3}: {} vs {}",
            host.endpoint(),
            deviation,
            averages.busy,
            true_busy
        );
        assert!(host.core().estimator.weight() > 0.0);
    }
}

/// S5, lossy variant: drops only ever remove mass, never create it.
#[tokio::test(start_paused = true)]
async fn gossip_mass_only_degrades_under_drops() {
    let mut cluster = Cluster::new(Duration::from_millis(50));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);
    let h3 = cluster.add_host(H3);
    let h4 = cluster.add_host(H4);
    h2.announce(H1).await.unwrap();
    h3.announce(H1).await.unwrap();
    h4.announce(H1).await.unwrap();
    for host in [&h1, &h2, &h3, &h4] {
        host.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1], 1));
    }
    cluster.clock.advance(WINDOW);

    cluster.network.set_faults(Some(FaultPlan::new(3, 0.2)));
    for _ in 0..30 {
        cluster.gossip_round().await;
    }

    let total = cluster.total_weight();
    assert!(total <= 4.0 + 1e-6, "drops must not create mass: {total}");
    assert!(total > 0.0);
    for host in &cluster.hosts {
        assert!(host.core().estimator.weight() > 0.0);
    }
}

/// S6: a reply arriving after its origin node left completes against the
/// deleted-node dispatcher instead of producing a node-does-not-exist error.
#[tokio::test(start_paused = true)]
async fn late_reply_after_leave_resolves_through_deleted_dispatcher() {
    let mut cluster = Cluster::new(Duration::from_secs(30));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);

    let origin_id = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1], 1));
    let origin = h1.core().node(origin_id).unwrap();
    let slow = VectorBucket::with_delay(vec![9], 2, Duration::from_secs(2));
    let target_id = h2.bootstrap_node(TEST_ENGINE_TAG, slow);

    let h1_for_query = h1.clone();
    let query = tokio::spawn(async move {
        h1_for_query.node_query(origin_id, target_id, b"probe".to_vec()).await
    });
    tokio::task::yield_now().await;

    // The origin leaves while its query is in flight.
    h1.core().leave_node(&origin).await.unwrap();
    assert!(h1.core().node(origin_id).is_none());

    let result = query.await.unwrap().unwrap();
    assert_eq!(result, b"probe");

    // The bookkeeping completed against the deleted-dispatcher entry.
    let deleted = h1.core().deleted.lock().unwrap();
    let ops = deleted.get(&origin_id).expect("deleted entry must exist");
    assert_eq!(ops.in_flight(), 0);
}

/// Replicate then Unify is a no-op on the primary's replica set.
#[tokio::test]
async fn replicate_then_unify_round_trips_the_replica_set() {
    let mut cluster = Cluster::new(Duration::from_secs(5));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);

    let id = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1, 2], 1));
    let node = h1.core().node(id).unwrap();

    assert!(h1.core().reserve(H2, SuitableHostRequest::with_added(0, 0)).await);
    h1.core().replicate_node(&node, H2, false).await.unwrap();
    let replicas = node.replicas();
    assert_eq!(replicas.len(), 1);
    assert_eq!(h2.core().node_count(), 1);
    let (endpoint, replica_id) = replicas[0];

    assert!(h1.core().probe_replica_removal(endpoint, replica_id).await);
    h1.core().unify_replica(&node, endpoint, replica_id, false).await.unwrap();

    assert!(node.replicas().is_empty());
    assert_eq!(h2.core().node_count(), 0);
}

/// Migrate there and back preserves the data; stale ids chase the node
/// through the forwarding tables.
#[tokio::test]
async fn migrate_round_trip_preserves_data_and_forwards_stale_ids() {
    let mut cluster = Cluster::new(Duration::from_secs(5));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);

    let orig_id = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![9, 8, 7], 2));
    let node = h1.core().node(orig_id).unwrap();

    assert!(h1.core().reserve(H2, SuitableHostRequest::with_added(0, 0)).await);
    h1.core().migrate_node(&node, H2).await.unwrap();
    assert_eq!(h1.core().node_count(), 0);
    assert_eq!(h2.core().node_count(), 1);
    assert_eq!(h2.core().loads.data(), 3);

    let moved_id = h2.core().primaries()[0].id();
    assert_ne!(moved_id, orig_id);
    let moved = h2.core().node(moved_id).unwrap();

    assert!(h2.core().reserve(H1, SuitableHostRequest::with_added(0, 0)).await);
    h2.core().migrate_node(&moved, H1).await.unwrap();
    assert_eq!(h2.core().node_count(), 0);
    assert_eq!(h1.core().loads.data(), 3);
    let final_id = h1.core().primaries()[0].id();
    assert_ne!(final_id, moved_id);

    // A message addressed to the original id still reaches the node,
    // chasing it H1 -> H2 -> H1.
    let reply = h1
        .core()
        .route_node_operation(NodeOperationRequest {
            target: Some(orig_id),
            payload: b"chase".to_vec(),
        })
        .await;
    assert_matches!(
        reply,
        Reply::NodeOperation { outcome: OperationOutcome::Completed(bytes) } if bytes == b"chase"
    );
}

/// A general balancing offer makes a loaded host push one node to the
/// underloaded sender.
#[tokio::test]
async fn balancing_offer_pushes_work_to_the_underloaded_sender() {
    let mut cluster = Cluster::new(Duration::from_secs(5));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);

    let first = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1, 2], 30));
    let second = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![3, 4], 30));
    h2.announce(H1).await.unwrap();

    // Both nodes carry traffic, so shedding one keeps the host alive.
    for id in [first, second] {
        for _ in 0..4 {
            let reply = h1
                .core()
                .route_node_operation(NodeOperationRequest {
                    target: Some(id),
                    payload: Vec::new(),
                })
                .await;
            assert_matches!(reply, Reply::NodeOperation { .. });
        }
    }
    cluster.clock.advance(WINDOW);
    for _ in 0..6 {
        cluster.gossip_round().await;
    }

    let accepted = h2.core().send_balancing_offer(H1, None).await.unwrap();
    assert!(accepted);
    assert_eq!(h1.core().node_count(), 1);
    assert_eq!(h2.core().node_count(), 1);
    assert_eq!(h2.core().loads.data(), 2);
}

/// A split that fails mid-protocol leaves the replica set unchanged.
#[tokio::test]
async fn failed_split_is_net_zero_on_the_replica_set() {
    let mut cluster = Cluster::new(Duration::from_secs(5));
    let h1 = cluster.add_host(H1);
    let h2 = cluster.add_host(H2);
    let _h3 = cluster.add_host(H3);

    let id = h1.bootstrap_node(TEST_ENGINE_TAG, VectorBucket::new(vec![1, 2, 3, 4], 1));
    let node = h1.core().node(id).unwrap();
    h1.core().silent_replicate(&node, H2).await.unwrap();
    assert_eq!(node.replicas().len(), 1);

    assert!(h1.core().reserve(H3, SuitableHostRequest::with_added(0, 0)).await);
    // The target dies before the split's create message arrives.
    cluster.network.detach(H3);
    assert!(h1.core().split_node(&node, H3).await.is_err());

    // The silent unify + silent replicate cancelled out: the replica set
    // covers the same endpoints as before the attempt.
    let replicas = node.replicas();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].0, H2);
    assert_eq!(h2.core().node_count(), 1);
}
