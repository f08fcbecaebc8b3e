//! The host runtime: node ownership, message routing and the periodic jobs.
//!
//! A host owns a set of logical nodes and routes inbound messages either to
//! itself (the balancing protocol kinds) or to an addressed node. Messages
//! for a node that migrated away follow the forwarding table; messages for a
//! node mid-migration queue until the outcome is known; anything else gets a
//! typed node-does-not-exist reply. Late replies for removed nodes resolve
//! against the deleted-dispatcher map instead.

#[cfg(test)]
#[path = "host_test.rs"]
mod host_test;

#[cfg(test)]
#[path = "cluster_test.rs"]
mod cluster_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::oneshot;
use metrics::gauge;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vantage_dispatch::messages::{
    NodeOperationRequest,
    NotifyRequest,
    OperationOutcome,
    StartStopRequest,
};
use vantage_dispatch::{
    Dispatcher,
    NetworkEndpoint,
    NodeId,
    PeerRecord,
    Reply,
    ReplyEnvelope,
    Request,
    RequestEnvelope,
    RequestHandler,
};

use crate::clock::Clock;
use crate::config::FabricConfig;
use crate::decision::{Hysteresis, LoadView};
use crate::gossip::{GossipLink, GossipStateSnapshot, LoadEstimator};
use crate::host_list::PeerDirectory;
use crate::load::HostLoadTracker;
use crate::metrics::{register_metrics, GOSSIP_WEIGHT, HOSTED_NODES, HOST_BUSY_LOAD, HOST_DATA_LOAD};
use crate::node::{LogicalNode, NodeFactoryRegistry, OutstandingOps, StorageEngine};
use crate::BalanceError;

const METRICS_TICK: Duration = Duration::from_secs(10);

/// A reservation taken by a remote source about to drive a balancing action
/// on this host. At most one is held at a time; a reservation older than
/// three balancing ticks is considered abandoned and may be claimed over.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Reservation {
    pub(crate) source: NetworkEndpoint,
    pub(crate) taken_at: Instant,
}

/// Forwarding-table entry for a node that is no longer served here.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Forwarding {
    /// Migration in progress; the new id is not yet known.
    Pending,
    /// The node now runs under this id.
    Moved(NodeId),
}

/// What a queued message learns once a pending migration resolves.
#[derive(Clone, Copy, Debug)]
pub(crate) enum DeferredVerdict {
    /// Forward to the node's new id.
    Moved(NodeId),
    /// The migration failed; the node is live here again.
    Reverted,
}

/// Shared state of one host. Components hold it through an `Arc`; none of
/// them owns the host.
pub(crate) struct HostCore {
    pub(crate) endpoint: NetworkEndpoint,
    pub(crate) config: FabricConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dispatcher: Arc<GossipLink>,
    pub(crate) estimator: Arc<LoadEstimator>,
    pub(crate) directory: Arc<Mutex<PeerDirectory>>,
    pub(crate) loads: Arc<HostLoadTracker>,
    pub(crate) factories: Arc<NodeFactoryRegistry>,
    pub(crate) nodes: Mutex<HashMap<NodeId, Arc<LogicalNode>>>,
    pub(crate) pre_removed: Mutex<HashMap<NodeId, Arc<LogicalNode>>>,
    pub(crate) node_counter: AtomicU32,
    pub(crate) reservation: Mutex<Option<Reservation>>,
    pub(crate) forwarding: Mutex<HashMap<NodeId, Forwarding>>,
    pub(crate) deferred: Mutex<HashMap<NodeId, Vec<oneshot::Sender<DeferredVerdict>>>>,
    pub(crate) deleted: Mutex<HashMap<NodeId, Arc<OutstandingOps>>>,
    pub(crate) existing_host: Mutex<Option<NetworkEndpoint>>,
    pub(crate) balancing_on: AtomicBool,
    pub(crate) balance_lock: tokio::sync::Mutex<()>,
    pub(crate) hysteresis: Mutex<Hysteresis>,
    pub(crate) node_placed: tokio::sync::Notify,
    pub(crate) next_ticket: AtomicU64,
    pub(crate) rng: Mutex<SmallRng>,
}

impl HostCore {
    /// Issues the next node id. Counters are never reused for the lifetime of
    /// the process.
    pub(crate) fn allocate_node_id(&self) -> NodeId {
        NodeId::new(self.endpoint, self.node_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Installs a node: meters bind to the host meters, the engine counts
    /// towards the host data load, waiting operations are released.
    pub(crate) fn add_node(&self, node: Arc<LogicalNode>) {
        node.busy.bind(&self.loads.busy);
        node.single.bind(&self.loads.single);
        self.loads.track(node.id(), node.engine());
        self.nodes.lock().unwrap().insert(node.id(), node);
        self.node_placed.notify_waiters();
    }

    /// Takes a node out of service: messages addressed to it run the
    /// node-does-not-exist path until the removal is finished or reverted.
    pub(crate) fn pre_remove(&self, id: NodeId) -> Option<Arc<LogicalNode>> {
        let node = self.nodes.lock().unwrap().remove(&id)?;
        self.loads.untrack(id);
        self.pre_removed.lock().unwrap().insert(id, node.clone());
        Some(node)
    }

    /// Puts a pre-removed node back into service.
    pub(crate) fn revert_pre_remove(&self, id: NodeId) {
        if let Some(node) = self.pre_removed.lock().unwrap().remove(&id) {
            self.loads.track(id, node.engine());
            self.nodes.lock().unwrap().insert(id, node);
            self.node_placed.notify_waiters();
        }
    }

    /// Completes a removal: meters unbind and the node's operation
    /// bookkeeping moves to the deleted-dispatcher map so late replies still
    /// resolve.
    pub(crate) fn finish_remove(&self, id: NodeId) {
        if let Some(node) = self.pre_removed.lock().unwrap().remove(&id) {
            node.busy.unbind(&self.loads.busy);
            node.single.unbind(&self.loads.single);
            self.deleted.lock().unwrap().insert(id, node.ops.clone());
        }
    }

    /// All primaries currently served.
    pub(crate) fn primaries(&self) -> Vec<Arc<LogicalNode>> {
        self.nodes.lock().unwrap().values().filter(|n| n.is_primary()).cloned().collect()
    }

    /// The node registered under `id`, if it is live.
    pub(crate) fn node(&self, id: NodeId) -> Option<Arc<LogicalNode>> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    /// Number of nodes currently served (primaries and replicas).
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    /// Whether periodic balancing and gossiping are enabled.
    pub(crate) fn balancing_on(&self) -> bool {
        self.balancing_on.load(Ordering::Relaxed)
    }

    /// The inputs of one balancing decision.
    pub(crate) fn load_view(&self) -> LoadView {
        let reading = self.loads.reading();
        LoadView {
            node_count: self.node_count(),
            busy: reading.busy,
            single: reading.single,
            data: Some(reading.data),
            averages: self.estimator.averages(),
            min_busy_load: self.config.balancing.min_busy_load,
            min_single_load: self.config.balancing.min_single_load,
        }
    }

    /// Operation bookkeeping for `id`, live or removed.
    pub(crate) fn ops_registry(&self, id: NodeId) -> Option<Arc<OutstandingOps>> {
        if let Some(node) = self.nodes.lock().unwrap().get(&id) {
            return Some(node.ops.clone());
        }
        if let Some(node) = self.pre_removed.lock().unwrap().get(&id) {
            return Some(node.ops.clone());
        }
        self.deleted.lock().unwrap().get(&id).cloned()
    }

    /// Wakes every operation queued on `old` with the migration outcome.
    pub(crate) fn resolve_deferred(&self, old: NodeId, verdict: DeferredVerdict) {
        let waiters = self.deferred.lock().unwrap().remove(&old).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(verdict);
        }
    }

    fn any_primary(&self) -> Option<Arc<LogicalNode>> {
        self.nodes.lock().unwrap().values().find(|n| n.is_primary()).cloned()
    }

    /// Executes `payload` at some local primary, or forwards it to the known
    /// non-empty peer. An empty host with no such peer waits until a node is
    /// placed (bounded by the caller's reply timeout).
    pub(crate) async fn execute_local_or_forward(
        &self,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, BalanceError> {
        loop {
            if let Some(node) = self.any_primary() {
                let result = node.execute(&payload).await?;
                return Ok(result.output);
            }
            let existing = *self.existing_host.lock().unwrap();
            if let Some(peer) = existing {
                let request =
                    Request::NodeOperation(NodeOperationRequest { target: None, payload: payload.clone() });
                let reply = self.dispatcher.request(peer, request, None).await?;
                match reply.body {
                    Reply::NodeOperation { outcome: OperationOutcome::Completed(bytes) } => {
                        return Ok(bytes);
                    }
                    Reply::NodeOperation { outcome: OperationOutcome::NodeRemoved(_) } => continue,
                    Reply::NodeOperation { outcome: OperationOutcome::Failed(reason) } => {
                        return Err(BalanceError::Rejected(reason));
                    }
                    other => {
                        return Err(BalanceError::Rejected(format!(
                            "unexpected reply to a forwarded operation: {other:?}"
                        )));
                    }
                }
            }
            self.node_placed.notified().await;
        }
    }

    /// Routes an addressed node operation: live node, forwarding table,
    /// pending queue, or the node-does-not-exist reply.
    pub(crate) async fn route_node_operation(&self, request: NodeOperationRequest) -> Reply {
        let Some(target) = request.target else {
            return match self.execute_local_or_forward(request.payload).await {
                Ok(bytes) => Reply::NodeOperation { outcome: OperationOutcome::Completed(bytes) },
                Err(e) => Reply::NodeOperation { outcome: OperationOutcome::Failed(e.to_string()) },
            };
        };

        if let Some(node) = self.node(target) {
            return match node.execute(&request.payload).await {
                Ok(result) => {
                    Reply::NodeOperation { outcome: OperationOutcome::Completed(result.output) }
                }
                Err(e) => Reply::NodeOperation { outcome: OperationOutcome::Failed(e.to_string()) },
            };
        }

        let entry = self.forwarding.lock().unwrap().get(&target).copied();
        match entry {
            Some(Forwarding::Moved(new_id)) => {
                self.forward_operation(new_id, request.payload).await
            }
            Some(Forwarding::Pending) => {
                let (tx, rx) = oneshot::channel();
                self.deferred.lock().unwrap().entry(target).or_default().push(tx);
                match rx.await {
                    Ok(DeferredVerdict::Moved(new_id)) => {
                        self.forward_operation(new_id, request.payload).await
                    }
                    Ok(DeferredVerdict::Reverted) => match self.node(target) {
                        Some(node) => match node.execute(&request.payload).await {
                            Ok(result) => Reply::NodeOperation {
                                outcome: OperationOutcome::Completed(result.output),
                            },
                            Err(e) => Reply::NodeOperation {
                                outcome: OperationOutcome::Failed(e.to_string()),
                            },
                        },
                        None => Reply::NodeDoesntExist { missing: target },
                    },
                    Err(_) => Reply::NodeDoesntExist { missing: target },
                }
            }
            None => {
                if self.pre_removed.lock().unwrap().contains_key(&target) {
                    // The node is being taken down; the originator should
                    // re-execute at a surviving node.
                    Reply::NodeOperation { outcome: OperationOutcome::NodeRemoved(target) }
                } else {
                    Reply::NodeDoesntExist { missing: target }
                }
            }
        }
    }

    async fn forward_operation(&self, new_id: NodeId, payload: Vec<u8>) -> Reply {
        let request =
            Request::NodeOperation(NodeOperationRequest { target: Some(new_id), payload });
        match self.dispatcher.request(new_id.endpoint, request, None).await {
            Ok(reply) => reply.body,
            Err(e) => Reply::NodeOperation { outcome: OperationOutcome::Failed(e.to_string()) },
        }
    }

    fn handle_notify(&self, request: &NotifyRequest) -> Reply {
        let mut directory = self.directory.lock().unwrap();
        directory.unloaded.insert(request.load);
        directory.loaded.insert(request.load);
        Reply::Notify { balancing_on: self.balancing_on() }
    }

    fn handle_start_stop(&self, request: StartStopRequest) -> Reply {
        info!(start = request.start, clear = request.clear_stats, "balancing toggled");
        self.balancing_on.store(request.start, Ordering::Relaxed);
        if request.clear_stats {
            self.clear_statistics();
        }
        Reply::Ack
    }

    fn handle_migrate_notify(&self, orig: NodeId, new: NodeId) -> Reply {
        for node in self.nodes.lock().unwrap().values() {
            node.repoint_primary(orig, new);
        }
        Reply::Ack
    }

    /// Resets every meter, the hysteresis counters, the estimator and both
    /// peer directories.
    pub(crate) fn clear_statistics(&self) {
        self.loads.reset();
        for node in self.nodes.lock().unwrap().values() {
            node.reset_meters();
        }
        for node in self.pre_removed.lock().unwrap().values() {
            node.reset_meters();
        }
        self.hysteresis.lock().unwrap().reset();
        self.estimator.clear();
        self.directory.lock().unwrap().clear();
    }

    /// Endpoints this host could gossip with: the peer directories plus the
    /// replica locations of its primaries.
    fn gossip_targets(&self) -> Vec<NetworkEndpoint> {
        let mut targets = self.directory.lock().unwrap().known_peers(self.endpoint);
        for node in self.primaries() {
            for (endpoint, _) in node.replicas() {
                if endpoint != self.endpoint {
                    targets.push(endpoint);
                }
            }
        }
        if targets.is_empty() {
            if let Some(peer) = *self.existing_host.lock().unwrap() {
                targets.push(peer);
            }
        }
        targets.sort();
        targets.dedup();
        targets
    }

    /// One explicit gossip exchange with a random known peer. Fired by the
    /// gossip tick when no payload rode along other traffic.
    pub(crate) async fn gossip_once(&self) {
        let targets = self.gossip_targets();
        if targets.is_empty() {
            return;
        }
        let target = {
            let mut rng = self.rng.lock().unwrap();
            targets[rng.gen_range(0..targets.len())]
        };
        let request = Request::Notify(NotifyRequest { load: self.loads.own_record() });
        if let Err(e) = self.dispatcher.request(target, request, None).await {
            debug!(%target, error = %e, "gossip exchange failed");
        }
    }

    fn metrics_tick(&self) {
        let reading = self.loads.reading();
        #[allow(clippy::as_conversions)]
        {
            gauge!(HOST_BUSY_LOAD).set(reading.busy.unwrap_or(0) as f64);
            gauge!(HOST_DATA_LOAD).set(reading.data as f64);
            gauge!(HOSTED_NODES).set(self.node_count() as f64);
        }
        gauge!(GOSSIP_WEIGHT).set(self.estimator.weight());
        debug!(
            busy = ?reading.busy,
            single = ?reading.single,
            data = reading.data,
            averages = ?self.estimator.averages(),
            "host load"
        );
    }
}

#[async_trait]
impl RequestHandler for HostCore {
    async fn handle(&self, request: RequestEnvelope) -> ReplyEnvelope {
        self.dispatcher.ingest_request(&request);
        let sender = request.sender;
        let body = match request.body {
            Request::Notify(r) => self.handle_notify(&r),
            Request::SuitableHost(r) => self.handle_suitable_host(sender, r),
            Request::BalancingOffer(r) => self.handle_balancing_offer(sender, r).await,
            Request::CreateNode(r) => self.handle_create_node(sender, r).await,
            Request::Migrate(r) => self.handle_migrate(sender, r).await,
            Request::Replicate(r) => self.handle_replicate(sender, r).await,
            Request::Unify(r) => self.handle_unify(sender, r).await,
            Request::MigrateNotify(r) => self.handle_migrate_notify(r.orig_id, r.new_id),
            Request::StartStopBalancing(r) => self.handle_start_stop(r),
            Request::NodeOperation(r) => self.route_node_operation(r).await,
        };
        ReplyEnvelope {
            msg_id: request.msg_id,
            sender: self.endpoint,
            gossip: Some(self.dispatcher.outgoing_payload()),
            body,
        }
    }
}

/// Serialised state of one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// The node's id.
    pub id: NodeId,
    /// Factory tag of the node implementation.
    pub node_type: String,
    /// Role and replica bookkeeping.
    pub role: NodeRoleSnapshot,
    /// Serialised storage engine state.
    pub engine: Vec<u8>,
}

/// Serialised role of a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeRoleSnapshot {
    /// A primary with its replica locations.
    Primary {
        /// Replica endpoint to replica id.
        replicas: Vec<(NetworkEndpoint, NodeId)>,
    },
    /// A replica wrapper.
    Replica {
        /// The replicated primary.
        primary: NodeId,
    },
}

/// Everything a host persists. Transient state (reservations, hysteresis,
/// deleted dispatchers, the gossip fold snapshot) is rebuilt empty on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Next node counter value.
    pub node_counter: u32,
    /// All logical nodes.
    pub nodes: Vec<NodeSnapshot>,
    /// Least-loaded peer directory.
    pub unloaded: Vec<PeerRecord>,
    /// Most-loaded peer directory.
    pub loaded: Vec<PeerRecord>,
    /// Gossip accumulators.
    pub gossip: GossipStateSnapshot,
}

/// A vantage host: the autonomic core around a set of logical nodes.
pub struct Host {
    core: Arc<HostCore>,
    cancel: CancellationToken,
}

impl Host {
    /// Creates a host over `transport`. The host is idle until
    /// [`start`](Self::start); its handler must be attached to the transport
    /// by the caller.
    pub fn new(
        endpoint: NetworkEndpoint,
        config: FabricConfig,
        transport: Arc<dyn Dispatcher>,
        factories: Arc<NodeFactoryRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BalanceError> {
        config.check()?;
        let loads = Arc::new(HostLoadTracker::new(
            endpoint,
            clock.clone(),
            config.meters.busy_window,
            config.meters.single_samples,
        ));
        let estimator = Arc::new(LoadEstimator::new());
        let directory =
            Arc::new(Mutex::new(PeerDirectory::new(config.gossip.peer_list_size, endpoint)));
        let dispatcher = Arc::new(GossipLink::new(
            transport,
            estimator.clone(),
            directory.clone(),
            loads.clone(),
        ));
        let core = Arc::new(HostCore {
            endpoint,
            config,
            clock,
            dispatcher,
            estimator,
            directory,
            loads,
            factories,
            nodes: Mutex::new(HashMap::new()),
            pre_removed: Mutex::new(HashMap::new()),
            node_counter: AtomicU32::new(0),
            reservation: Mutex::new(None),
            forwarding: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            deleted: Mutex::new(HashMap::new()),
            existing_host: Mutex::new(None),
            balancing_on: AtomicBool::new(true),
            balance_lock: tokio::sync::Mutex::new(()),
            hysteresis: Mutex::new(Hysteresis::new(config.balancing.overload_rechecks)),
            node_placed: tokio::sync::Notify::new(),
            next_ticket: AtomicU64::new(1),
            rng: Mutex::new(SmallRng::from_entropy()),
        });
        Ok(Self { core, cancel: CancellationToken::new() })
    }

    /// This host's endpoint.
    pub fn endpoint(&self) -> NetworkEndpoint {
        self.core.endpoint
    }

    /// The receiving side to attach to the transport.
    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        self.core.clone()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<HostCore> {
        &self.core
    }

    /// Bootstraps a primary node on this host.
    pub fn bootstrap_node(
        &self,
        node_type: impl Into<String>,
        engine: Arc<dyn StorageEngine>,
    ) -> NodeId {
        let id = self.core.allocate_node_id();
        let node = Arc::new(LogicalNode::new_primary(
            id,
            node_type,
            engine,
            self.core.clock.clone(),
            self.core.config.meters.busy_window,
            self.core.config.meters.single_samples,
        ));
        self.core.add_node(node);
        id
    }

    /// Announces this host to a known peer: seeds the fallback pointer for
    /// empty-host forwarding and adopts the peer's balancing on/off state.
    pub async fn announce(&self, peer: NetworkEndpoint) -> Result<bool, BalanceError> {
        *self.core.existing_host.lock().unwrap() = Some(peer);
        let request = Request::Notify(NotifyRequest { load: self.core.loads.own_record() });
        let reply = self.core.dispatcher.request(peer, request, None).await?;
        match reply.body {
            Reply::Notify { balancing_on } => {
                self.core.balancing_on.store(balancing_on, Ordering::Relaxed);
                Ok(balancing_on)
            }
            other => Err(BalanceError::Rejected(format!("unexpected reply to notify: {other:?}"))),
        }
    }

    /// Executes an operation at this host: at a local primary if one exists,
    /// otherwise through the empty-host fallback.
    pub async fn execute_operation(&self, payload: Vec<u8>) -> Result<Vec<u8>, BalanceError> {
        self.core.execute_local_or_forward(payload).await
    }

    /// Runs an operation at a remote node on behalf of a local node. If the
    /// target was removed mid-flight, the operation is re-executed at a
    /// surviving node. The origin's bookkeeping completes even if the origin
    /// node is removed before the reply arrives.
    pub async fn node_query(
        &self,
        origin: NodeId,
        target: NodeId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, BalanceError> {
        let core = &self.core;
        let ticket = core.next_ticket.fetch_add(1, Ordering::Relaxed);
        if let Some(ops) = core.ops_registry(origin) {
            ops.register(ticket);
        }
        let request = Request::NodeOperation(NodeOperationRequest {
            target: Some(target),
            payload: payload.clone(),
        });
        let result = core.dispatcher.request(target.endpoint, request, None).await;
        if let Some(ops) = core.ops_registry(origin) {
            ops.complete(ticket);
        }
        match result?.body {
            Reply::NodeOperation { outcome: OperationOutcome::Completed(bytes) } => Ok(bytes),
            Reply::NodeOperation { outcome: OperationOutcome::NodeRemoved(_) } => {
                core.execute_local_or_forward(payload).await
            }
            Reply::NodeOperation { outcome: OperationOutcome::Failed(reason) } => {
                Err(BalanceError::Rejected(reason))
            }
            Reply::NodeDoesntExist { missing } => {
                Err(BalanceError::Rejected(format!("node {missing} does not exist")))
            }
            other => Err(BalanceError::Rejected(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Broadcasts a start/stop toggle to the whole cluster, this host
    /// included.
    pub async fn set_balancing(&self, start: bool, clear_stats: bool) {
        self.core
            .dispatcher
            .broadcast(Request::StartStopBalancing(StartStopRequest { start, clear_stats }))
            .await;
    }

    /// Spawns the periodic jobs: the balancing tick, the gossip tick and the
    /// metrics tick. Each job stops when [`shutdown`](Self::shutdown) runs.
    pub fn start(&self) {
        register_metrics();
        let cancel = self.cancel.clone();
        let core = self.core.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(core.config.balancing.delta_t);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if core.balancing_on() {
                            // The tick body runs on its own task so a slow
                            // decision never delays the timer.
                            let core = core.clone();
                            tokio::spawn(async move {
                                core.balance_once().await;
                            });
                        }
                    }
                }
            }
        });

        let cancel = self.cancel.clone();
        let core = self.core.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(core.config.gossip.gossip_t);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if core.balancing_on() && !core.dispatcher.take_traffic() {
                            core.gossip_once().await;
                        }
                    }
                }
            }
        });

        let cancel = self.cancel.clone();
        let core = self.core.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(METRICS_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => core.metrics_tick(),
                }
            }
        });
    }

    /// Cancels the periodic jobs. In-flight requests drain on their own.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Serialises the host for persistence: all nodes, the node counter, the
    /// peer directories and the gossip accumulators. The running gossip round
    /// is flushed first.
    pub async fn save_snapshot(&self) -> Result<Vec<u8>, BalanceError> {
        let core = &self.core;
        core.estimator.fold_current(&core.loads.reading());
        let nodes: Vec<Arc<LogicalNode>> = core.nodes.lock().unwrap().values().cloned().collect();
        let mut node_snapshots = Vec::with_capacity(nodes.len());
        for node in nodes {
            let engine = node.engine().snapshot().await?;
            let role = match node.primary() {
                Some(primary) => NodeRoleSnapshot::Replica { primary },
                None => NodeRoleSnapshot::Primary { replicas: node.replicas() },
            };
            node_snapshots.push(NodeSnapshot {
                id: node.id(),
                node_type: node.node_type().to_string(),
                role,
                engine,
            });
        }
        let directory = core.directory.lock().unwrap();
        let snapshot = HostSnapshot {
            node_counter: core.node_counter.load(Ordering::Relaxed),
            nodes: node_snapshots,
            unloaded: directory.unloaded.snapshot(),
            loaded: directory.loaded.snapshot(),
            gossip: core.estimator.snapshot(),
        };
        drop(directory);
        bincode::serialize(&snapshot).map_err(|e| BalanceError::Snapshot(e.to_string()))
    }

    /// Restores a snapshot into this (fresh) host. Meters restart empty with
    /// the configured window sizes; reservations, hysteresis counters and
    /// deleted dispatchers start clean.
    pub fn load_snapshot(&self, bytes: &[u8]) -> Result<(), BalanceError> {
        let snapshot: HostSnapshot =
            bincode::deserialize(bytes).map_err(|e| BalanceError::Snapshot(e.to_string()))?;
        let core = &self.core;
        core.node_counter.store(snapshot.node_counter, Ordering::Relaxed);
        for node_snapshot in snapshot.nodes {
            let engine =
                core.factories.restore(&node_snapshot.node_type, &node_snapshot.engine)?;
            let node = match node_snapshot.role {
                NodeRoleSnapshot::Primary { replicas } => {
                    let node = LogicalNode::new_primary(
                        node_snapshot.id,
                        node_snapshot.node_type,
                        engine,
                        core.clock.clone(),
                        core.config.meters.busy_window,
                        core.config.meters.single_samples,
                    );
                    for (endpoint, replica_id) in replicas {
                        node.add_replica(endpoint, replica_id);
                    }
                    node
                }
                NodeRoleSnapshot::Replica { primary } => LogicalNode::new_replica(
                    node_snapshot.id,
                    node_snapshot.node_type,
                    engine,
                    primary,
                    core.clock.clone(),
                    core.config.meters.busy_window,
                    core.config.meters.single_samples,
                ),
            };
            core.add_node(Arc::new(node));
        }
        let mut directory = core.directory.lock().unwrap();
        directory.unloaded.update_from(&snapshot.unloaded);
        directory.loaded.update_from(&snapshot.loaded);
        drop(directory);
        core.estimator.restore(snapshot.gossip);
        Ok(())
    }
}
