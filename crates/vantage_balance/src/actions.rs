//! The balancing action protocol.
//!
//! Every action against a remote host starts with a reservation: a
//! `SuitableHost` probe that both checks the target's projected load and
//! claims its single reservation slot. The action-specific message must then
//! come from the reservation holder; completion or an explicit cancel
//! releases the slot. A reservation untouched for three balancing ticks is
//! treated as abandoned and may be claimed over.
//!
//! Source-side primitives (Split, Leave, Migrate, Replicate, Unify) revert
//! their local changes when the action fails, so a failed action leaves the
//! topology as it was.

#[cfg(test)]
#[path = "actions_test.rs"]
mod actions_test;

use std::sync::Arc;

use metrics::counter;
use strum::IntoStaticStr;
use tracing::{debug, warn};
use vantage_dispatch::messages::{
    BalancingOfferRequest,
    CreateNodeRequest,
    MigrateNotifyRequest,
    MigrateRequest,
    RefusalCode,
    ReplicateRequest,
    SuitableHostRequest,
    UnifyRequest,
};
use vantage_dispatch::{
    DispatchError,
    Dispatcher,
    NetworkEndpoint,
    NodeId,
    PeerRecord,
    Reply,
    Request,
};

use crate::clock::Clock;
use crate::decision::{to_f64, LoadView};
use crate::gossip::Averages;
use crate::host::{DeferredVerdict, Forwarding, HostCore, Reservation};
use crate::metrics::{
    BALANCE_ACTIONS_FAILED,
    BALANCE_ACTIONS_STARTED,
    BALANCE_ACTIONS_SUCCEEDED,
    LABEL_ACTION,
    RESERVATIONS_REFUSED,
};
use crate::node::{EngineError, LogicalNode, StorageEngine};

/// The topology-mutating primitives, plus the balancing-offer dialog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    /// Partition one node across two hosts.
    Split,
    /// Dissolve a node into its merge neighbour.
    Leave,
    /// Move a node to another host.
    Migrate,
    /// Create a replica of a primary elsewhere.
    Replicate,
    /// Remove one replica of a primary.
    Unify,
    /// A balancing offer another host accepted.
    Offer,
}

/// Why an action attempt failed. All variants are transient; the decision
/// engine retries on a later tick.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ActionError {
    /// The target's reservation slot or projected load refused us.
    #[error("target not suitable")]
    NotSuitable,
    /// The target's reservation is held by someone else.
    #[error("target refused: not asked")]
    NotAsked,
    /// The node's engine cannot split.
    #[error("node cannot split")]
    CannotSplit,
    /// An engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The transport failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// The target answered with something the protocol does not allow here.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

fn action_started(kind: ActionKind) {
    let label: &'static str = kind.into();
    counter!(BALANCE_ACTIONS_STARTED, LABEL_ACTION => label).increment(1);
}

fn action_finished(kind: ActionKind, ok: bool) {
    let label: &'static str = kind.into();
    if ok {
        counter!(BALANCE_ACTIONS_SUCCEEDED, LABEL_ACTION => label).increment(1);
    } else {
        counter!(BALANCE_ACTIONS_FAILED, LABEL_ACTION => label).increment(1);
    }
}

impl HostCore {
    // ---- suitability predicates (source side) ----

    /// Sends a reservation probe; `true` means the target is now reserved
    /// for us and an action (or a cancel) must follow.
    pub(crate) async fn reserve(
        &self,
        target: NetworkEndpoint,
        request: SuitableHostRequest,
    ) -> bool {
        match self.dispatcher.request(target, Request::SuitableHost(request), None).await {
            Ok(reply) => matches!(reply.body, Reply::SuitableHost { ok: true }),
            Err(e) => {
                debug!(%target, error = %e, "reservation probe failed");
                false
            }
        }
    }

    /// Releases a reservation we hold on `target`.
    pub(crate) async fn cancel_reservation(&self, target: NetworkEndpoint) {
        let request = Request::SuitableHost(SuitableHostRequest::cancel());
        if let Err(e) = self.dispatcher.request(target, request, None).await {
            warn!(%target, error = %e, "reservation cancel failed");
        }
    }

    /// Whether `peer` is an empty host ready to take a node: no data in the
    /// directory record and a fresh probe confirming it.
    pub(crate) async fn probe_empty(&self, target: NetworkEndpoint) -> bool {
        let request = SuitableHostRequest {
            fresh_requested: true,
            ..SuitableHostRequest::with_added(0, 0)
        };
        self.reserve(target, request).await
    }

    /// Whether the host at `target` agrees that removing `replica` is safe.
    pub(crate) async fn probe_replica_removal(
        &self,
        target: NetworkEndpoint,
        replica: NodeId,
    ) -> bool {
        let request =
            SuitableHostRequest { replica: Some(replica), ..SuitableHostRequest::with_added(0, 0) };
        self.reserve(target, request).await
    }

    /// Whether shifting `(added_busy, added_single)` onto `peer` keeps both
    /// sides safe: the peer under twice the average, us above half of it.
    pub(crate) async fn is_safe(
        &self,
        peer: &PeerRecord,
        view: &LoadView,
        averages: Averages,
        added_busy: u64,
        added_single: u64,
    ) -> bool {
        let Some(peer_busy) = peer.busy else {
            return false;
        };
        if to_f64(peer_busy.saturating_add(added_busy)) > 2.0 * averages.busy {
            return false;
        }
        let Some(my_busy) = view.busy else {
            return false;
        };
        if to_f64(my_busy.saturating_sub(added_busy)) < 0.5 * averages.busy {
            return false;
        }
        self.reserve(peer.endpoint, SuitableHostRequest::with_added(added_busy, added_single))
            .await
    }

    /// Whether `peer` is at or under the average busy load, by directory
    /// record and by its own account.
    pub(crate) async fn is_under_avg(&self, peer: &PeerRecord, averages: Averages) -> bool {
        let Some(peer_busy) = peer.busy else {
            return false;
        };
        if to_f64(peer_busy) > averages.busy {
            return false;
        }
        let request =
            SuitableHostRequest { check_under_avg: true, ..SuitableHostRequest::with_added(0, 0) };
        self.reserve(peer.endpoint, request).await
    }

    // ---- action primitives (source side) ----

    /// Splits `node`, placing the departing half on `target` (which must be
    /// reserved). The node's replicas are silently unified first and the new
    /// primary rebuilds them; on failure they are silently rebuilt here, so
    /// a failed split leaves the replica set unchanged.
    pub(crate) async fn split_node(
        &self,
        node: &Arc<LogicalNode>,
        target: NetworkEndpoint,
    ) -> Result<(), ActionError> {
        action_started(ActionKind::Split);
        let plan = match node.engine().split().await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                self.cancel_reservation(target).await;
                action_finished(ActionKind::Split, false);
                return Err(ActionError::CannotSplit);
            }
            Err(e) => {
                self.cancel_reservation(target).await;
                action_finished(ActionKind::Split, false);
                return Err(e.into());
            }
        };
        let replicas = node.replicas();
        for (endpoint, replica_id) in &replicas {
            self.silent_unify(node, *endpoint, *replica_id).await;
        }
        let request = Request::CreateNode(CreateNodeRequest {
            node_type: plan.node_type,
            params: plan.params,
            replication_peers: replicas.iter().map(|(endpoint, _)| *endpoint).collect(),
        });
        let outcome = match self.dispatcher.request(target, request, None).await {
            Ok(reply) => match reply.body {
                Reply::CreateNode { node_id } => {
                    debug!(%node_id, %target, "split placed new node");
                    Ok(())
                }
                Reply::Refused { code } => Err(refusal_error(code)),
                other => Err(ActionError::UnexpectedReply(format!("{other:?}"))),
            },
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(()) => {
                node.reset_meters();
                self.loads.reset();
                action_finished(ActionKind::Split, true);
                Ok(())
            }
            Err(e) => {
                // Net-zero on failure: rebuild the replicas we unified.
                for (endpoint, _) in &replicas {
                    if let Err(rebuild) = self.silent_replicate(node, *endpoint).await {
                        warn!(%endpoint, error = %rebuild, "replica rebuild after failed split");
                    }
                }
                self.cancel_reservation(target).await;
                action_finished(ActionKind::Split, false);
                Err(e)
            }
        }
    }

    /// Dissolves `node`: replicas are silently unified, the node is
    /// pre-removed, the engine redistributes its data, and only then is the
    /// node gone for good. Engine failure reverts the pre-removal.
    pub(crate) async fn leave_node(&self, node: &Arc<LogicalNode>) -> Result<(), ActionError> {
        action_started(ActionKind::Leave);
        for (endpoint, replica_id) in node.replicas() {
            self.silent_unify(node, endpoint, replica_id).await;
        }
        let id = node.id();
        self.pre_remove(id);
        match node.engine().leave().await {
            Ok(()) => {
                self.finish_remove(id);
                self.loads.reset();
                action_finished(ActionKind::Leave, true);
                Ok(())
            }
            Err(e) => {
                self.revert_pre_remove(id);
                action_finished(ActionKind::Leave, false);
                Err(e.into())
            }
        }
    }

    /// Moves `node` onto `target` (which must be reserved). Messages for the
    /// node queue while the move is in flight; on success they drain to the
    /// new id, on failure back to the revived node.
    pub(crate) async fn migrate_node(
        &self,
        node: &Arc<LogicalNode>,
        target: NetworkEndpoint,
    ) -> Result<(), ActionError> {
        action_started(ActionKind::Migrate);
        let snapshot = match node.engine().snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.cancel_reservation(target).await;
                action_finished(ActionKind::Migrate, false);
                return Err(e.into());
            }
        };
        let id = node.id();
        // The forwarding entry goes in first: a message arriving between the
        // two steps still finds either the live node or the pending entry.
        self.forwarding.lock().unwrap().insert(id, Forwarding::Pending);
        self.pre_remove(id);
        let request = Request::Migrate(MigrateRequest {
            orig_id: id,
            node_type: node.node_type().to_string(),
            snapshot,
            replicas: node.replicas(),
        });
        let outcome = match self.dispatcher.request(target, request, None).await {
            Ok(reply) => match reply.body {
                Reply::Migrate { new_id } => Ok(new_id),
                Reply::Refused { code } => Err(refusal_error(code)),
                other => Err(ActionError::UnexpectedReply(format!("{other:?}"))),
            },
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(new_id) => {
                self.forwarding.lock().unwrap().insert(id, Forwarding::Moved(new_id));
                self.finish_remove(id);
                self.resolve_deferred(id, DeferredVerdict::Moved(new_id));
                self.loads.reset();
                action_finished(ActionKind::Migrate, true);
                Ok(())
            }
            Err(e) => {
                self.forwarding.lock().unwrap().remove(&id);
                self.revert_pre_remove(id);
                self.resolve_deferred(id, DeferredVerdict::Reverted);
                self.cancel_reservation(target).await;
                action_finished(ActionKind::Migrate, false);
                Err(e)
            }
        }
    }

    /// Creates a replica of `node` on `target`. The silent variant skips
    /// reservation bookkeeping and meter resets; it is the split's tool for
    /// rebuilding replication.
    pub(crate) async fn replicate_node(
        &self,
        node: &Arc<LogicalNode>,
        target: NetworkEndpoint,
        silent: bool,
    ) -> Result<(), ActionError> {
        if !silent {
            action_started(ActionKind::Replicate);
        }
        let snapshot = match node.engine().snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if !silent {
                    self.cancel_reservation(target).await;
                    action_finished(ActionKind::Replicate, false);
                }
                return Err(e.into());
            }
        };
        let request = Request::Replicate(ReplicateRequest {
            primary: node.id(),
            node_type: node.node_type().to_string(),
            snapshot,
            silent,
        });
        let outcome = match self.dispatcher.request(target, request, None).await {
            Ok(reply) => match reply.body {
                Reply::Replicate { replica_id } => Ok(replica_id),
                Reply::Refused { code } => Err(refusal_error(code)),
                other => Err(ActionError::UnexpectedReply(format!("{other:?}"))),
            },
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(replica_id) => {
                node.add_replica(target, replica_id);
                if !silent {
                    node.reset_meters();
                    self.loads.reset();
                    action_finished(ActionKind::Replicate, true);
                }
                Ok(())
            }
            Err(e) => {
                if !silent {
                    self.cancel_reservation(target).await;
                    action_finished(ActionKind::Replicate, false);
                }
                Err(e)
            }
        }
    }

    /// Removes the replica of `node` living at `endpoint`. Failure leaves
    /// the replication factor one short until a later tick reconciles.
    pub(crate) async fn unify_replica(
        &self,
        node: &Arc<LogicalNode>,
        endpoint: NetworkEndpoint,
        replica_id: NodeId,
        silent: bool,
    ) -> Result<(), ActionError> {
        if !silent {
            action_started(ActionKind::Unify);
        }
        node.remove_replica(endpoint);
        let request = Request::Unify(UnifyRequest { replica: replica_id, silent });
        let outcome = match self.dispatcher.request(endpoint, request, None).await {
            Ok(reply) => match reply.body {
                Reply::Ack => Ok(()),
                Reply::Refused { code } => Err(refusal_error(code)),
                other => Err(ActionError::UnexpectedReply(format!("{other:?}"))),
            },
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(()) => {
                if !silent {
                    node.reset_meters();
                    self.loads.reset();
                    action_finished(ActionKind::Unify, true);
                }
                Ok(())
            }
            Err(e) => {
                warn!(%endpoint, replica = %replica_id, error = %e, "replica removal failed");
                if !silent {
                    self.cancel_reservation(endpoint).await;
                    action_finished(ActionKind::Unify, false);
                }
                Err(e)
            }
        }
    }

    /// Silent unify during a split: failures are logged, never fatal.
    pub(crate) async fn silent_unify(
        &self,
        node: &Arc<LogicalNode>,
        endpoint: NetworkEndpoint,
        replica_id: NodeId,
    ) {
        if let Err(e) = self.unify_replica(node, endpoint, replica_id, true).await {
            warn!(%endpoint, replica = %replica_id, error = %e, "silent unify failed");
        }
    }

    /// Silent replicate during a split (and its failure path).
    pub(crate) async fn silent_replicate(
        &self,
        node: &Arc<LogicalNode>,
        endpoint: NetworkEndpoint,
    ) -> Result<(), ActionError> {
        self.replicate_node(node, endpoint, true).await
    }

    /// Offers this host's spare capacity to `target`. `Ok(true)` means the
    /// target acted on the offer.
    pub(crate) async fn send_balancing_offer(
        &self,
        target: NetworkEndpoint,
        node_to_delete: Option<NodeId>,
    ) -> Result<bool, ActionError> {
        let request = Request::BalancingOffer(BalancingOfferRequest {
            node_to_delete,
            sender_load: self.loads.own_record(),
        });
        match self.dispatcher.request(target, request, None).await?.body {
            Reply::BalancingOffer { accepted } => Ok(accepted),
            Reply::Refused { .. } => Ok(false),
            other => Err(ActionError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    // ---- target side ----

    /// Answers a reservation probe. Grants iff the slot is free (or stale,
    /// or already ours) and every requested suitability check passes.
    pub(crate) fn handle_suitable_host(
        &self,
        sender: NetworkEndpoint,
        request: SuitableHostRequest,
    ) -> Reply {
        if request.cancel {
            let mut slot = self.reservation.lock().unwrap();
            if slot.map_or(false, |r| r.source == sender) {
                *slot = None;
            }
            return Reply::SuitableHost { ok: true };
        }

        let suitable = self.evaluate_suitability(&request);
        if !suitable {
            counter!(RESERVATIONS_REFUSED).increment(1);
            return Reply::SuitableHost { ok: false };
        }

        let now = self.clock.now();
        let stale_after = self.config.balancing.delta_t * 3;
        let mut slot = self.reservation.lock().unwrap();
        if let Some(held) = *slot {
            let stale = now.duration_since(held.taken_at) > stale_after;
            if held.source != sender && !stale {
                counter!(RESERVATIONS_REFUSED).increment(1);
                return Reply::SuitableHost { ok: false };
            }
        }
        *slot = Some(Reservation { source: sender, taken_at: now });
        Reply::SuitableHost { ok: true }
    }

    fn evaluate_suitability(&self, request: &SuitableHostRequest) -> bool {
        if request.fresh_requested && self.loads.data() != 0 {
            return false;
        }
        if let Some(replica) = request.replica {
            let holds_replica = self.node(replica).map_or(false, |node| !node.is_primary());
            if !holds_replica {
                return false;
            }
        }
        // With no estimate yet there is nothing to project against; a host
        // in warm-up accepts work.
        let Some(averages) = self.estimator.averages() else {
            return true;
        };
        let busy = self.loads.busy.value().unwrap_or(0);
        if request.check_under_avg && to_f64(busy) > averages.busy {
            return false;
        }
        if to_f64(busy.saturating_add(request.added_busy)) > 2.0 * averages.busy {
            return false;
        }
        true
    }

    /// Consumes the reservation if `sender` holds it. Action handlers call
    /// this first; the completion reply then releases the slot implicitly.
    pub(crate) fn take_reservation(&self, sender: NetworkEndpoint) -> bool {
        let mut slot = self.reservation.lock().unwrap();
        match *slot {
            Some(held) if held.source == sender => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Builds and starts the node a remote split produced, then silently
    /// replicates it onto the old replica peers to preserve the factor.
    pub(crate) async fn handle_create_node(
        &self,
        sender: NetworkEndpoint,
        request: CreateNodeRequest,
    ) -> Reply {
        if !self.take_reservation(sender) {
            return Reply::Refused { code: RefusalCode::NotAsked };
        }
        let engine = match self.factories.create(&request.node_type, &request.params) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "create node failed");
                return Reply::Refused { code: RefusalCode::NotSuitable };
            }
        };
        let id = self.allocate_node_id();
        let node = Arc::new(LogicalNode::new_primary(
            id,
            request.node_type,
            engine,
            self.clock.clone(),
            self.config.meters.busy_window,
            self.config.meters.single_samples,
        ));
        self.add_node(node.clone());
        for endpoint in request.replication_peers {
            if endpoint == self.endpoint {
                continue;
            }
            if let Err(e) = self.silent_replicate(&node, endpoint).await {
                warn!(%endpoint, error = %e, "replication rebuild after split failed");
            }
        }
        Reply::CreateNode { node_id: id }
    }

    /// Restores a migrated node under a fresh id and notifies its replicas.
    pub(crate) async fn handle_migrate(
        &self,
        sender: NetworkEndpoint,
        request: MigrateRequest,
    ) -> Reply {
        if !self.take_reservation(sender) {
            return Reply::Refused { code: RefusalCode::NotAsked };
        }
        let engine = match self.factories.restore(&request.node_type, &request.snapshot) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "migrate restore failed");
                return Reply::Refused { code: RefusalCode::NotSuitable };
            }
        };
        let new_id = self.allocate_node_id();
        let node = Arc::new(LogicalNode::new_primary(
            new_id,
            request.node_type,
            engine.clone(),
            self.clock.clone(),
            self.config.meters.busy_window,
            self.config.meters.single_samples,
        ));
        for (endpoint, replica_id) in &request.replicas {
            node.add_replica(*endpoint, *replica_id);
        }
        self.add_node(node);
        if let Err(e) = engine.migrate(request.orig_id, new_id).await {
            warn!(error = %e, "engine rejected migration");
            self.pre_remove(new_id);
            self.finish_remove(new_id);
            return Reply::Refused { code: RefusalCode::NotSuitable };
        }
        let notify = MigrateNotifyRequest { orig_id: request.orig_id, new_id };
        for (endpoint, _) in &request.replicas {
            if let Err(e) =
                self.dispatcher.request(*endpoint, Request::MigrateNotify(notify), None).await
            {
                warn!(%endpoint, error = %e, "migrate notify failed");
            }
        }
        Reply::Migrate { new_id }
    }

    /// Builds a replica wrapper for a remote primary.
    pub(crate) async fn handle_replicate(
        &self,
        sender: NetworkEndpoint,
        request: ReplicateRequest,
    ) -> Reply {
        if !request.silent && !self.take_reservation(sender) {
            return Reply::Refused { code: RefusalCode::NotAsked };
        }
        let engine = match self.factories.restore(&request.node_type, &request.snapshot) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "replica restore failed");
                return Reply::Refused { code: RefusalCode::NotSuitable };
            }
        };
        let id = self.allocate_node_id();
        let node = Arc::new(LogicalNode::new_replica(
            id,
            request.node_type,
            engine,
            request.primary,
            self.clock.clone(),
            self.config.meters.busy_window,
            self.config.meters.single_samples,
        ));
        self.add_node(node);
        Reply::Replicate { replica_id: id }
    }

    /// Disposes of a replica wrapper.
    pub(crate) async fn handle_unify(
        &self,
        sender: NetworkEndpoint,
        request: UnifyRequest,
    ) -> Reply {
        if !request.silent && !self.take_reservation(sender) {
            return Reply::Refused { code: RefusalCode::NotAsked };
        }
        match self.node(request.replica) {
            Some(node) if !node.is_primary() => {
                self.pre_remove(request.replica);
                self.finish_remove(request.replica);
                Reply::Ack
            }
            _ => Reply::NodeDoesntExist { missing: request.replica },
        }
    }

    /// The loaded side of the balancing-offer dialog: delete the named node
    /// if that is safe, or push work to the underloaded sender.
    pub(crate) async fn handle_balancing_offer(
        &self,
        sender: NetworkEndpoint,
        offer: BalancingOfferRequest,
    ) -> Reply {
        let Ok(_guard) = self.balance_lock.try_lock() else {
            return Reply::Refused { code: RefusalCode::WontBalance };
        };
        let view = self.load_view();
        let Some(averages) = view.averages else {
            return Reply::Refused { code: RefusalCode::WontBalance };
        };

        if let Some(node_id) = offer.node_to_delete {
            let Some(node) = self.node(node_id) else {
                return Reply::Refused { code: RefusalCode::WontBalance };
            };
            if !node.is_primary() || !node.replicas().is_empty() {
                return Reply::Refused { code: RefusalCode::WontBalance };
            }
            let Some(busy) = view.busy else {
                return Reply::Refused { code: RefusalCode::WontBalance };
            };
            let node_busy = node.busy.value().unwrap_or(0);
            if to_f64(busy.saturating_sub(node_busy)) < 0.5 * averages.busy {
                return Reply::Refused { code: RefusalCode::WontBalance };
            }
            return match self.leave_node(&node).await {
                Ok(()) => Reply::BalancingOffer { accepted: true },
                Err(e) => {
                    warn!(error = %e, "offered node deletion failed");
                    Reply::Refused { code: RefusalCode::WontBalance }
                }
            };
        }

        let Some(busy) = view.busy else {
            return Reply::Refused { code: RefusalCode::WontBalance };
        };
        if to_f64(busy) <= averages.busy {
            return Reply::Refused { code: RefusalCode::WontBalance };
        }
        // The least-loaded primary that actually carries traffic.
        let node = self
            .primaries()
            .into_iter()
            .filter(|node| node.busy.value().unwrap_or(0) > 0)
            .min_by_key(|node| node.busy.value().unwrap_or(0));
        let Some(node) = node else {
            return Reply::Refused { code: RefusalCode::WontBalance };
        };
        let node_busy = node.busy.value().unwrap_or(0);
        let node_single = node.single.value().unwrap_or(0);

        if view.node_count > 1 {
            if self.is_safe(&offer.sender_load, &view, averages, node_busy, node_single).await
                && self.migrate_node(&node, sender).await.is_ok()
            {
                return Reply::BalancingOffer { accepted: true };
            }
        } else if to_f64(node_single) > 2.0 * averages.single {
            if self
                .is_safe(&offer.sender_load, &view, averages, node_busy / 2, node_single / 2)
                .await
                && self.split_node(&node, sender).await.is_ok()
            {
                return Reply::BalancingOffer { accepted: true };
            }
        } else if self
            .is_safe(&offer.sender_load, &view, averages, node_busy / 2, node_single / 2)
            .await
            && self.replicate_node(&node, sender, false).await.is_ok()
        {
            return Reply::BalancingOffer { accepted: true };
        }
        Reply::Refused { code: RefusalCode::WontBalance }
    }
}

fn refusal_error(code: RefusalCode) -> ActionError {
    match code {
        RefusalCode::NotAsked => ActionError::NotAsked,
        RefusalCode::NotSuitable | RefusalCode::WontBalance => ActionError::NotSuitable,
    }
}
