//! The balancing decision engine.
//!
//! Each tick classifies the host against the estimated cluster averages,
//! runs the verdict through a hysteresis gate, and only then drives the
//! remedial action. Classification is pure; remediation talks to peers
//! through the suitability predicates and the action primitives.
//!
//! All threshold comparisons are strict: a host sitting exactly at twice the
//! average is not overloaded.

#[cfg(test)]
#[path = "decision_test.rs"]
mod decision_test;

use std::sync::Arc;

use metrics::counter;
use strum::IntoStaticStr;
use tracing::{debug, info, warn};
use vantage_dispatch::PeerRecord;

use crate::actions::ActionKind;
use crate::gossip::Averages;
use crate::host::HostCore;
use crate::metrics::{BALANCE_DECISIONS, LABEL_KIND};
use crate::node::{LogicalNode, StorageEngine};

#[allow(clippy::as_conversions)]
pub(crate) fn to_f64(value: u64) -> f64 {
    value as f64
}

/// The load condition a host can be in, as seen by one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum OverloadKind {
    /// Plenty of data but no query traffic anywhere.
    Data,
    /// Busy load above twice the cluster average.
    Busy,
    /// Busy load below half the cluster average.
    BusyUnder,
    /// Per-query cost above twice the cluster average.
    Single,
}

/// Verdict of one classification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    /// Nothing to do.
    Balanced,
    /// The named condition holds this tick.
    Overloaded(OverloadKind),
}

/// Inputs of one balancing decision.
#[derive(Clone, Copy, Debug)]
pub struct LoadView {
    /// Number of nodes served (primaries and replicas).
    pub node_count: usize,
    /// Host busy load, if known.
    pub busy: Option<u64>,
    /// Host single load, if known.
    pub single: Option<u64>,
    /// Host data load, if known.
    pub data: Option<u64>,
    /// Estimated cluster averages, if the estimator is ready.
    pub averages: Option<Averages>,
    /// Below this average busy load no busy-based action fires.
    pub min_busy_load: u64,
    /// Below this average data load no data-based action fires.
    pub min_single_load: u64,
}

/// The decision ladder. Any unknown input a rule depends on short-circuits
/// to balanced for this tick.
pub fn classify(view: &LoadView) -> Verdict {
    if view.node_count == 0 {
        return Verdict::Balanced;
    }
    let Some(averages) = view.averages else {
        return Verdict::Balanced;
    };
    let Some(data) = view.data else {
        return Verdict::Balanced;
    };

    // An idle host in an idle cluster can still hoard data.
    if view.busy == Some(0) && averages.busy < to_f64(view.min_busy_load) {
        if averages.data > to_f64(view.min_single_load) && to_f64(data) >= 1.5 * averages.data {
            return Verdict::Overloaded(OverloadKind::Data);
        }
    }

    let Some(busy) = view.busy else {
        return Verdict::Balanced;
    };
    if averages.busy < to_f64(view.min_busy_load) {
        return Verdict::Balanced;
    }
    if to_f64(busy) > 2.0 * averages.busy {
        return Verdict::Overloaded(OverloadKind::Busy);
    }
    if to_f64(busy) < 0.5 * averages.busy {
        return Verdict::Overloaded(OverloadKind::BusyUnder);
    }
    let Some(single) = view.single else {
        return Verdict::Balanced;
    };
    if to_f64(single) > 2.0 * averages.single {
        return Verdict::Overloaded(OverloadKind::Single);
    }
    Verdict::Balanced
}

/// Gate requiring the same overload kind for a number of consecutive ticks
/// before an action fires. The counter resets when a different kind wins or
/// the host is balanced.
#[derive(Debug)]
pub struct Hysteresis {
    rechecks: u32,
    kind: Option<OverloadKind>,
    count: u32,
}

impl Hysteresis {
    /// Gate passing after `rechecks + 1` consecutive observations.
    pub fn new(rechecks: u32) -> Self {
        Self { rechecks, kind: None, count: 0 }
    }

    /// Feeds one verdict through the gate; returns the kind to act on, if
    /// the gate opened.
    pub fn observe(&mut self, verdict: Verdict) -> Option<OverloadKind> {
        match verdict {
            Verdict::Balanced => {
                self.kind = None;
                self.count = 0;
                None
            }
            Verdict::Overloaded(kind) => {
                if self.kind == Some(kind) {
                    self.count += 1;
                } else {
                    self.kind = Some(kind);
                    self.count = 1;
                }
                (self.count > self.rechecks).then_some(kind)
            }
        }
    }

    /// Clears the gate.
    pub fn reset(&mut self) {
        self.kind = None;
        self.count = 0;
    }
}

/// What one balancing tick amounted to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickOutcome {
    /// Another tick is still running; this one did nothing.
    Skipped,
    /// No action required or possible.
    Balanced,
    /// An overload was observed but the hysteresis gate is not yet open.
    Pending(OverloadKind),
    /// The named action completed.
    Acted(ActionKind),
    /// The named action was attempted and failed; the next tick retries.
    Failed(ActionKind),
}

impl HostCore {
    /// One balancing attempt. Non-reentrant: a tick arriving while another
    /// runs returns immediately.
    pub(crate) async fn balance_once(&self) -> TickOutcome {
        let Ok(_guard) = self.balance_lock.try_lock() else {
            counter!(BALANCE_DECISIONS, LABEL_KIND => "skipped").increment(1);
            return TickOutcome::Skipped;
        };
        let view = self.load_view();
        let verdict = classify(&view);
        let fired = self.hysteresis.lock().unwrap().observe(verdict);
        let kind = match (verdict, fired) {
            (Verdict::Balanced, _) => {
                counter!(BALANCE_DECISIONS, LABEL_KIND => "balanced").increment(1);
                return TickOutcome::Balanced;
            }
            (Verdict::Overloaded(kind), None) => {
                debug!(?kind, "overload observed, awaiting recheck");
                return TickOutcome::Pending(kind);
            }
            (Verdict::Overloaded(kind), Some(_)) => kind,
        };
        let kind_label: &'static str = kind.into();
        counter!(BALANCE_DECISIONS, LABEL_KIND => kind_label).increment(1);
        let Some(averages) = view.averages else {
            return TickOutcome::Balanced;
        };
        info!(?kind, ?view, "acting on overload");
        match kind {
            OverloadKind::Data => self.remedy_data_overload(&view, averages).await,
            OverloadKind::Busy => self.remedy_busy_overload(&view, averages).await,
            OverloadKind::BusyUnder => self.remedy_underload(averages).await,
            OverloadKind::Single => self.remedy_single_overload(&view, averages).await,
        }
    }

    /// Peers from the least-loaded directory, own entry excluded.
    pub(crate) fn unloaded_peers(&self) -> Vec<PeerRecord> {
        self.directory
            .lock()
            .unwrap()
            .unloaded
            .snapshot()
            .into_iter()
            .filter(|peer| peer.endpoint != self.endpoint)
            .collect()
    }

    /// Peers from the most-loaded directory, own entry excluded.
    pub(crate) fn loaded_peers(&self) -> Vec<PeerRecord> {
        self.directory
            .lock()
            .unwrap()
            .loaded
            .snapshot()
            .into_iter()
            .filter(|peer| peer.endpoint != self.endpoint)
            .collect()
    }

    /// The directory record held for `endpoint`, whichever list carries it.
    pub(crate) fn peer_record(
        &self,
        endpoint: vantage_dispatch::NetworkEndpoint,
    ) -> Option<PeerRecord> {
        let directory = self.directory.lock().unwrap();
        directory.unloaded.get(endpoint).or_else(|| directory.loaded.get(endpoint)).copied()
    }

    fn sole_primary(&self) -> Option<Arc<LogicalNode>> {
        let primaries = self.primaries();
        match primaries.as_slice() {
            [node] => Some(node.clone()),
            _ => None,
        }
    }

    fn most_data_primary(&self) -> Option<Arc<LogicalNode>> {
        self.primaries().into_iter().max_by_key(|node| node.engine().object_count())
    }

    /// An idle host hoarding data: hand a whole node (or half of the only
    /// one) to an empty peer.
    async fn remedy_data_overload(&self, view: &LoadView, _averages: Averages) -> TickOutcome {
        for peer in self.unloaded_peers() {
            if peer.data != 0 {
                continue;
            }
            if !self.probe_empty(peer.endpoint).await {
                continue;
            }
            // The probe reserved the peer; an action must follow or cancel.
            if view.node_count > 1 {
                let Some(node) = self.most_data_primary() else {
                    self.cancel_reservation(peer.endpoint).await;
                    return TickOutcome::Balanced;
                };
                return match self.migrate_node(&node, peer.endpoint).await {
                    Ok(()) => TickOutcome::Acted(ActionKind::Migrate),
                    Err(e) => {
                        warn!(error = %e, "migrate to empty peer failed");
                        TickOutcome::Failed(ActionKind::Migrate)
                    }
                };
            }
            let Some(node) = self.sole_primary() else {
                self.cancel_reservation(peer.endpoint).await;
                return TickOutcome::Balanced;
            };
            return match self.split_node(&node, peer.endpoint).await {
                Ok(()) => TickOutcome::Acted(ActionKind::Split),
                Err(e) => {
                    warn!(error = %e, "split to empty peer failed");
                    TickOutcome::Failed(ActionKind::Split)
                }
            };
        }
        TickOutcome::Balanced
    }

    async fn remedy_busy_overload(&self, view: &LoadView, averages: Averages) -> TickOutcome {
        if view.node_count > 1 {
            return self.delete_or_migrate(view, averages, true).await;
        }
        let Some(node) = self.sole_primary() else {
            // A lone replica defers to its primary.
            return TickOutcome::Balanced;
        };
        let single_dominated =
            matches!(view.single, Some(single) if to_f64(single) > 2.0 * averages.single);
        for peer in self.unloaded_peers() {
            if !self.is_under_avg(&peer, averages).await {
                continue;
            }
            return if single_dominated {
                match self.split_node(&node, peer.endpoint).await {
                    Ok(()) => TickOutcome::Acted(ActionKind::Split),
                    Err(e) => {
                        warn!(error = %e, "split under busy overload failed");
                        TickOutcome::Failed(ActionKind::Split)
                    }
                }
            } else {
                match self.replicate_node(&node, peer.endpoint, false).await {
                    Ok(()) => TickOutcome::Acted(ActionKind::Replicate),
                    Err(e) => {
                        warn!(error = %e, "replicate under busy overload failed");
                        TickOutcome::Failed(ActionKind::Replicate)
                    }
                }
            };
        }
        TickOutcome::Balanced
    }

    async fn remedy_single_overload(&self, view: &LoadView, averages: Averages) -> TickOutcome {
        if view.node_count > 1 {
            return self.delete_or_migrate(view, averages, false).await;
        }
        let Some(node) = self.sole_primary() else {
            return TickOutcome::Balanced;
        };
        let added_busy = node.busy.value().unwrap_or(0) / 2;
        let added_single = node.single.value().unwrap_or(0) / 2;
        for peer in self.unloaded_peers() {
            if !self.is_safe(&peer, view, averages, added_busy, added_single).await {
                continue;
            }
            return match self.split_node(&node, peer.endpoint).await {
                Ok(()) => TickOutcome::Acted(ActionKind::Split),
                Err(e) => {
                    warn!(error = %e, "split under single overload failed");
                    TickOutcome::Failed(ActionKind::Split)
                }
            };
        }
        TickOutcome::Balanced
    }

    /// An underloaded host sheds replicas first, then solicits work: merge
    /// offers to the neighbours its nodes name, then general offers to the
    /// most loaded peers.
    async fn remedy_underload(&self, _averages: Averages) -> TickOutcome {
        for node in self.primaries() {
            for (endpoint, replica_id) in node.replicas() {
                if !self.probe_replica_removal(endpoint, replica_id).await {
                    continue;
                }
                return match self.unify_replica(&node, endpoint, replica_id, false).await {
                    Ok(()) => TickOutcome::Acted(ActionKind::Unify),
                    Err(e) => {
                        warn!(error = %e, "unify under underload failed");
                        TickOutcome::Failed(ActionKind::Unify)
                    }
                };
            }
        }
        for node in self.primaries() {
            let Some(candidate) = node.engine().merge_candidate() else {
                continue;
            };
            if candidate.endpoint == self.endpoint {
                continue;
            }
            if let Ok(true) = self.send_balancing_offer(candidate.endpoint, Some(candidate)).await {
                return TickOutcome::Acted(ActionKind::Offer);
            }
        }
        for peer in self.loaded_peers() {
            if let Ok(true) = self.send_balancing_offer(peer.endpoint, None).await {
                return TickOutcome::Acted(ActionKind::Offer);
            }
        }
        TickOutcome::Balanced
    }

    /// Sheds whole nodes: Leave the least-loaded unreplicated primary if its
    /// merge peer stays safe, otherwise migrate some node to an acceptable
    /// peer.
    async fn delete_or_migrate(
        &self,
        view: &LoadView,
        averages: Averages,
        check_under_avg: bool,
    ) -> TickOutcome {
        let mut nodes = self.primaries();
        nodes.sort_by_key(|node| node.busy.value().unwrap_or(0));

        if let Some(least) = nodes.first() {
            if least.replicas().is_empty() {
                if let Some(candidate) = least.engine().merge_candidate() {
                    if let Some(record) = self.peer_record(candidate.endpoint) {
                        let added_busy = least.busy.value().unwrap_or(0);
                        let added_single = least.single.value().unwrap_or(0);
                        if self.is_safe(&record, view, averages, added_busy, added_single).await {
                            let outcome = self.leave_node(least).await;
                            // The safety probe reserved the merge peer; the
                            // data transfer happens inside the engine, so
                            // release the reservation explicitly.
                            self.cancel_reservation(record.endpoint).await;
                            return match outcome {
                                Ok(()) => TickOutcome::Acted(ActionKind::Leave),
                                Err(e) => {
                                    warn!(error = %e, "leave failed");
                                    TickOutcome::Failed(ActionKind::Leave)
                                }
                            };
                        }
                    }
                }
            }
        }

        for node in &nodes {
            let added_busy = node.busy.value().unwrap_or(0);
            let added_single = node.single.value().unwrap_or(0);
            for peer in self.unloaded_peers() {
                let suitable = if check_under_avg {
                    self.is_under_avg(&peer, averages).await
                } else {
                    self.is_safe(&peer, view, averages, added_busy, added_single).await
                };
                if !suitable {
                    continue;
                }
                return match self.migrate_node(node, peer.endpoint).await {
                    Ok(()) => TickOutcome::Acted(ActionKind::Migrate),
                    Err(e) => {
                        warn!(error = %e, "migrate failed");
                        TickOutcome::Failed(ActionKind::Migrate)
                    }
                };
            }
        }
        TickOutcome::Balanced
    }
}
