//! Push-sum estimation of cluster-wide load averages.
//!
//! Every host keeps three numerators (single, busy, data load) sharing one
//! conservation weight. Before any payload leaves the host, the current local
//! load is folded into the numerators; the payload then carries half of every
//! accumulator and the host keeps the other half. A receiver credits the
//! payload into its own accumulators. The sum over all live hosts of each
//! accumulator is invariant (modulo message loss), so numerator divided by
//! weight converges to the true cluster average on every host.
//!
//! Payloads ride along every request and reply the host exchanges; a
//! dedicated gossip tick only fires when no other traffic was seen.

#[cfg(test)]
#[path = "gossip_test.rs"]
mod gossip_test;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;
use vantage_dispatch::{
    DispatchError,
    Dispatcher,
    GossipPayload,
    NetworkEndpoint,
    ReplyEnvelope,
    Request,
    RequestEnvelope,
};

use crate::host_list::PeerDirectory;
use crate::load::HostLoadTracker;

/// Cluster-wide averages as currently estimated by this host.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Averages {
    /// Average busy load per host.
    pub busy: f64,
    /// Average single load per host.
    pub single: f64,
    /// Average data load per host.
    pub data: f64,
}

/// Persisted accumulator values. The fold snapshot and readiness are
/// transient and reseeded on load.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipStateSnapshot {
    /// Single-load numerator.
    pub single: f64,
    /// Busy-load numerator.
    pub busy: f64,
    /// Data-load numerator.
    pub data: f64,
    /// Conservation weight.
    pub weight: f64,
}

#[derive(Debug)]
struct EstimatorState {
    single: f64,
    busy: f64,
    data: f64,
    weight: f64,
    // Last self-reading already folded into the numerators.
    single0: f64,
    busy0: f64,
    data0: f64,
    // Set once a remote payload has been credited; averages are not
    // meaningful during cluster warm-up.
    ready: bool,
}

/// The local load snapshot folded into the estimate before each emission.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadReading {
    /// Host busy load, if the window has filled.
    pub busy: Option<u64>,
    /// Host single load, if enough samples were seen.
    pub single: Option<u64>,
    /// Host data load. Always known.
    pub data: u64,
}

#[allow(clippy::as_conversions)]
fn to_f64(value: u64) -> f64 {
    value as f64
}

/// Push-sum accumulators of one host.
pub struct LoadEstimator {
    state: Mutex<EstimatorState>,
}

impl Default for LoadEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadEstimator {
    /// Creates an estimator with weight 1, so averages are locally defined
    /// from birth.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EstimatorState {
                single: 0.0,
                busy: 0.0,
                data: 0.0,
                weight: 1.0,
                single0: 0.0,
                busy0: 0.0,
                data0: 0.0,
                ready: false,
            }),
        }
    }

    fn fold(state: &mut EstimatorState, reading: &LoadReading) {
        if let Some(busy) = reading.busy {
            let now = to_f64(busy);
            state.busy += now - state.busy0;
            state.busy0 = now;
        }
        if let Some(single) = reading.single {
            let now = to_f64(single);
            state.single += now - state.single0;
            state.single0 = now;
        }
        let now = to_f64(reading.data);
        state.data += now - state.data0;
        state.data0 = now;
    }

    /// Folds the current local load, halves every accumulator and returns the
    /// halves to be carried by an outgoing payload. The host keeps an
    /// identical share, so the weight stays strictly positive.
    pub fn emit_half(&self, reading: &LoadReading) -> (f64, f64, f64, f64) {
        let mut state = self.state.lock().unwrap();
        Self::fold(&mut state, reading);
        state.single /= 2.0;
        state.busy /= 2.0;
        state.data /= 2.0;
        state.weight /= 2.0;
        debug_assert!(state.weight > 0.0);
        (state.single, state.busy, state.data, state.weight)
    }

    /// Folds the current local load into the numerators without emitting
    /// anything. Used to flush the running round before serialisation.
    pub fn fold_current(&self, reading: &LoadReading) {
        let mut state = self.state.lock().unwrap();
        Self::fold(&mut state, reading);
    }

    /// Credits a received payload into the accumulators.
    pub fn credit(&self, payload: &GossipPayload) {
        let mut state = self.state.lock().unwrap();
        state.single += payload.single_sum;
        state.busy += payload.busy_sum;
        state.data += payload.data_sum;
        state.weight += payload.weight;
        state.ready = true;
    }

    /// Estimated cluster averages, or `None` while no remote payload has been
    /// credited yet.
    pub fn averages(&self) -> Option<Averages> {
        let state = self.state.lock().unwrap();
        if !state.ready {
            return None;
        }
        debug_assert!(state.weight > 0.0);
        Some(Averages {
            busy: state.busy / state.weight,
            single: state.single / state.weight,
            data: state.data / state.weight,
        })
    }

    /// Current conservation weight.
    pub fn weight(&self) -> f64 {
        self.state.lock().unwrap().weight
    }

    /// Operator-driven reset: accumulators restart at `(0, 0, 0, 1)` and the
    /// estimator is no longer ready.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        *state = EstimatorState {
            single: 0.0,
            busy: 0.0,
            data: 0.0,
            weight: 1.0,
            single0: 0.0,
            busy0: 0.0,
            data0: 0.0,
            ready: false,
        };
    }

    /// Accumulators for persistence.
    pub fn snapshot(&self) -> GossipStateSnapshot {
        let state = self.state.lock().unwrap();
        GossipStateSnapshot {
            single: state.single,
            busy: state.busy,
            data: state.data,
            weight: state.weight,
        }
    }

    /// Restores persisted accumulators. The fold snapshot and readiness are
    /// reseeded, as the local load at save time is no longer representative.
    pub fn restore(&self, snapshot: GossipStateSnapshot) {
        let mut state = self.state.lock().unwrap();
        state.single = snapshot.single;
        state.busy = snapshot.busy;
        state.data = snapshot.data;
        state.weight = if snapshot.weight > 0.0 { snapshot.weight } else { 1.0 };
        state.single0 = 0.0;
        state.busy0 = 0.0;
        state.data0 = 0.0;
        state.ready = false;
    }
}

/// Middleware wrapping the inner dispatcher: attaches a fresh payload to
/// every outgoing request, credits the payload of every reply, and exposes
/// the same exchange for the receiving side of the host.
pub struct GossipLink {
    inner: Arc<dyn Dispatcher>,
    estimator: Arc<LoadEstimator>,
    directory: Arc<Mutex<PeerDirectory>>,
    loads: Arc<HostLoadTracker>,
    traffic: AtomicBool,
}

impl GossipLink {
    /// Wraps `inner` with the gossip exchange.
    pub fn new(
        inner: Arc<dyn Dispatcher>,
        estimator: Arc<LoadEstimator>,
        directory: Arc<Mutex<PeerDirectory>>,
        loads: Arc<HostLoadTracker>,
    ) -> Self {
        Self { inner, estimator, directory, loads, traffic: AtomicBool::new(false) }
    }

    /// Builds the payload for an outgoing envelope: fold local load, halve
    /// the accumulators, refresh the own directory entry.
    pub fn outgoing_payload(&self) -> GossipPayload {
        let reading = self.loads.reading();
        let (single_sum, busy_sum, data_sum, weight) = self.estimator.emit_half(&reading);
        let mut directory = self.directory.lock().unwrap();
        directory.refresh_own(self.loads.own_record());
        GossipPayload {
            single_sum,
            busy_sum,
            data_sum,
            weight,
            unloaded: directory.unloaded.snapshot(),
            loaded: directory.loaded.snapshot(),
        }
    }

    /// Credits a received payload and merges its peer lists.
    pub fn ingest(&self, payload: &GossipPayload) {
        self.traffic.store(true, Ordering::Relaxed);
        self.estimator.credit(payload);
        self.directory.lock().unwrap().merge_payload(payload);
        trace!(weight = self.estimator.weight(), "credited gossip payload");
    }

    /// Strips and credits the payload of an inbound request, if present.
    pub fn ingest_request(&self, envelope: &RequestEnvelope) {
        if let Some(payload) = &envelope.gossip {
            self.ingest(payload);
        }
    }

    /// Returns whether any payload was exchanged since the last call. The
    /// gossip tick is suppressed while this reports `true`.
    pub fn take_traffic(&self) -> bool {
        self.traffic.swap(false, Ordering::Relaxed)
    }
}

#[async_trait]
impl Dispatcher for GossipLink {
    fn endpoint(&self) -> NetworkEndpoint {
        self.inner.endpoint()
    }

    async fn request(
        &self,
        target: NetworkEndpoint,
        body: Request,
        _gossip: Option<GossipPayload>,
    ) -> Result<ReplyEnvelope, DispatchError> {
        let payload = self.outgoing_payload();
        self.traffic.store(true, Ordering::Relaxed);
        let reply = self.inner.request(target, body, Some(payload)).await?;
        if let Some(payload) = &reply.gossip {
            self.ingest(payload);
        }
        Ok(reply)
    }

    async fn broadcast(&self, body: Request) {
        self.inner.broadcast(body).await;
    }
}
