//! In-process transport used by tests and simulations.
//!
//! Requests are delivered by calling the target's [`RequestHandler`] on the
//! caller's task, so a whole cluster runs inside one tokio runtime. Message
//! drops are simulated in a repeatable manner: the verdict for a message is a
//! pure function of the fault seed, the sender, the target and the message
//! id, so a rerun of the same schedule drops the same messages while a resend
//! (new id) gets a fresh verdict.

#[cfg(test)]
#[path = "in_memory_test.rs"]
mod in_memory_test;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatcher::{DispatchError, Dispatcher, RequestHandler};
use crate::messages::{GossipPayload, ReplyEnvelope, Request, RequestEnvelope};
use crate::NetworkEndpoint;

/// Deterministic fault injection for the in-process network.
#[derive(Clone, Copy, Debug)]
pub struct FaultPlan {
    /// Seed mixed into every drop verdict.
    pub seed: u64,
    /// Probability of dropping a remote request, in `[0, 1]`.
    pub drop_probability: f64,
}

impl FaultPlan {
    /// Creates a fault plan. Panics outside `[0, 1]`.
    pub fn new(seed: u64, drop_probability: f64) -> Self {
        assert!((0.0..=1.0).contains(&drop_probability));
        Self { seed, drop_probability }
    }

    fn should_drop(&self, sender: NetworkEndpoint, target: NetworkEndpoint, msg_id: u64) -> bool {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        sender.hash(&mut hasher);
        target.hash(&mut hasher);
        msg_id.hash(&mut hasher);
        #[allow(clippy::as_conversions)]
        let prob = (hasher.finish() as f64) / (u64::MAX as f64);
        prob < self.drop_probability
    }
}

struct Shared {
    handlers: Mutex<HashMap<NetworkEndpoint, Arc<dyn RequestHandler>>>,
    faults: Mutex<Option<FaultPlan>>,
    reply_timeout: Duration,
}

/// An in-process cluster transport.
#[derive(Clone)]
pub struct InProcessNetwork {
    shared: Arc<Shared>,
}

impl InProcessNetwork {
    /// Creates a network whose requests time out after `reply_timeout`.
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                handlers: Mutex::new(HashMap::new()),
                faults: Mutex::new(None),
                reply_timeout,
            }),
        }
    }

    /// Returns a dispatcher sending on behalf of `endpoint`.
    pub fn dispatcher(&self, endpoint: NetworkEndpoint) -> Arc<InProcessDispatcher> {
        Arc::new(InProcessDispatcher {
            endpoint,
            shared: self.shared.clone(),
            next_msg_id: AtomicU64::new(1),
        })
    }

    /// Registers the handler answering for `endpoint`.
    pub fn attach(&self, endpoint: NetworkEndpoint, handler: Arc<dyn RequestHandler>) {
        self.shared.handlers.lock().unwrap().insert(endpoint, handler);
    }

    /// Removes the handler for `endpoint`, simulating a crashed host.
    pub fn detach(&self, endpoint: NetworkEndpoint) {
        self.shared.handlers.lock().unwrap().remove(&endpoint);
    }

    /// Installs (or clears) deterministic fault injection.
    pub fn set_faults(&self, faults: Option<FaultPlan>) {
        *self.shared.faults.lock().unwrap() = faults;
    }

    /// Every endpoint currently answering requests.
    pub fn endpoints(&self) -> Vec<NetworkEndpoint> {
        self.shared.handlers.lock().unwrap().keys().copied().collect()
    }
}

/// Dispatcher half of [`InProcessNetwork`], bound to one sender endpoint.
pub struct InProcessDispatcher {
    endpoint: NetworkEndpoint,
    shared: Arc<Shared>,
    next_msg_id: AtomicU64,
}

impl InProcessDispatcher {
    fn handler_for(&self, target: NetworkEndpoint) -> Option<Arc<dyn RequestHandler>> {
        self.shared.handlers.lock().unwrap().get(&target).cloned()
    }
}

#[async_trait]
impl Dispatcher for InProcessDispatcher {
    fn endpoint(&self) -> NetworkEndpoint {
        self.endpoint
    }

    async fn request(
        &self,
        target: NetworkEndpoint,
        body: Request,
        gossip: Option<GossipPayload>,
    ) -> Result<ReplyEnvelope, DispatchError> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let local = target == self.endpoint;
        if !local {
            let faults = *self.shared.faults.lock().unwrap();
            if let Some(plan) = faults {
                if plan.should_drop(self.endpoint, target, msg_id) {
                    debug!(%target, msg_id, "dropping request");
                    tokio::time::sleep(self.shared.reply_timeout).await;
                    return Err(DispatchError::Timeout(target));
                }
            }
        }
        let handler = self.handler_for(target).ok_or(DispatchError::Unreachable(target))?;
        let envelope = RequestEnvelope { msg_id, sender: self.endpoint, gossip, body };
        tokio::time::timeout(self.shared.reply_timeout, handler.handle(envelope))
            .await
            .map_err(|_| DispatchError::Timeout(target))
    }

    async fn broadcast(&self, body: Request) {
        let targets: Vec<NetworkEndpoint> =
            self.shared.handlers.lock().unwrap().keys().copied().collect();
        for target in targets {
            let _ = self.request(target, body.clone(), None).await;
        }
    }
}
