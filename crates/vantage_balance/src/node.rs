//! Logical nodes and the storage-engine seam.
//!
//! A logical node owns a partition of the similarity-search index through an
//! external [`StorageEngine`]. The fabric never looks inside the engine; it
//! only needs counts, snapshots and the split/leave/migrate entry points.
//! Nodes are constructed through a registry of factories keyed by a type tag,
//! so a `CreateNode` message carries the tag plus a structured parameter
//! record instead of type information.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vantage_dispatch::{NetworkEndpoint, NodeId};

use crate::clock::Clock;
use crate::load::{BusyMeter, SingleMeter};

/// Failures inside or around a storage engine.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// A factory could not build an engine from its inputs.
    #[error("cannot build node: {0}")]
    Construction(String),
    /// The engine failed to serialise its state.
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    /// An addressed operation failed inside the engine.
    #[error("engine operation failed: {0}")]
    Operation(String),
    /// No factory is registered for the given node type tag.
    #[error("no factory registered for node type {0:?}")]
    UnknownNodeType(String),
}

/// Outcome of one engine operation.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationResult {
    /// Opaque result bytes handed back to the caller.
    pub output: Vec<u8>,
    /// Distance computations this operation cost; feeds the load meters.
    pub distance_computations: u64,
}

/// What a split produces: everything the target host needs to build the new
/// primary holding the departing half of the partition.
#[derive(Clone, Debug)]
pub struct SplitPlan {
    /// Factory tag of the node implementation.
    pub node_type: String,
    /// Structured constructor parameters.
    pub params: serde_json::Value,
}

/// The metric index engine inside a logical node. External to this crate;
/// implementations must be safe for concurrent reads during migration and
/// replication.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Exact number of objects held. Always known.
    fn object_count(&self) -> u64;

    /// Executes one addressed operation (query, insert, …).
    async fn execute(&self, payload: &[u8]) -> Result<OperationResult, EngineError>;

    /// Partitions the engine in two, keeping one half and returning the plan
    /// for the other. `Ok(None)` means the engine cannot split.
    async fn split(&self) -> Result<Option<SplitPlan>, EngineError>;

    /// Redistributes all data to the engine's chosen merge neighbour.
    async fn leave(&self) -> Result<(), EngineError>;

    /// Informs the engine that its node now runs under a new id.
    async fn migrate(&self, old: NodeId, new: NodeId) -> Result<(), EngineError>;

    /// Serialises the engine state for transport.
    async fn snapshot(&self) -> Result<Vec<u8>, EngineError>;

    /// The neighbour this engine would merge into on leave, if it knows one.
    fn merge_candidate(&self) -> Option<NodeId> {
        None
    }
}

/// Builds engines of one node type.
pub trait NodeFactory: Send + Sync {
    /// Builds a fresh engine from split parameters.
    fn create(&self, params: &serde_json::Value) -> Result<Arc<dyn StorageEngine>, EngineError>;

    /// Rebuilds an engine from a serialised snapshot.
    fn restore(&self, snapshot: &[u8]) -> Result<Arc<dyn StorageEngine>, EngineError>;
}

/// Registry mapping node type tags to factories.
#[derive(Default)]
pub struct NodeFactoryRegistry {
    factories: Mutex<HashMap<String, Arc<dyn NodeFactory>>>,
}

impl NodeFactoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `tag`, replacing any previous registration.
    pub fn register(&self, tag: impl Into<String>, factory: Arc<dyn NodeFactory>) {
        self.factories.lock().unwrap().insert(tag.into(), factory);
    }

    fn factory(&self, tag: &str) -> Result<Arc<dyn NodeFactory>, EngineError> {
        self.factories
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNodeType(tag.to_string()))
    }

    /// Builds an engine of type `tag` from split parameters.
    pub fn create(
        &self,
        tag: &str,
        params: &serde_json::Value,
    ) -> Result<Arc<dyn StorageEngine>, EngineError> {
        self.factory(tag)?.create(params)
    }

    /// Rebuilds an engine of type `tag` from a snapshot.
    pub fn restore(&self, tag: &str, snapshot: &[u8]) -> Result<Arc<dyn StorageEngine>, EngineError> {
        self.factory(tag)?.restore(snapshot)
    }
}

/// Role of a logical node. Replicas mirror a primary's partition and defer
/// all balancing decisions to it; a replica never holds replicas of its own.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeRole {
    /// A primary, knowing the exact set of endpoints hosting its replicas.
    Primary {
        /// Replica host endpoint to the replica node id issued there.
        replicas: BTreeMap<NetworkEndpoint, NodeId>,
    },
    /// A replica wrapper deferring to its primary.
    Replica {
        /// The replicated primary.
        primary: NodeId,
    },
}

/// Bookkeeping of a node's own outgoing operations. When the node is
/// removed, this moves into the host's deleted-dispatcher map so that late
/// replies still complete instead of producing a node-does-not-exist error.
#[derive(Debug, Default)]
pub struct OutstandingOps {
    pending: Mutex<HashSet<u64>>,
}

impl OutstandingOps {
    /// Records an outgoing operation under its ticket.
    pub fn register(&self, ticket: u64) {
        self.pending.lock().unwrap().insert(ticket);
    }

    /// Completes the operation with the given ticket. Returns whether the
    /// ticket was known.
    pub fn complete(&self, ticket: u64) -> bool {
        self.pending.lock().unwrap().remove(&ticket)
    }

    /// Number of operations still awaiting replies.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// A logical node: one partition of the index plus its load meters.
pub struct LogicalNode {
    id: NodeId,
    node_type: String,
    engine: Arc<dyn StorageEngine>,
    /// Time-windowed distance-computation sum.
    pub busy: BusyMeter,
    /// Mean cost of the last N operations.
    pub single: SingleMeter,
    /// Outgoing-operation bookkeeping; survives the node's removal.
    pub ops: Arc<OutstandingOps>,
    role: Mutex<NodeRole>,
}

impl LogicalNode {
    /// Creates a primary node with empty meters.
    pub fn new_primary(
        id: NodeId,
        node_type: impl Into<String>,
        engine: Arc<dyn StorageEngine>,
        clock: Arc<dyn Clock>,
        busy_window: Duration,
        single_samples: usize,
    ) -> Self {
        Self {
            id,
            node_type: node_type.into(),
            engine,
            busy: BusyMeter::new(clock, busy_window),
            single: SingleMeter::new(single_samples),
            ops: Arc::new(OutstandingOps::default()),
            role: Mutex::new(NodeRole::Primary { replicas: BTreeMap::new() }),
        }
    }

    /// Creates a replica wrapper for `primary`.
    pub fn new_replica(
        id: NodeId,
        node_type: impl Into<String>,
        engine: Arc<dyn StorageEngine>,
        primary: NodeId,
        clock: Arc<dyn Clock>,
        busy_window: Duration,
        single_samples: usize,
    ) -> Self {
        Self {
            id,
            node_type: node_type.into(),
            engine,
            busy: BusyMeter::new(clock, busy_window),
            single: SingleMeter::new(single_samples),
            ops: Arc::new(OutstandingOps::default()),
            role: Mutex::new(NodeRole::Replica { primary }),
        }
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Factory tag of the node implementation.
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// The storage engine behind this node.
    pub fn engine(&self) -> Arc<dyn StorageEngine> {
        self.engine.clone()
    }

    /// Whether this node is a primary.
    pub fn is_primary(&self) -> bool {
        matches!(*self.role.lock().unwrap(), NodeRole::Primary { .. })
    }

    /// The primary this replica mirrors, or `None` for a primary.
    pub fn primary(&self) -> Option<NodeId> {
        match *self.role.lock().unwrap() {
            NodeRole::Primary { .. } => None,
            NodeRole::Replica { primary } => Some(primary),
        }
    }

    /// Repoints a replica at its migrated primary. No-op on a primary.
    pub fn repoint_primary(&self, orig: NodeId, new: NodeId) {
        let mut role = self.role.lock().unwrap();
        if let NodeRole::Replica { primary } = &mut *role {
            if *primary == orig {
                *primary = new;
            }
        }
    }

    /// Replica endpoints and ids of this primary; empty for a replica.
    pub fn replicas(&self) -> Vec<(NetworkEndpoint, NodeId)> {
        match &*self.role.lock().unwrap() {
            NodeRole::Primary { replicas } => {
                replicas.iter().map(|(endpoint, id)| (*endpoint, *id)).collect()
            }
            NodeRole::Replica { .. } => Vec::new(),
        }
    }

    /// Records a replica of this primary at `endpoint`.
    pub fn add_replica(&self, endpoint: NetworkEndpoint, replica_id: NodeId) {
        if let NodeRole::Primary { replicas } = &mut *self.role.lock().unwrap() {
            replicas.insert(endpoint, replica_id);
        }
    }

    /// Forgets the replica at `endpoint`, returning its id if one was held.
    pub fn remove_replica(&self, endpoint: NetworkEndpoint) -> Option<NodeId> {
        match &mut *self.role.lock().unwrap() {
            NodeRole::Primary { replicas } => replicas.remove(&endpoint),
            NodeRole::Replica { .. } => None,
        }
    }

    /// Executes one addressed operation and feeds the meters with its cost.
    pub async fn execute(&self, payload: &[u8]) -> Result<OperationResult, EngineError> {
        let result = self.engine.execute(payload).await?;
        self.busy.add(result.distance_computations);
        self.single.add(result.distance_computations);
        Ok(result)
    }

    /// Resets both meters; used after balancing actions because the sampling
    /// windows are no longer representative.
    pub fn reset_meters(&self) {
        self.busy.reset();
        self.single.reset();
    }
}
