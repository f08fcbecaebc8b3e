//! Wire model: request and reply kinds with stable integer codes.
//!
//! Payloads are serde structs; the integer code plus a length-prefixed payload
//! is all an external codec needs, so no type information beyond the code tag
//! ever crosses the wire.

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::{NetworkEndpoint, NodeId};

/// One peer's load snapshot as diffused through gossip.
///
/// Equality of directory entries is by endpoint alone; `timestamp` is a
/// freshness counter minted by the endpoint the record describes, so
/// comparing timestamps of two records for the same endpoint is meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The described host.
    pub endpoint: NetworkEndpoint,
    /// Time-windowed busy load; `None` while the window has not yet filled.
    pub busy: Option<u64>,
    /// Mean cost of the last N operations; `None` until N samples were seen.
    pub single: Option<u64>,
    /// Object count held by the host. Always known.
    pub data: u64,
    /// Freshness counter minted by `endpoint`.
    pub timestamp: u64,
}

/// Push-sum gossip payload. Rides along every request and reply envelope.
///
/// The three numerators share one conservation weight; the sender keeps an
/// identical half of its accumulators when it emits a payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipPayload {
    /// Half of the sender's single-load (processing) numerator.
    pub single_sum: f64,
    /// Half of the sender's busy-load numerator.
    pub busy_sum: f64,
    /// Half of the sender's data-load numerator.
    pub data_sum: f64,
    /// Half of the sender's conservation weight.
    pub weight: f64,
    /// Sender's least-loaded peer directory.
    pub unloaded: Vec<PeerRecord>,
    /// Sender's most-loaded peer directory.
    pub loaded: Vec<PeerRecord>,
}

/// A new host announcing itself to a known peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    /// Current load snapshot of the announcing host.
    pub load: PeerRecord,
}

/// Reservation handshake probing the target's suitability for an inbound
/// balancing action.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuitableHostRequest {
    /// The target must currently hold no data at all.
    pub fresh_requested: bool,
    /// The target must currently be at or under the average busy load.
    pub check_under_avg: bool,
    /// Busy load the planned action would add to the target.
    pub added_busy: u64,
    /// Single load the planned action would add to the target.
    pub added_single: u64,
    /// Releases a reservation previously taken by this sender.
    pub cancel: bool,
    /// When probing replica removal: the replica node the sender would remove.
    pub replica: Option<NodeId>,
}

impl SuitableHostRequest {
    /// A plain reservation probe with projected added loads.
    pub fn with_added(added_busy: u64, added_single: u64) -> Self {
        Self {
            fresh_requested: false,
            check_under_avg: false,
            added_busy,
            added_single,
            cancel: false,
            replica: None,
        }
    }

    /// The cancel variant clearing the sender's reservation.
    pub fn cancel() -> Self {
        Self {
            fresh_requested: false,
            check_under_avg: false,
            added_busy: 0,
            added_single: 0,
            cancel: true,
            replica: None,
        }
    }
}

/// An underloaded host offering to take work from a loaded one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalancingOfferRequest {
    /// If set, the receiver is asked to delete exactly this node (its data
    /// merges into a neighbour held by the sender).
    pub node_to_delete: Option<NodeId>,
    /// Load snapshot of the offering host.
    pub sender_load: PeerRecord,
}

/// Creates a primary node on the target after a remote split.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    /// Factory registry tag of the node implementation.
    pub node_type: String,
    /// Structured constructor parameters produced by the split.
    pub params: serde_json::Value,
    /// Endpoints that held replicas of the split node; the new primary
    /// silently replicates onto them to preserve the replication factor.
    pub replication_peers: Vec<NetworkEndpoint>,
}

/// Moves a serialised node onto the target host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrateRequest {
    /// Id the node had on the source host.
    pub orig_id: NodeId,
    /// Factory registry tag of the node implementation.
    pub node_type: String,
    /// Serialised storage state of the node.
    pub snapshot: Vec<u8>,
    /// Replica endpoints and ids to notify once the node is restarted.
    pub replicas: Vec<(NetworkEndpoint, NodeId)>,
}

/// Creates a replica of a primary on the target host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    /// The primary being replicated.
    pub primary: NodeId,
    /// Factory registry tag of the node implementation.
    pub node_type: String,
    /// Serialised storage state of the primary's partition.
    pub snapshot: Vec<u8>,
    /// Silent replications skip the reservation handshake (used during Split).
    pub silent: bool,
}

/// Removes a replica wrapper from its host.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifyRequest {
    /// The replica node to dispose of.
    pub replica: NodeId,
    /// Silent unifications skip the reservation check (used during Split).
    pub silent: bool,
}

/// Tells a replica host that its primary moved.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrateNotifyRequest {
    /// Id the primary had before migrating.
    pub orig_id: NodeId,
    /// Id the primary has now.
    pub new_id: NodeId,
}

/// Broadcast toggling periodic balancing and gossiping.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartStopRequest {
    /// `true` starts balancing, `false` stops it.
    pub start: bool,
    /// Additionally resets all meters, counters and gossip state.
    pub clear_stats: bool,
}

/// An operation addressed to a logical node (queries, inserts, …). The
/// payload is opaque to the fabric; the node's storage engine interprets it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeOperationRequest {
    /// The addressed node. `None` lets the receiving host pick any of its
    /// primaries (used when an empty host forwards operations to a peer).
    pub target: Option<NodeId>,
    /// Engine-interpreted operation payload.
    pub payload: Vec<u8>,
}

/// Request bodies. Each variant maps to a stable integer kind code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// A new host announcing itself. Code 1.
    Notify(NotifyRequest),
    /// Reservation handshake. Code 2.
    SuitableHost(SuitableHostRequest),
    /// Underloaded host offering to take work. Code 3.
    BalancingOffer(BalancingOfferRequest),
    /// Split completion: create the new primary. Code 4.
    CreateNode(CreateNodeRequest),
    /// Node migration. Code 5.
    Migrate(MigrateRequest),
    /// Replica creation. Code 6.
    Replicate(ReplicateRequest),
    /// Replica removal. Code 7.
    Unify(UnifyRequest),
    /// Primary moved; repoint replicas. Code 8.
    MigrateNotify(MigrateNotifyRequest),
    /// Toggle balancing cluster-wide. Code 9.
    StartStopBalancing(StartStopRequest),
    /// Operation addressed to a logical node. Code 10.
    NodeOperation(NodeOperationRequest),
}

/// Kind of a request, used for routing decisions, metric labels and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RequestKind {
    /// See [`Request::Notify`].
    Notify,
    /// See [`Request::SuitableHost`].
    SuitableHost,
    /// See [`Request::BalancingOffer`].
    BalancingOffer,
    /// See [`Request::CreateNode`].
    CreateNode,
    /// See [`Request::Migrate`].
    Migrate,
    /// See [`Request::Replicate`].
    Replicate,
    /// See [`Request::Unify`].
    Unify,
    /// See [`Request::MigrateNotify`].
    MigrateNotify,
    /// See [`Request::StartStopBalancing`].
    StartStopBalancing,
    /// See [`Request::NodeOperation`].
    NodeOperation,
}

impl Request {
    /// Stable integer code of this request kind.
    pub const fn code(&self) -> u16 {
        match self {
            Request::Notify(_) => 1,
            Request::SuitableHost(_) => 2,
            Request::BalancingOffer(_) => 3,
            Request::CreateNode(_) => 4,
            Request::Migrate(_) => 5,
            Request::Replicate(_) => 6,
            Request::Unify(_) => 7,
            Request::MigrateNotify(_) => 8,
            Request::StartStopBalancing(_) => 9,
            Request::NodeOperation(_) => 10,
        }
    }

    /// Kind tag of this request.
    pub const fn kind(&self) -> RequestKind {
        match self {
            Request::Notify(_) => RequestKind::Notify,
            Request::SuitableHost(_) => RequestKind::SuitableHost,
            Request::BalancingOffer(_) => RequestKind::BalancingOffer,
            Request::CreateNode(_) => RequestKind::CreateNode,
            Request::Migrate(_) => RequestKind::Migrate,
            Request::Replicate(_) => RequestKind::Replicate,
            Request::Unify(_) => RequestKind::Unify,
            Request::MigrateNotify(_) => RequestKind::MigrateNotify,
            Request::StartStopBalancing(_) => RequestKind::StartStopBalancing,
            Request::NodeOperation(_) => RequestKind::NodeOperation,
        }
    }
}

/// Why a request was refused at the protocol level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RefusalCode {
    /// The target's reservation slot is taken or its projected load is too
    /// high.
    NotSuitable,
    /// The sender does not hold the target's reservation.
    NotAsked,
    /// The receiver of a balancing offer declined to act on it.
    WontBalance,
}

/// Result of an operation executed at a logical node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OperationOutcome {
    /// The engine completed the operation; opaque result bytes.
    Completed(Vec<u8>),
    /// The addressed node was removed while the operation was in flight; the
    /// originating host should re-execute at a surviving node.
    NodeRemoved(NodeId),
    /// The engine rejected or failed the operation.
    Failed(String),
}

/// Reply bodies. Codes mirror the request table; refusals and the
/// node-does-not-exist reply have their own codes (20, 21).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Answer to [`Request::Notify`]: whether balancing is currently on.
    Notify {
        /// `true` when the answering host has periodic balancing enabled.
        balancing_on: bool,
    },
    /// Answer to [`Request::SuitableHost`].
    SuitableHost {
        /// `true` when the reservation was taken (or the cancel applied).
        ok: bool,
    },
    /// Answer to [`Request::BalancingOffer`].
    BalancingOffer {
        /// `true` when the receiver acted on the offer.
        accepted: bool,
    },
    /// Answer to [`Request::CreateNode`]: id of the node just created.
    CreateNode {
        /// Id issued by the target host.
        node_id: NodeId,
    },
    /// Answer to [`Request::Migrate`]: id the node runs under now.
    Migrate {
        /// Id issued by the target host.
        new_id: NodeId,
    },
    /// Answer to [`Request::Replicate`]: id of the new replica wrapper.
    Replicate {
        /// Id issued by the replica's host.
        replica_id: NodeId,
    },
    /// Plain acknowledgement (Unify, MigrateNotify, StartStopBalancing).
    Ack,
    /// Answer to [`Request::NodeOperation`].
    NodeOperation {
        /// What happened at the node.
        outcome: OperationOutcome,
    },
    /// The addressed node does not exist on the receiving host and no
    /// forwarding entry is known for it.
    NodeDoesntExist {
        /// The id nobody answers for.
        missing: NodeId,
    },
    /// Protocol-level refusal.
    Refused {
        /// Why the request was refused.
        code: RefusalCode,
    },
}

impl Reply {
    /// Stable integer code of this reply kind.
    pub const fn code(&self) -> u16 {
        match self {
            Reply::Notify { .. } => 1,
            Reply::SuitableHost { .. } => 2,
            Reply::BalancingOffer { .. } => 3,
            Reply::CreateNode { .. } => 4,
            Reply::Migrate { .. } => 5,
            Reply::Replicate { .. } => 6,
            Reply::Ack => 7,
            Reply::NodeOperation { .. } => 10,
            Reply::NodeDoesntExist { .. } => 20,
            Reply::Refused { .. } => 21,
        }
    }
}

/// A request on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Monotonically increasing id minted by the sender.
    pub msg_id: u64,
    /// Endpoint of the sending host.
    pub sender: NetworkEndpoint,
    /// Gossip payload riding along, if any.
    pub gossip: Option<GossipPayload>,
    /// The request body.
    pub body: Request,
}

/// A reply on the wire. `msg_id` matches the request it answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Id of the request this reply answers.
    pub msg_id: u64,
    /// Endpoint of the replying host.
    pub sender: NetworkEndpoint,
    /// Gossip payload riding along, if any.
    pub gossip: Option<GossipPayload>,
    /// The reply body.
    pub body: Reply,
}
