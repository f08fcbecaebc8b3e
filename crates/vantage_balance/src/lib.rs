#![warn(missing_docs)]
//! Autonomic load balancing for a distributed metric-space index.
//!
//! Each physical host serves a set of logical nodes, every node owning one
//! partition of a similarity-search index plus zero or more replicas on
//! other hosts. Hosts continuously estimate the cluster-wide average busy,
//! single and data loads through a push-sum gossip protocol, and move,
//! split, leave, replicate or unify nodes to keep every host near the
//! average.
//!
//! The fabric is an active component: it generates its own periodic events
//! (balancing tick, gossip tick) in addition to answering the protocol
//! messages of its peers. It reaches the rest of the system through two
//! seams: the [`Dispatcher`](vantage_dispatch::Dispatcher) for transport and
//! the [`StorageEngine`](node::StorageEngine) for everything inside a node.

pub mod actions;
pub mod clock;
pub mod config;
pub mod decision;
pub mod gossip;
pub mod host;
pub mod host_list;
pub mod load;
pub mod node;

mod metrics;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConfigError, FabricConfig};
pub use host::{Host, HostSnapshot};

/// Top-level failures of the balancing fabric. Only configuration errors are
/// fatal; everything else is transient and retried on a later tick.
#[derive(thiserror::Error, Debug)]
pub enum BalanceError {
    /// The configuration cannot be used; the host refuses to start.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// A storage engine call failed.
    #[error(transparent)]
    Engine(#[from] node::EngineError),
    /// The transport failed.
    #[error(transparent)]
    Dispatch(#[from] vantage_dispatch::DispatchError),
    /// Host state could not be encoded or decoded.
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    /// A peer rejected an operation.
    #[error("operation rejected: {0}")]
    Rejected(String),
}
