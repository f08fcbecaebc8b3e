//! The dispatcher seam between the balancing fabric and the transport.

use async_trait::async_trait;

use crate::messages::{GossipPayload, ReplyEnvelope, Request, RequestEnvelope};
use crate::NetworkEndpoint;

/// Errors surfaced by a dispatcher. All of them are transient from the
/// fabric's point of view: the failed action is reverted and retried on a
/// later balancing tick.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// No host answers at the target endpoint.
    #[error("no host reachable at {0}")]
    Unreachable(NetworkEndpoint),
    /// The request was sent but no reply arrived within the reply timeout.
    #[error("timed out waiting for a reply from {0}")]
    Timeout(NetworkEndpoint),
}

/// Sends typed requests and matches replies to them by message id.
///
/// Implementations mint the message id and sender fields of the envelope; the
/// caller provides the body and an optional gossip payload to ride along.
/// Sending to the implementation's own endpoint takes a short-circuited local
/// path.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// The endpoint requests from this dispatcher are stamped with.
    fn endpoint(&self) -> NetworkEndpoint;

    /// Sends `body` to `target` and waits (bounded by the reply timeout) for
    /// the matching reply.
    async fn request(
        &self,
        target: NetworkEndpoint,
        body: Request,
        gossip: Option<GossipPayload>,
    ) -> Result<ReplyEnvelope, DispatchError>;

    /// Best-effort delivery of `body` to every known endpoint. Replies and
    /// per-target failures are discarded.
    async fn broadcast(&self, body: Request);
}

/// The receiving side of a host: invoked once per inbound request.
///
/// Handlers may be invoked concurrently and must not hold locks across their
/// own outgoing requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Processes one request and produces the reply envelope for it.
    async fn handle(&self, request: RequestEnvelope) -> ReplyEnvelope;
}
