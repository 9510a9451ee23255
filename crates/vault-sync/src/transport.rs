//! Consumed transport abstractions.
//!
//! The relay (signaling) service and the direct peer transport are opaque
//! collaborators: the core drives them through these traits and receives
//! their happenings as [`TransportEvent`]s pumped into the orchestrator by
//! the host adapter. Nothing here talks to a network.

use async_trait::async_trait;
use thiserror::Error;

use crate::device::{SignalingServerConfig, StunServerConfig, TurnServerConfig};
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Lifecycle of a relay connection.
///
/// `Unavailable` and `Failed` are terminal for the attempt but count as
/// `Disconnected` when deciding whether a reconnect may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    Unavailable,
    Failed,
}

impl RelayStatus {
    /// True when a new connection attempt may start.
    pub fn is_reconnectable(self) -> bool {
        matches!(
            self,
            RelayStatus::Disconnected | RelayStatus::Unavailable | RelayStatus::Failed
        )
    }
}

/// Lifecycle of a peer transport.
///
/// `New` is the freshly-created, not-yet-negotiating state; a relay must
/// not be torn down while any of its devices still has a transport here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportStatus {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Entry point to the signaling relay service.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Open a connection to the given relay.
    async fn connect(
        &self,
        config: &SignalingServerConfig,
    ) -> Result<Box<dyn SignalingConnection>>;
}

/// An open relay connection, from which channels are subscribed.
#[async_trait]
pub trait SignalingConnection: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn SignalingChannel>>;
    async fn close(&self) -> Result<()>;
}

/// A subscribed relay channel: publish-only from the core's side; inbound
/// presence joins and payloads arrive through the orchestrator's pumps.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn publish(&self, event: &str, payload: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// STUN/TURN servers resolved for one connection attempt.
#[derive(Debug, Clone, Default)]
pub struct IceServers {
    pub stun: Vec<StunServerConfig>,
    pub turn: Vec<TurnServerConfig>,
}

/// Creates peer transports for connection attempts.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self, servers: &IceServers) -> Result<Box<dyn PeerTransport>>;
}

/// A direct peer transport plus its data channel.
///
/// Negotiation calls are single-shot asynchronous operations with no
/// partial results; candidate generation and state changes surface as
/// [`TransportEvent`]s.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn apply_remote_description(&self, description: &SessionDescription) -> Result<()>;
    async fn apply_remote_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    /// Send bytes over the data channel.
    async fn send(&self, data: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Externally-delivered transport happenings for one device.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The underlying connection changed state.
    StatusChanged(TransportStatus),
    /// A local NAT-traversal candidate was generated.
    LocalCandidate(IceCandidate),
    /// Local candidate generation finished (the final null-candidate
    /// signal).
    GatheringComplete,
    /// Bytes arrived on the data channel.
    Message(Vec<u8>),
    /// The data channel closed.
    ChannelClosed,
    /// The data channel reported an error.
    ChannelError(String),
}
