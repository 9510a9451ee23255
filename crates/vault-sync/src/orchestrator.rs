//! Connection orchestrator.
//!
//! One record per linked device tracks the relay it negotiates on, the
//! peer transport, the negotiation state machine and the status pair; all
//! transitions are methods on that record. Relay connections are shared
//! across devices and keyed by relay config id.
//!
//! Connecting runs in two phases: a relay channel (named so both sides
//! derive it independently) carries the offer/answer/candidate exchange,
//! and once the direct transport is up the channel subscription is
//! dropped — the relay is only needed for negotiation. Incoming relay and
//! transport happenings are pumped in by the host adapter through
//! `handle_presence_join` / `handle_signal` / `handle_transport_event`;
//! there is no internal polling loop.
//!
//! The orchestrator is an explicit object the host constructs and owns.
//! Nothing in this module is global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{pair_channel_name, LinkedDevice, SignalingServerConfig, StunServerConfig, SynchronizationConfig, TurnServerConfig};
use crate::diff::Diff;
use crate::events::SyncEventRegistry;
use crate::negotiation::{Negotiation, NegotiationAction, NegotiationEvent};
use crate::protocol::{CodecError, SessionDescription, SignalPayload, SyncMessage, SIGNAL_EVENT};
use crate::reconcile::{ReconcileError, Reconciler};
use crate::transport::{IceServers, PeerTransport, PeerTransportFactory, RelayStatus, SignalingChannel, SignalingClient, SignalingConnection, TransportError, TransportEvent, TransportStatus};
use crate::vault::VaultHost;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("device is not connected: {0}")]
    NotConnected(String),
    #[error("unknown signaling server config: {0}")]
    UnknownSignalingServer(String),
    #[error("unknown STUN server config: {0}")]
    UnknownStunServer(String),
    #[error("unknown TURN server config: {0}")]
    UnknownTurnServer(String),
    #[error("relay error: {0}")]
    Relay(TransportError),
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Per-device connection record.
struct DeviceConnection {
    device: LinkedDevice,
    relay_id: String,
    channel: Option<Box<dyn SignalingChannel>>,
    transport: Option<Box<dyn PeerTransport>>,
    negotiation: Negotiation,
    status: TransportStatus,
    timeout_task: Option<JoinHandle<()>>,
}

impl DeviceConnection {
    fn new(device: LinkedDevice, relay_id: String) -> Self {
        Self {
            device,
            relay_id,
            channel: None,
            transport: None,
            negotiation: Negotiation::new(),
            status: TransportStatus::New,
            timeout_task: None,
        }
    }

    /// Connect attempts are refused while the transport is live.
    fn is_busy(&self) -> bool {
        matches!(
            self.status,
            TransportStatus::Connecting | TransportStatus::Connected
        )
    }

    fn set_status(&mut self, events: &SyncEventRegistry, status: TransportStatus) {
        self.status = status;
        events.publish_transport_status(&self.device.id, status);
    }

    fn peer_transport(&self) -> Result<&dyn PeerTransport, TransportError> {
        self.transport
            .as_deref()
            .ok_or_else(|| TransportError::NegotiationFailed("no transport".into()))
    }

    async fn publish(&self, payload: &SignalPayload) -> Result<(), TransportError> {
        match &self.channel {
            Some(channel) => channel.publish(SIGNAL_EVENT, &payload.to_json()).await,
            None => Err(TransportError::PublishFailed(
                "no channel subscription".into(),
            )),
        }
    }

    async fn send_offer(&mut self, events: &SyncEventRegistry) -> Result<(), TransportError> {
        self.set_status(events, TransportStatus::Connecting);
        let offer = self.peer_transport()?.create_offer().await?;
        self.publish(&SignalPayload::Offer { description: offer }).await
    }

    async fn send_answer(
        &mut self,
        events: &SyncEventRegistry,
        remote: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.set_status(events, TransportStatus::Connecting);
        let transport = self.peer_transport()?;
        transport.apply_remote_description(remote).await?;
        let answer = transport.create_answer().await?;
        self.publish(&SignalPayload::Answer {
            description: answer,
        })
        .await
    }

    /// The channel is up: the relay subscription has served its purpose.
    async fn mark_open(&mut self, events: &SyncEventRegistry) {
        self.set_status(events, TransportStatus::Connected);
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
    }

    async fn fail(&mut self, events: &SyncEventRegistry) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
        self.set_status(events, TransportStatus::Failed);
    }

    async fn teardown(&mut self, events: &SyncEventRegistry) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            let _ = transport.close().await;
        }
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
        self.negotiation = Negotiation::new();
        self.set_status(events, TransportStatus::Disconnected);
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

/// Shared relay connection, keyed by relay config id.
struct RelayConnection {
    handle: Option<Box<dyn SignalingConnection>>,
    status: RelayStatus,
}

/// Drives connections to every linked device of one vault.
pub struct SyncOrchestrator {
    host: Arc<dyn VaultHost>,
    signaling: Arc<dyn SignalingClient>,
    transports: Arc<dyn PeerTransportFactory>,
    events: Arc<SyncEventRegistry>,
    reconciler: Reconciler,
    connections: Mutex<HashMap<String, DeviceConnection>>,
    relays: Mutex<HashMap<String, RelayConnection>>,
}

impl SyncOrchestrator {
    pub fn new(
        host: Arc<dyn VaultHost>,
        signaling: Arc<dyn SignalingClient>,
        transports: Arc<dyn PeerTransportFactory>,
        events: Arc<SyncEventRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler: Reconciler::new(host.clone(), events.clone()),
            host,
            signaling,
            transports,
            events,
            connections: Mutex::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
        })
    }

    /// Start a connection attempt to a linked device.
    ///
    /// Idempotent while a transport for the device is already connecting
    /// or connected. Configuration errors (unknown server config ids)
    /// abort before any I/O and are not retried.
    pub async fn connect_device(
        self: &Arc<Self>,
        device: &LinkedDevice,
    ) -> Result<(), OrchestratorError> {
        {
            let connections = self.connections.lock().await;
            if let Some(existing) = connections.get(&device.id) {
                if existing.is_busy() {
                    debug!(device_id = %device.id, "connect refused: transport already live");
                    return Ok(());
                }
            }
        }

        let config = self.host.get_synchronization_config();

        let relay_config = match device.signaling_server_ids.first() {
            Some(id) => match config.find_signaling_server(id) {
                Some(server) => server.clone(),
                None => {
                    self.events
                        .publish_transport_status(&device.id, TransportStatus::Failed);
                    return Err(OrchestratorError::UnknownSignalingServer(id.clone()));
                }
            },
            None => SignalingServerConfig::online_services(),
        };

        let ice = match resolve_ice_servers(&config, device) {
            Ok(ice) => ice,
            Err(e) => {
                self.events
                    .publish_transport_status(&device.id, TransportStatus::Failed);
                return Err(e);
            }
        };

        self.ensure_relay(&relay_config).await?;

        let channel_name = pair_channel_name(
            &config.local_device.id,
            config.local_device.created,
            &device.id,
            device.created,
        );
        let channel = {
            let relays = self.relays.lock().await;
            let handle = relays
                .get(&relay_config.id)
                .and_then(|relay| relay.handle.as_ref())
                .ok_or_else(|| {
                    OrchestratorError::Relay(TransportError::ConnectionFailed(
                        "relay connection lost".into(),
                    ))
                })?;
            handle.subscribe(&channel_name).await.map_err(|e| {
                self.events
                    .publish_relay_status(&relay_config.id, RelayStatus::Failed);
                OrchestratorError::Relay(e)
            })?
        };

        let transport = self.transports.create(&ice).await.map_err(|e| {
            self.events
                .publish_transport_status(&device.id, TransportStatus::Failed);
            OrchestratorError::Transport(e)
        })?;

        let mut connection = DeviceConnection::new(device.clone(), relay_config.id.clone());
        connection.channel = Some(channel);
        connection.transport = Some(transport);

        let mut connections = self.connections.lock().await;
        connections.insert(device.id.clone(), connection);
        self.events
            .publish_transport_status(&device.id, TransportStatus::New);
        info!(device_id = %device.id, channel = %channel_name, "connection attempt started");
        Ok(())
    }

    /// Open the relay connection if no live one exists for this config.
    async fn ensure_relay(
        &self,
        config: &SignalingServerConfig,
    ) -> Result<(), OrchestratorError> {
        let mut relays = self.relays.lock().await;
        let entry = relays.entry(config.id.clone()).or_insert(RelayConnection {
            handle: None,
            status: RelayStatus::Disconnected,
        });
        if !entry.status.is_reconnectable() {
            return Ok(());
        }

        entry.status = RelayStatus::Connecting;
        self.events
            .publish_relay_status(&config.id, RelayStatus::Connecting);

        match self.signaling.connect(config).await {
            Ok(handle) => {
                entry.handle = Some(handle);
                entry.status = RelayStatus::Connected;
                self.events
                    .publish_relay_status(&config.id, RelayStatus::Connected);
                Ok(())
            }
            Err(e) => {
                entry.status = RelayStatus::Unavailable;
                self.events
                    .publish_relay_status(&config.id, RelayStatus::Unavailable);
                Err(OrchestratorError::Relay(e))
            }
        }
    }

    /// Close the device's transport and channel. The shared relay
    /// connection goes down with it only if no other device on the same
    /// relay still has a brand-new transport mid-negotiation.
    pub async fn disconnect_device(self: &Arc<Self>, device: &LinkedDevice) {
        let relay_id = {
            let mut connections = self.connections.lock().await;
            let Some(connection) = connections.get_mut(&device.id) else {
                return;
            };
            connection.teardown(&self.events).await;
            connection.relay_id.clone()
        };

        let relay_in_use = {
            let connections = self.connections.lock().await;
            connections.values().any(|c| {
                c.device.id != device.id
                    && c.relay_id == relay_id
                    && c.status == TransportStatus::New
            })
        };
        if relay_in_use {
            debug!(%relay_id, "relay kept: another device is mid-negotiation");
            return;
        }

        let mut relays = self.relays.lock().await;
        if let Some(relay) = relays.get_mut(&relay_id) {
            if let Some(handle) = relay.handle.take() {
                let _ = handle.close().await;
            }
            relay.status = RelayStatus::Disconnected;
            self.events
                .publish_relay_status(&relay_id, RelayStatus::Disconnected);
        }
    }

    /// Tear down every connection, relay and handler.
    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut connections = self.connections.lock().await;
            for connection in connections.values_mut() {
                connection.teardown(&self.events).await;
            }
            connections.clear();
        }
        {
            let mut relays = self.relays.lock().await;
            for relay in relays.values_mut() {
                if let Some(handle) = relay.handle.take() {
                    let _ = handle.close().await;
                }
            }
            relays.clear();
        }
        self.events.clear();
        info!("orchestrator shut down");
    }

    /// The peer joined the shared channel: the side that observes the
    /// join crafts the transport offer.
    pub async fn handle_presence_join(self: &Arc<Self>, device_id: &str) {
        self.feed_negotiation(device_id, NegotiationEvent::PresenceJoined)
            .await;
    }

    /// A signaling payload arrived on the device's channel.
    pub async fn handle_signal(self: &Arc<Self>, device_id: &str, payload: SignalPayload) {
        let event = match payload {
            SignalPayload::Offer { description } => NegotiationEvent::RemoteOffer(description),
            SignalPayload::Answer { description } => NegotiationEvent::RemoteAnswer(description),
            SignalPayload::IceCandidate { candidate } => {
                NegotiationEvent::RemoteCandidate(candidate)
            }
            SignalPayload::IceCompleted => NegotiationEvent::RemoteCandidatesComplete,
        };
        self.feed_negotiation(device_id, event).await;
    }

    /// A transport happening was delivered by the host adapter.
    pub async fn handle_transport_event(
        self: &Arc<Self>,
        device_id: &str,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::StatusChanged(TransportStatus::Connected) => {
                self.feed_negotiation(device_id, NegotiationEvent::ChannelOpened)
                    .await;
            }
            TransportEvent::StatusChanged(TransportStatus::Failed) => {
                self.feed_negotiation(
                    device_id,
                    NegotiationEvent::TransportFailed("transport reported failure".into()),
                )
                .await;
            }
            TransportEvent::StatusChanged(TransportStatus::Disconnected)
            | TransportEvent::ChannelClosed => {
                self.on_transport_closed(device_id).await;
            }
            TransportEvent::StatusChanged(status) => {
                let mut connections = self.connections.lock().await;
                if let Some(connection) = connections.get_mut(device_id) {
                    connection.set_status(&self.events, status);
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.feed_negotiation(device_id, NegotiationEvent::LocalCandidate(candidate))
                    .await;
            }
            TransportEvent::GatheringComplete => {
                self.feed_negotiation(device_id, NegotiationEvent::LocalGatheringComplete)
                    .await;
            }
            TransportEvent::Message(data) => {
                self.handle_channel_message(device_id, &data).await;
            }
            TransportEvent::ChannelError(reason) => {
                self.feed_negotiation(device_id, NegotiationEvent::TransportFailed(reason))
                    .await;
            }
        }
    }

    /// Bytes arrived on the data channel: decode, reconcile, reply.
    pub async fn handle_channel_message(self: &Arc<Self>, device_id: &str, data: &[u8]) {
        let message = match SyncMessage::decode(data) {
            Ok(message) => message,
            Err(CodecError::UnknownCommand(code)) => {
                warn!(device_id, code, "unknown sync command dropped");
                return;
            }
            Err(e) => {
                warn!(device_id, error = %e, "undecodable sync message dropped");
                return;
            }
        };

        let replies = self.reconciler.handle_message(device_id, message).await;
        for reply in replies {
            if let Err(e) = self.send_message(device_id, &reply).await {
                warn!(device_id, error = %e, "failed to send reconciliation reply");
                break;
            }
        }
    }

    /// Send a `SyncRequest` with the current local hash to a device.
    pub async fn transmit_sync_request(
        self: &Arc<Self>,
        device_id: &str,
    ) -> Result<(), OrchestratorError> {
        let message = self.reconciler.local_sync_request().await;
        self.send_message(device_id, &message).await
    }

    /// Apply a consumer-resolved diff list to the local vault. Returns the
    /// new set hash.
    pub async fn apply_manual_synchronization(
        self: &Arc<Self>,
        diffs: &[Diff],
    ) -> Result<String, OrchestratorError> {
        Ok(self.reconciler.apply_manual_synchronization(diffs).await?)
    }

    /// Send a consumer-resolved diff list to a device as a solve.
    pub async fn transmit_manual_sync_solve(
        self: &Arc<Self>,
        device_id: &str,
        diffs: Vec<Diff>,
    ) -> Result<(), OrchestratorError> {
        let message = self.reconciler.manual_sync_solve_message(diffs);
        self.send_message(device_id, &message).await
    }

    pub fn register_signaling_handler(
        &self,
        server_id: &str,
        handler: impl Fn(&crate::events::SignalingEvent) + Send + Sync + 'static,
    ) -> String {
        self.events.register_signaling_handler(server_id, handler)
    }

    pub fn remove_signaling_handler(&self, server_id: &str, handler_id: &str) -> bool {
        self.events.remove_signaling_handler(server_id, handler_id)
    }

    pub fn register_device_handler(
        &self,
        device_id: &str,
        handler: impl Fn(&crate::events::DeviceSyncEvent) + Send + Sync + 'static,
    ) {
        self.events.register_device_handler(device_id, handler)
    }

    pub fn remove_device_handler(&self, device_id: &str) -> bool {
        self.events.remove_device_handler(device_id)
    }

    /// Current transport status of a device's connection record.
    pub async fn device_status(&self, device_id: &str) -> Option<TransportStatus> {
        let connections = self.connections.lock().await;
        connections.get(device_id).map(|c| c.status)
    }

    async fn send_message(
        &self,
        device_id: &str,
        message: &SyncMessage,
    ) -> Result<(), OrchestratorError> {
        let bytes = message.encode()?;
        let connections = self.connections.lock().await;
        let connection = connections
            .get(device_id)
            .ok_or_else(|| OrchestratorError::NotConnected(device_id.to_string()))?;
        let transport = connection
            .transport
            .as_deref()
            .ok_or_else(|| OrchestratorError::NotConnected(device_id.to_string()))?;
        transport
            .send(&bytes)
            .await
            .map_err(OrchestratorError::Transport)
    }

    async fn feed_negotiation(self: &Arc<Self>, device_id: &str, event: NegotiationEvent) {
        let actions = {
            let mut connections = self.connections.lock().await;
            let Some(connection) = connections.get_mut(device_id) else {
                debug!(device_id, "negotiation event for unknown device dropped");
                return;
            };
            connection.negotiation.handle(event)
        };
        self.apply_actions(device_id, actions).await;
    }

    async fn apply_actions(self: &Arc<Self>, device_id: &str, actions: Vec<NegotiationAction>) {
        if actions.is_empty() {
            return;
        }

        let mut failure: Option<String> = None;
        let mut opened = false;
        {
            let mut connections = self.connections.lock().await;
            let Some(connection) = connections.get_mut(device_id) else {
                return;
            };
            for action in actions {
                let step: Result<(), TransportError> = match action {
                    NegotiationAction::SendOffer => connection.send_offer(&self.events).await,
                    NegotiationAction::SendAnswer(remote) => {
                        connection.send_answer(&self.events, &remote).await
                    }
                    NegotiationAction::ApplyRemoteAnswer(description) => {
                        match connection.peer_transport() {
                            Ok(transport) => transport.apply_remote_description(&description).await,
                            Err(e) => Err(e),
                        }
                    }
                    NegotiationAction::ApplyRemoteCandidate(candidate) => {
                        match connection.peer_transport() {
                            Ok(transport) => transport.apply_remote_candidate(&candidate).await,
                            Err(e) => Err(e),
                        }
                    }
                    NegotiationAction::PublishCandidate(candidate) => {
                        connection.publish(&SignalPayload::IceCandidate { candidate }).await
                    }
                    NegotiationAction::PublishCandidatesComplete => {
                        connection.publish(&SignalPayload::IceCompleted).await
                    }
                    NegotiationAction::MarkOpen => {
                        connection.mark_open(&self.events).await;
                        opened = true;
                        Ok(())
                    }
                    NegotiationAction::Fail(reason) => {
                        failure = Some(reason);
                        Ok(())
                    }
                };
                if let Err(e) = step {
                    failure = Some(e.to_string());
                    break;
                }
            }
            if failure.is_some() {
                connection.fail(&self.events).await;
            }
        }

        if let Some(reason) = failure {
            warn!(device_id, %reason, "negotiation failed");
            self.maybe_reconnect(device_id).await;
            return;
        }
        if opened {
            self.start_sync_timeout(device_id).await;
            self.send_initial_sync_request(device_id).await;
        }
    }

    async fn on_transport_closed(self: &Arc<Self>, device_id: &str) {
        {
            let mut connections = self.connections.lock().await;
            let Some(connection) = connections.get_mut(device_id) else {
                return;
            };
            if let Some(task) = connection.timeout_task.take() {
                task.abort();
            }
            if let Some(transport) = connection.transport.take() {
                let _ = transport.close().await;
            }
            connection.negotiation = Negotiation::new();
            connection.set_status(&self.events, TransportStatus::Disconnected);
        }
        self.maybe_reconnect(device_id).await;
    }

    async fn maybe_reconnect(self: &Arc<Self>, device_id: &str) {
        let device = {
            let connections = self.connections.lock().await;
            connections
                .get(device_id)
                .filter(|c| c.device.auto_connect)
                .map(|c| c.device.clone())
        };
        let Some(device) = device else {
            return;
        };
        info!(device_id, "auto-reconnecting");
        if let Err(e) = self.connect_device(&device).await {
            warn!(device_id, error = %e, "auto-reconnect failed");
        }
    }

    /// Devices with a sync timeout disconnect that long after the
    /// transport connects, independent of in-flight reconciliation.
    async fn start_sync_timeout(self: &Arc<Self>, device_id: &str) {
        let mut connections = self.connections.lock().await;
        let Some(connection) = connections.get_mut(device_id) else {
            return;
        };
        let Some(secs) = connection.device.sync_timeout_secs else {
            return;
        };
        if let Some(task) = connection.timeout_task.take() {
            task.abort();
        }
        let orchestrator = Arc::clone(self);
        let device = connection.device.clone();
        connection.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            debug!(device_id = %device.id, "sync timeout elapsed, disconnecting");
            orchestrator.disconnect_device(&device).await;
        }));
    }

    async fn send_initial_sync_request(self: &Arc<Self>, device_id: &str) {
        let message = self.reconciler.local_sync_request().await;
        if let Err(e) = self.send_message(device_id, &message).await {
            warn!(device_id, error = %e, "initial sync request failed");
        }
    }
}

fn resolve_ice_servers(
    config: &SynchronizationConfig,
    device: &LinkedDevice,
) -> Result<IceServers, OrchestratorError> {
    let mut stun = Vec::new();
    for id in &device.stun_server_ids {
        let server = config
            .find_stun_server(id)
            .ok_or_else(|| OrchestratorError::UnknownStunServer(id.clone()))?;
        stun.push(server.clone());
    }
    if stun.is_empty() {
        stun = StunServerConfig::defaults();
    }

    let mut turn = Vec::new();
    for id in &device.turn_server_ids {
        let server = config
            .find_turn_server(id)
            .ok_or_else(|| OrchestratorError::UnknownTurnServer(id.clone()))?;
        turn.push(server.clone());
    }
    if turn.is_empty() {
        turn = TurnServerConfig::defaults();
    }

    Ok(IceServers { stun, turn })
}
