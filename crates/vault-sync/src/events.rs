//! Event broadcast registries.
//!
//! Two independent registries decouple the orchestrator from consumer
//! code: one keyed by relay-server id (any number of handlers, each
//! registration minting a fresh handler id) and one keyed by device id
//! (at most one handler, silently replaced). Broadcasts are synchronous,
//! fire-and-forget, in call order — and a no-op until a status has been
//! recorded for the key, which keeps spurious events from firing before
//! any connection attempt.
//!
//! The registry is an injected `Arc`, threaded through the orchestrator's
//! constructor; there is no global instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::diff::Diff;
use crate::protocol::SyncMessage;
use crate::transport::{RelayStatus, TransportStatus};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Status event for one relay server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEvent {
    pub server_id: String,
    pub status: RelayStatus,
}

/// Status and data events for one device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceSyncEvent {
    /// The peer transport changed state.
    TransportStatus { status: TransportStatus },
    /// The credential set was replaced by a committed reconciliation.
    CredentialsUpdated { count: usize },
    /// Reconciliation reached agreement with the peer.
    Synchronized { timestamp: u64 },
    /// Divergence needs a consumer-supplied resolution; `diffs` is the
    /// peer's full set re-expressed as Add diffs.
    ManualSyncNeeded { diffs: Vec<Diff> },
    /// A protocol error: the offending message plus a readable cause.
    SyncError { message: SyncMessage, cause: String },
}

type SignalingHandler = Arc<dyn Fn(&SignalingEvent) + Send + Sync>;
type DeviceHandler = Arc<dyn Fn(&DeviceSyncEvent) + Send + Sync>;

/// The two handler registries plus the status maps that gate broadcasts.
#[derive(Default)]
pub struct SyncEventRegistry {
    signaling: RwLock<HashMap<String, Vec<(String, SignalingHandler)>>>,
    relay_status: RwLock<HashMap<String, RelayStatus>>,
    device: RwLock<HashMap<String, DeviceHandler>>,
    device_status: RwLock<HashMap<String, TransportStatus>>,
}

impl SyncEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one relay server. Returns the fresh handler
    /// id used to remove it again.
    pub fn register_signaling_handler(
        &self,
        server_id: &str,
        handler: impl Fn(&SignalingEvent) + Send + Sync + 'static,
    ) -> String {
        let handler_id = uuid::Uuid::new_v4().to_string();
        self.signaling
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(server_id.to_string())
            .or_default()
            .push((handler_id.clone(), Arc::new(handler)));
        handler_id
    }

    /// Remove a relay-server handler. Returns whether it existed.
    pub fn remove_signaling_handler(&self, server_id: &str, handler_id: &str) -> bool {
        let mut registry = self.signaling.write().unwrap_or_else(|e| e.into_inner());
        match registry.get_mut(server_id) {
            Some(handlers) => {
                let before = handlers.len();
                handlers.retain(|(id, _)| id != handler_id);
                handlers.len() != before
            }
            None => false,
        }
    }

    /// Register the handler for one device, silently replacing any
    /// previous one.
    pub fn register_device_handler(
        &self,
        device_id: &str,
        handler: impl Fn(&DeviceSyncEvent) + Send + Sync + 'static,
    ) {
        self.device
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), Arc::new(handler));
    }

    /// Remove a device handler. Returns whether it existed.
    pub fn remove_device_handler(&self, device_id: &str) -> bool {
        self.device
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id)
            .is_some()
    }

    /// Record a relay status without broadcasting.
    pub fn record_relay_status(&self, server_id: &str, status: RelayStatus) {
        self.relay_status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server_id.to_string(), status);
    }

    /// Last recorded relay status, if any attempt has been made.
    pub fn relay_status(&self, server_id: &str) -> Option<RelayStatus> {
        self.relay_status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
            .copied()
    }

    /// Record a relay status and broadcast it to that server's handlers.
    pub fn publish_relay_status(&self, server_id: &str, status: RelayStatus) {
        self.record_relay_status(server_id, status);
        self.broadcast_signaling(
            server_id,
            &SignalingEvent {
                server_id: server_id.to_string(),
                status,
            },
        );
    }

    /// Broadcast to one relay server's handlers. No-op until a status has
    /// been recorded for that server.
    pub fn broadcast_signaling(&self, server_id: &str, event: &SignalingEvent) {
        if self.relay_status(server_id).is_none() {
            return;
        }
        // Clone the handler list so a handler may re-register without
        // deadlocking the registry.
        let handlers: Vec<SignalingHandler> = self
            .signaling
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }

    /// Record a transport status without broadcasting.
    pub fn record_transport_status(&self, device_id: &str, status: TransportStatus) {
        self.device_status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), status);
    }

    /// Last recorded transport status, if any attempt has been made.
    pub fn transport_status(&self, device_id: &str) -> Option<TransportStatus> {
        self.device_status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .copied()
    }

    /// Record a transport status and broadcast it to the device handler.
    pub fn publish_transport_status(&self, device_id: &str, status: TransportStatus) {
        self.record_transport_status(device_id, status);
        self.broadcast_device(device_id, &DeviceSyncEvent::TransportStatus { status });
    }

    /// Broadcast to one device's handler. No-op until a status has been
    /// recorded for that device.
    pub fn broadcast_device(&self, device_id: &str, event: &DeviceSyncEvent) {
        if self.transport_status(device_id).is_none() {
            return;
        }
        let handler = self
            .device
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Drop every handler and recorded status.
    pub fn clear(&self) {
        self.signaling
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.relay_status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.device
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.device_status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
