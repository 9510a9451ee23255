//! vault-sync: peer-to-peer synchronization core for credvault vaults.
//!
//! This crate keeps independently-edited, encrypted credential stores
//! convergent without a central server:
//! - Hash-chain diff engine over the credential set (pure, no I/O)
//! - Compact binary codec for the four sync protocol messages
//! - Reconciliation state machine deciding merge/commit/escalate
//! - Connection orchestrator negotiating a direct peer channel over a
//!   signaling relay
//! - Event registries decoupling consumers from connection lifecycle
//!
//! Storage, crypto and the relay/transport internals stay on the host
//! side, behind the `VaultHost`, `SignalingClient` and
//! `PeerTransportFactory` abstractions.

pub mod credential;
pub mod device;
pub mod diff;
pub mod events;
pub mod hash;
pub mod negotiation;
pub mod orchestrator;
pub mod protocol;
pub mod reconcile;
pub mod transport;
pub mod vault;

pub use credential::{Credential, CredentialKind, CredentialProps, CustomField, TotpSettings};
pub use device::{
    pair_channel_name, DeviceIdentity, LinkedDevice, SignalingServerConfig, StunServerConfig,
    SynchronizationConfig, TurnServerConfig,
};
pub use diff::{
    apply_diffs, credentials_as_diffs, diff_against, diffs_since_hash, ChangeKind, Diff,
    DiffApplication, DiffChange, DiffError, DiffsSince,
};
pub use events::{DeviceSyncEvent, SignalingEvent, SyncEventRegistry};
pub use hash::{credential_hash, credential_set_hash, EMPTY_SET_HASH};
pub use negotiation::{Negotiation, NegotiationAction, NegotiationEvent, NegotiationState};
pub use orchestrator::{OrchestratorError, SyncOrchestrator};
pub use protocol::{CodecError, Command, IceCandidate, SessionDescription, SignalPayload, SyncMessage};
pub use reconcile::{ReconcileError, Reconciler};
pub use transport::{
    IceServers, PeerTransport, PeerTransportFactory, RelayStatus, SignalingChannel,
    SignalingClient, SignalingConnection, TransportError, TransportEvent, TransportStatus,
};
pub use vault::{InMemoryVault, Vault, VaultError, VaultHost};
