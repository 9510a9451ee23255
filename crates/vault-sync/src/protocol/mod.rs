//! Wire protocol: the binary sync-message codec exchanged over the peer
//! channel, and the JSON signaling payloads carried by the relay during
//! transport negotiation.

pub mod message;
pub mod signal;

pub use message::{CodecError, Command, SyncMessage};
pub use signal::{IceCandidate, SessionDescription, SignalPayload, SIGNAL_EVENT};
