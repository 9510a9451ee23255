//! Binary codec for sync messages.
//!
//! Messages round-trip through bincode via a wire struct whose command is
//! a raw `u32`. Decoding maps known codes onto the closed [`Command`]
//! enum; an unrecognized code becomes [`CodecError::UnknownCommand`] so a
//! newer peer's traffic is rejected politely instead of crashing the
//! reconciler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diff::Diff;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The command code is not one of the four known variants.
    #[error("unknown command code: {0}")]
    UnknownCommand(u32),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// The four protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    SyncRequest,
    SyncResponse,
    ManualSyncDataRequest,
    ManualSyncSolve,
}

impl Command {
    /// Wire code for this command.
    pub fn code(self) -> u32 {
        match self {
            Command::SyncRequest => 0,
            Command::SyncResponse => 1,
            Command::ManualSyncDataRequest => 2,
            Command::ManualSyncSolve => 3,
        }
    }

    /// Map a wire code back onto the enum.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Command::SyncRequest),
            1 => Some(Command::SyncResponse),
            2 => Some(Command::ManualSyncDataRequest),
            3 => Some(Command::ManualSyncSolve),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::SyncRequest => "SyncRequest",
            Command::SyncResponse => "SyncResponse",
            Command::ManualSyncDataRequest => "ManualSyncDataRequest",
            Command::ManualSyncSolve => "ManualSyncSolve",
        };
        f.write_str(name)
    }
}

/// A protocol message exchanged over the peer channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Optional correlation token.
    pub id: Option<String>,
    pub command: Command,
    /// Sender's full-set digest, when the command carries one.
    pub hash: Option<String>,
    pub diffs: Vec<Diff>,
}

/// On-the-wire shape. `command` stays a raw integer here so unknown codes
/// survive deserialization and can be rejected with a typed error.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    id: Option<String>,
    command: u32,
    hash: Option<String>,
    diffs: Vec<Diff>,
}

impl SyncMessage {
    pub fn sync_request(hash: impl Into<String>) -> Self {
        Self {
            id: None,
            command: Command::SyncRequest,
            hash: Some(hash.into()),
            diffs: Vec::new(),
        }
    }

    pub fn sync_request_with_diffs(hash: impl Into<String>, diffs: Vec<Diff>) -> Self {
        Self {
            id: None,
            command: Command::SyncRequest,
            hash: Some(hash.into()),
            diffs,
        }
    }

    pub fn sync_response(hash: impl Into<String>, diffs: Vec<Diff>) -> Self {
        Self {
            id: None,
            command: Command::SyncResponse,
            hash: Some(hash.into()),
            diffs,
        }
    }

    /// The hash-less response that answers a manual-sync data request.
    pub fn manual_sync_data(diffs: Vec<Diff>) -> Self {
        Self {
            id: None,
            command: Command::SyncResponse,
            hash: None,
            diffs,
        }
    }

    pub fn manual_sync_data_request() -> Self {
        Self {
            id: None,
            command: Command::ManualSyncDataRequest,
            hash: None,
            diffs: Vec::new(),
        }
    }

    pub fn manual_sync_solve(hash: impl Into<String>, diffs: Vec<Diff>) -> Self {
        Self {
            id: None,
            command: Command::ManualSyncSolve,
            hash: Some(hash.into()),
            diffs,
        }
    }

    /// Encode to the compact binary form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = WireMessage {
            id: self.id.clone(),
            command: self.command.code(),
            hash: self.hash.clone(),
            diffs: self.diffs.clone(),
        };
        bincode::serialize(&wire).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode from the compact binary form.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let wire: WireMessage =
            bincode::deserialize(data).map_err(|e| CodecError::Decode(e.to_string()))?;
        let command =
            Command::from_code(wire.command).ok_or(CodecError::UnknownCommand(wire.command))?;
        Ok(Self {
            id: wire.id,
            command,
            hash: wire.hash,
            diffs: wire.diffs,
        })
    }
}
