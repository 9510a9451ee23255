//! The diff log: append-only, hash-checkpointed changes to the credential set.
//!
//! Every entry pairs a single change with the digest of the **entire**
//! credential set after that change, making each entry a content-addressed
//! checkpoint. Replaying a log from a consistent starting set reproduces a
//! set whose digest equals the final entry's hash — the invariant the
//! reconciliation protocol is built on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credential::{Credential, CredentialProps};
use crate::hash::credential_set_hash;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    /// Update for an id the working set does not contain. Signals a
    /// corrupted or out-of-order diff log.
    #[error("update targets unknown credential: {0}")]
    UnknownUpdateTarget(String),
    /// Delete for an id the working set does not contain.
    #[error("delete targets unknown credential: {0}")]
    UnknownDeleteTarget(String),
    /// Add diff without a credential snapshot in its props.
    #[error("add diff for {0} carries no credential props")]
    MissingProps(String),
}

pub type Result<T> = std::result::Result<T, DiffError>;

/// What a diff does to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

/// A single change to the credential set.
///
/// Add carries a full snapshot in `props`, Update a sparse patch, Delete
/// only the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffChange {
    pub kind: ChangeKind,
    pub id: String,
    pub props: Option<CredentialProps>,
}

impl DiffChange {
    pub fn add(credential: &Credential) -> Self {
        Self {
            kind: ChangeKind::Add,
            id: credential.id.clone(),
            props: Some(credential.to_props()),
        }
    }

    pub fn update(id: impl Into<String>, props: CredentialProps) -> Self {
        Self {
            kind: ChangeKind::Update,
            id: id.into(),
            props: Some(props),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            id: id.into(),
            props: None,
        }
    }
}

/// One entry of the diff log: a change plus the full-set digest after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub hash: String,
    pub change: DiffChange,
}

/// Compute the Update change that turns `prev` into `next`.
///
/// Only fields that actually differ are marked dirty, so an unchanged
/// empty field is never overwritten on replay. The credential kind is
/// intentionally never diffed.
pub fn diff_against(prev: &Credential, next: &Credential) -> DiffChange {
    let mut props = CredentialProps::default();
    if prev.name != next.name {
        props.name = Some(next.name.clone());
    }
    if prev.username != next.username {
        props.username = Some(next.username.clone());
    }
    if prev.password != next.password {
        props.password = Some(next.password.clone());
    }
    if prev.url != next.url {
        props.url = Some(next.url.clone());
    }
    if prev.notes != next.notes {
        props.notes = Some(next.notes.clone());
    }
    if prev.tags != next.tags {
        props.tags = Some(next.tags.clone());
    }
    if prev.totp != next.totp {
        props.totp = Some(next.totp.clone());
    }
    if prev.custom_fields != next.custom_fields {
        props.custom_fields = Some(next.custom_fields.clone());
    }
    if prev.created != next.created {
        props.created = Some(next.created);
    }
    if prev.modified != next.modified {
        props.modified = Some(next.modified);
    }
    if prev.password_changed != next.password_changed {
        props.password_changed = Some(next.password_changed);
    }
    DiffChange::update(&next.id, props)
}

/// Result of a batch replay: the new set and the canonical re-derivation
/// of the applied diffs.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffApplication {
    pub credentials: Vec<Credential>,
    pub diffs: Vec<Diff>,
}

impl DiffApplication {
    /// Digest of the set after the last applied change.
    pub fn final_hash(&self) -> String {
        credential_set_hash(&self.credentials)
    }
}

/// Replay a batch of diffs against a copy of `credentials`.
///
/// All-or-nothing: the first bad entry aborts the whole batch and the
/// caller's set is untouched. Every applied change is re-checkpointed
/// against the recomputed full-set digest, so the returned diffs are the
/// canonical re-derivation, not an echo of the input.
///
/// Add on an id that already exists replaces the stored credential, which
/// lets a full-set re-send (manual sync) converge on a non-empty store.
pub fn apply_diffs(credentials: &[Credential], diffs: &[Diff]) -> Result<DiffApplication> {
    let mut working: Vec<Credential> = credentials.to_vec();
    let mut applied: Vec<Diff> = Vec::with_capacity(diffs.len());

    for diff in diffs {
        let change = &diff.change;
        match change.kind {
            ChangeKind::Add => {
                let props = change
                    .props
                    .as_ref()
                    .ok_or_else(|| DiffError::MissingProps(change.id.clone()))?;
                let mut credential = Credential::from_props(&change.id, props);
                credential.refresh_hash();
                match working.iter().position(|c| c.id == change.id) {
                    Some(index) => working[index] = credential,
                    None => working.push(credential),
                }
            }
            ChangeKind::Update => {
                let index = working
                    .iter()
                    .position(|c| c.id == change.id)
                    .ok_or_else(|| DiffError::UnknownUpdateTarget(change.id.clone()))?;
                if let Some(props) = &change.props {
                    working[index].apply_props(props);
                }
                working[index].refresh_hash();
            }
            ChangeKind::Delete => {
                let index = working
                    .iter()
                    .position(|c| c.id == change.id)
                    .ok_or_else(|| DiffError::UnknownDeleteTarget(change.id.clone()))?;
                working.remove(index);
            }
        }

        applied.push(Diff {
            hash: credential_set_hash(&working),
            change: change.clone(),
        });
    }

    Ok(DiffApplication {
        credentials: working,
        diffs: applied,
    })
}

/// Result of looking a hash up in the diff log.
///
/// The legacy protocol collapsed `FoundAtTail` and `NotFound` into one
/// empty list; keeping them distinct lets the reconciler tell "nothing to
/// send" apart from "cannot explain the peer's hash".
#[derive(Debug, Clone, PartialEq)]
pub enum DiffsSince {
    /// The hash was found and entries exist after it.
    Found(Vec<Diff>),
    /// The hash is the newest entry: nothing to send.
    FoundAtTail,
    /// The hash appears nowhere in the log.
    NotFound,
}

impl DiffsSince {
    /// Collapse to the legacy empty-list behavior.
    pub fn into_diffs(self) -> Vec<Diff> {
        match self {
            DiffsSince::Found(diffs) => diffs,
            DiffsSince::FoundAtTail | DiffsSince::NotFound => Vec::new(),
        }
    }
}

/// Find every log entry strictly after the first entry with the given hash.
pub fn diffs_since_hash(hash: &str, log: &[Diff]) -> DiffsSince {
    match log.iter().position(|d| d.hash == hash) {
        Some(index) if index + 1 == log.len() => DiffsSince::FoundAtTail,
        Some(index) => DiffsSince::Found(log[index + 1..].to_vec()),
        None => DiffsSince::NotFound,
    }
}

/// Re-express a whole credential set as Add diffs.
///
/// The deterministic "full re-send" used for initial and manual sync:
/// credentials sorted by id, each checkpointed against the cumulative
/// digest of everything added so far.
pub fn credentials_as_diffs(credentials: &[Credential]) -> Vec<Diff> {
    let mut sorted: Vec<Credential> = credentials.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut working: Vec<Credential> = Vec::with_capacity(sorted.len());
    let mut diffs = Vec::with_capacity(sorted.len());
    for mut credential in sorted {
        credential.refresh_hash();
        let change = DiffChange::add(&credential);
        working.push(credential);
        diffs.push(Diff {
            hash: credential_set_hash(&working),
            change,
        });
    }
    diffs
}
