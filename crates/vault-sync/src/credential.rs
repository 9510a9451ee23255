//! Credential data model.
//!
//! A `Credential` is one entry of the vault's credential set. The sync core
//! never owns the set — it borrows snapshots from the host (see
//! [`crate::vault::VaultHost`]) and hands back replacements — but it defines
//! the entry shape because the hash chain is computed over it.
//!
//! `CredentialProps` is the sparse patch used by Update diffs. Every field
//! is an `Option`: `None` means "not touched", `Some(value)` means "set to
//! value", including `Some(String::new())`. This is what keeps an
//! unchanged-but-empty field from being overwritten during replay.

use serde::{Deserialize, Serialize};

/// Entry class of a credential.
///
/// Intentionally never diffed: an entry keeps the kind it was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialKind {
    Login,
    Card,
    Identity,
    SecureNote,
}

impl Default for CredentialKind {
    fn default() -> Self {
        Self::Login
    }
}

/// TOTP descriptor attached to a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpSettings {
    pub label: String,
    pub algorithm: String,
    pub digits: u32,
    pub period: u32,
    pub secret: String,
}

/// A free-form extra field on a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomField {
    pub name: String,
    pub value: String,
}

/// One entry of the credential set.
///
/// `id` is unique within a vault and lexicographically sortable; the set
/// hash sorts by it. `hash` caches the content digest and is reset to
/// `None` by every mutation; [`Credential::content_hash`] recomputes it
/// lazily (see `crate::hash`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub kind: CredentialKind,
    pub name: String,
    pub username: String,
    pub password: String,
    pub url: String,
    pub notes: String,
    pub tags: Vec<String>,
    pub totp: Option<TotpSettings>,
    pub custom_fields: Vec<CustomField>,
    /// Creation time, ms since epoch.
    pub created: u64,
    /// Last modification time, ms since epoch.
    pub modified: u64,
    /// Last password change, ms since epoch.
    pub password_changed: u64,
    /// Cached content digest; `None` until computed or after a mutation.
    pub hash: Option<String>,
}

impl Credential {
    /// Create an empty credential with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: CredentialKind::default(),
            name: String::new(),
            username: String::new(),
            password: String::new(),
            url: String::new(),
            notes: String::new(),
            tags: Vec::new(),
            totp: None,
            custom_fields: Vec::new(),
            created: 0,
            modified: 0,
            password_changed: 0,
            hash: None,
        }
    }

    /// Apply a sparse patch in place. The cached digest is invalidated.
    pub fn apply_props(&mut self, props: &CredentialProps) {
        if let Some(kind) = props.kind {
            self.kind = kind;
        }
        if let Some(name) = &props.name {
            self.name = name.clone();
        }
        if let Some(username) = &props.username {
            self.username = username.clone();
        }
        if let Some(password) = &props.password {
            self.password = password.clone();
        }
        if let Some(url) = &props.url {
            self.url = url.clone();
        }
        if let Some(notes) = &props.notes {
            self.notes = notes.clone();
        }
        if let Some(tags) = &props.tags {
            self.tags = tags.clone();
        }
        if let Some(totp) = &props.totp {
            self.totp = totp.clone();
        }
        if let Some(fields) = &props.custom_fields {
            self.custom_fields = fields.clone();
        }
        if let Some(created) = props.created {
            self.created = created;
        }
        if let Some(modified) = props.modified {
            self.modified = modified;
        }
        if let Some(password_changed) = props.password_changed {
            self.password_changed = password_changed;
        }
        self.hash = None;
    }

    /// Build a credential from a full-snapshot patch (Add diffs).
    ///
    /// Fields the patch does not carry fall back to their empty defaults.
    pub fn from_props(id: impl Into<String>, props: &CredentialProps) -> Self {
        let mut credential = Self::new(id);
        credential.apply_props(props);
        credential
    }

    /// Express this credential as a full-snapshot patch.
    pub fn to_props(&self) -> CredentialProps {
        CredentialProps {
            kind: Some(self.kind),
            name: Some(self.name.clone()),
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            url: Some(self.url.clone()),
            notes: Some(self.notes.clone()),
            tags: Some(self.tags.clone()),
            totp: Some(self.totp.clone()),
            custom_fields: Some(self.custom_fields.clone()),
            created: Some(self.created),
            modified: Some(self.modified),
            password_changed: Some(self.password_changed),
        }
    }
}

/// Sparse patch over a credential's mutable fields.
///
/// `Option` is the per-field dirty flag. `totp` is doubly optional so that
/// "remove the TOTP descriptor" (`Some(None)`) stays distinct from "leave
/// it alone" (`None`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProps {
    pub kind: Option<CredentialKind>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub tags: Option<Vec<String>>,
    pub totp: Option<Option<TotpSettings>>,
    pub custom_fields: Option<Vec<CustomField>>,
    pub created: Option<u64>,
    pub modified: Option<u64>,
    pub password_changed: Option<u64>,
}

impl CredentialProps {
    /// True if no field is marked dirty.
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.name.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.url.is_none()
            && self.notes.is_none()
            && self.tags.is_none()
            && self.totp.is_none()
            && self.custom_fields.is_none()
            && self.created.is_none()
            && self.modified.is_none()
            && self.password_changed.is_none()
    }
}
