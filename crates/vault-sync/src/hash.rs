//! Content hashing for credentials and credential sets.
//!
//! Digests are SHA-1 hex strings — fixed by the wire protocol, not a
//! security boundary (integrity checks happen on already-authenticated
//! channels). The per-credential digest concatenates a fixed, ordered
//! field list; the set digest concatenates the per-credential digests of
//! the id-sorted set and hashes the concatenation, so it is invariant
//! under reordering of the input.

use sha1::{Digest, Sha1};

use crate::credential::Credential;

/// Digest of the empty credential set (SHA-1 of the empty string).
pub const EMPTY_SET_HASH: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the content digest of one credential.
///
/// Field order: id, name, username, password, url, notes, tags, custom
/// fields (name then value), then the TOTP descriptor in
/// label/algorithm/digits/period/secret order. Absent optionals contribute
/// the empty string, so "never set" and "set to empty" hash identically.
/// `kind` and the timestamps are not content and are excluded.
pub fn credential_hash(credential: &Credential) -> String {
    let mut input = String::new();
    input.push_str(&credential.id);
    input.push_str(&credential.name);
    input.push_str(&credential.username);
    input.push_str(&credential.password);
    input.push_str(&credential.url);
    input.push_str(&credential.notes);
    for tag in &credential.tags {
        input.push_str(tag);
    }
    for field in &credential.custom_fields {
        input.push_str(&field.name);
        input.push_str(&field.value);
    }
    if let Some(totp) = &credential.totp {
        input.push_str(&totp.label);
        input.push_str(&totp.algorithm);
        input.push_str(&totp.digits.to_string());
        input.push_str(&totp.period.to_string());
        input.push_str(&totp.secret);
    }
    sha1_hex(&input)
}

/// Compute the digest of a whole credential set.
///
/// Sorts by id ascending internally, so callers may pass the set in any
/// order. Cached per-credential digests are used when present. The empty
/// set hashes to [`EMPTY_SET_HASH`].
pub fn credential_set_hash(credentials: &[Credential]) -> String {
    let mut sorted: Vec<&Credential> = credentials.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut concatenated = String::new();
    for credential in sorted {
        concatenated.push_str(&credential.content_hash());
    }
    sha1_hex(&concatenated)
}

impl Credential {
    /// The content digest, from cache when one is present.
    pub fn content_hash(&self) -> String {
        match &self.hash {
            Some(hash) => hash.clone(),
            None => credential_hash(self),
        }
    }

    /// Recompute and cache the content digest.
    pub fn refresh_hash(&mut self) -> &str {
        self.hash = Some(credential_hash(self));
        self.hash.as_deref().unwrap_or_default()
    }
}
