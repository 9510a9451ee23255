//! The reconciliation state machine.
//!
//! Brings two devices' diff logs to the same head hash. On receiving a
//! message the reconciler compares the sender's declared full-set hash
//! with the local one and decides which case applies:
//!
//! 1. Hashes equal — reply that we agree; both sides mark synchronized.
//! 2. The message carries diffs — test-apply them to a copy of the local
//!    set; commit only if the resulting digest matches the declared hash.
//! 3. Hashes differ, no diffs — look the sender's hash up in our log: if
//!    we can explain it, send everything after it (we are ahead);
//!    otherwise neither side can explain the other and reconciliation
//!    escalates to a manual data exchange.
//!
//! Replies are returned, not sent, so the whole machine is testable
//! without a transport. A per-vault mutex serializes reconciliation: the
//! credential set and diff log are one shared resource no matter how many
//! devices are connected.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::diff::{apply_diffs, credentials_as_diffs, diffs_since_hash, Diff, DiffApplication, DiffError, DiffsSince};
use crate::events::{now_millis, DeviceSyncEvent, SyncEventRegistry};
use crate::hash::{credential_set_hash, EMPTY_SET_HASH};
use crate::protocol::{Command, SyncMessage};
use crate::vault::{Vault, VaultError, VaultHost};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Per-vault reconciliation driver.
pub struct Reconciler {
    host: Arc<dyn VaultHost>,
    events: Arc<SyncEventRegistry>,
    /// At most one reconciliation touches the vault at a time.
    vault_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(host: Arc<dyn VaultHost>, events: Arc<SyncEventRegistry>) -> Self {
        Self {
            host,
            events,
            vault_lock: Mutex::new(()),
        }
    }

    /// Process one message from a peer and return the replies to send.
    ///
    /// Protocol errors never surface as `Err`: they become `SyncError`
    /// events and an empty reply list, per the error-handling design.
    pub async fn handle_message(&self, device_id: &str, message: SyncMessage) -> Vec<SyncMessage> {
        let _guard = self.vault_lock.lock().await;
        let vault = self.host.get_vault().await;
        let local_hash = credential_set_hash(&vault.credentials);
        debug!(
            device_id,
            command = %message.command,
            diffs = message.diffs.len(),
            "processing sync message"
        );

        match message.command {
            Command::SyncRequest => {
                self.on_sync_request(device_id, message, vault, local_hash).await
            }
            Command::SyncResponse => {
                self.on_sync_response(device_id, message, vault, local_hash).await
            }
            Command::ManualSyncDataRequest => {
                // Re-express the whole local set so the peer can surface a
                // manual resolution.
                vec![SyncMessage::manual_sync_data(credentials_as_diffs(
                    &vault.credentials,
                ))]
            }
            Command::ManualSyncSolve => {
                self.try_commit(device_id, &message, vault, "manual-sync-solve")
                    .await
            }
        }
    }

    async fn on_sync_request(
        &self,
        device_id: &str,
        message: SyncMessage,
        vault: Vault,
        local_hash: String,
    ) -> Vec<SyncMessage> {
        let Some(remote_hash) = message.hash.clone() else {
            warn!(device_id, "sync request without hash dropped");
            return Vec::new();
        };

        if remote_hash == local_hash {
            self.mark_synchronized(device_id);
            return vec![SyncMessage::sync_response(local_hash, Vec::new())];
        }

        if !message.diffs.is_empty() {
            return self.try_commit(device_id, &message, vault, "sync-request").await;
        }

        // The peer is behind us if its hash sits in our log; otherwise we
        // cannot determine the relationship and the peer must escalate.
        match diffs_since_hash(&remote_hash, &vault.diffs) {
            DiffsSince::Found(diffs) => vec![SyncMessage::sync_response(local_hash, diffs)],
            DiffsSince::FoundAtTail | DiffsSince::NotFound => {
                vec![SyncMessage::sync_response(local_hash, Vec::new())]
            }
        }
    }

    async fn on_sync_response(
        &self,
        device_id: &str,
        message: SyncMessage,
        vault: Vault,
        local_hash: String,
    ) -> Vec<SyncMessage> {
        let Some(remote_hash) = message.hash.clone() else {
            if message.diffs.is_empty() {
                warn!(device_id, "empty manual sync data dropped");
                return Vec::new();
            }
            // Answer to our manual-sync data request: surface it, never
            // merge automatically.
            self.events.broadcast_device(
                device_id,
                &DeviceSyncEvent::ManualSyncNeeded {
                    diffs: message.diffs.clone(),
                },
            );
            return Vec::new();
        };

        if remote_hash == local_hash {
            self.mark_synchronized(device_id);
            return Vec::new();
        }

        if !message.diffs.is_empty() {
            return self.try_commit(device_id, &message, vault, "sync-response").await;
        }

        match diffs_since_hash(&remote_hash, &vault.diffs) {
            // We are ahead: hand the peer everything after its hash.
            DiffsSince::Found(diffs) => {
                vec![SyncMessage::sync_request_with_diffs(local_hash, diffs)]
            }
            // Neither side can explain the other's hash — divergence.
            DiffsSince::FoundAtTail | DiffsSince::NotFound => {
                vec![SyncMessage::manual_sync_data_request()]
            }
        }
    }

    /// Test-apply the message's diffs against a copy of the current set;
    /// commit only when the result reproduces the declared hash.
    async fn try_commit(
        &self,
        device_id: &str,
        message: &SyncMessage,
        vault: Vault,
        error_tag: &str,
    ) -> Vec<SyncMessage> {
        let Some(declared) = message.hash.as_deref() else {
            self.protocol_error(device_id, message, format!("{error_tag}: message has no hash"));
            return Vec::new();
        };

        let applied = match apply_diffs(&vault.credentials, &message.diffs) {
            Ok(applied) => applied,
            Err(e) => {
                self.protocol_error(device_id, message, format!("{error_tag}: {e}"));
                return Vec::new();
            }
        };

        let result_hash = applied.final_hash();
        if result_hash != declared {
            self.protocol_error(
                device_id,
                message,
                format!(
                    "{error_tag}: hash mismatch after apply: declared {declared}, got {result_hash}"
                ),
            );
            return Vec::new();
        }

        match self.commit(device_id, vault, applied).await {
            Ok(new_hash) => vec![SyncMessage::sync_request(new_hash)],
            Err(e) => {
                self.protocol_error(device_id, message, format!("{error_tag}: {e}"));
                Vec::new()
            }
        }
    }

    /// Replace the credential set, extend the diff log, persist, notify.
    async fn commit(
        &self,
        device_id: &str,
        vault: Vault,
        applied: DiffApplication,
    ) -> Result<String, VaultError> {
        let new_hash = applied.final_hash();
        let mut log = vault.diffs;
        log.extend(applied.diffs.iter().cloned());

        let count = applied.credentials.len();
        self.host.update_credentials(applied.credentials.clone()).await;
        self.host.update_diffs(log.clone()).await;
        self.host
            .save_vault(Vault {
                credentials: applied.credentials,
                diffs: log,
            })
            .await?;

        self.events
            .broadcast_device(device_id, &DeviceSyncEvent::CredentialsUpdated { count });
        self.mark_synchronized(device_id);
        Ok(new_hash)
    }

    fn mark_synchronized(&self, device_id: &str) {
        self.events.broadcast_device(
            device_id,
            &DeviceSyncEvent::Synchronized {
                timestamp: now_millis(),
            },
        );
    }

    fn protocol_error(&self, device_id: &str, message: &SyncMessage, cause: String) {
        warn!(device_id, %cause, "reconciliation rejected message");
        self.events.broadcast_device(
            device_id,
            &DeviceSyncEvent::SyncError {
                message: message.clone(),
                cause,
            },
        );
    }

    /// A fresh `SyncRequest` carrying the current local hash.
    pub async fn local_sync_request(&self) -> SyncMessage {
        let credentials = self.host.get_credentials().await;
        SyncMessage::sync_request(credential_set_hash(&credentials))
    }

    /// Apply a consumer-resolved diff list to the local vault.
    ///
    /// This is the local half of manual resolution; the same diffs go to
    /// the peer via a `ManualSyncSolve` message. Returns the new set hash.
    pub async fn apply_manual_synchronization(
        &self,
        diffs: &[Diff],
    ) -> Result<String, ReconcileError> {
        let _guard = self.vault_lock.lock().await;
        let vault = self.host.get_vault().await;
        let applied = apply_diffs(&vault.credentials, diffs)?;
        let new_hash = applied.final_hash();

        let mut log = vault.diffs;
        log.extend(applied.diffs.iter().cloned());
        self.host.update_credentials(applied.credentials.clone()).await;
        self.host.update_diffs(log.clone()).await;
        self.host
            .save_vault(Vault {
                credentials: applied.credentials,
                diffs: log,
            })
            .await?;
        Ok(new_hash)
    }

    /// Build the `ManualSyncSolve` message for a resolved diff list.
    pub fn manual_sync_solve_message(&self, diffs: Vec<Diff>) -> SyncMessage {
        let hash = diffs
            .last()
            .map(|d| d.hash.clone())
            .unwrap_or_else(|| EMPTY_SET_HASH.to_string());
        SyncMessage::manual_sync_solve(hash, diffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::credential::Credential;
    use crate::device::{DeviceIdentity, SynchronizationConfig};
    use crate::diff::{diff_against, DiffChange};
    use crate::transport::TransportStatus;
    use crate::vault::InMemoryVault;

    const PEER: &str = "device-remote";

    fn config() -> SynchronizationConfig {
        SynchronizationConfig {
            local_device: DeviceIdentity {
                id: "device-local".into(),
                name: "Local".into(),
                created: 1,
            },
            devices: Vec::new(),
            signaling_servers: Vec::new(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        }
    }

    fn credential(id: &str, name: &str, password: &str) -> Credential {
        let mut c = Credential::new(id);
        c.name = name.into();
        c.password = password.into();
        c
    }

    fn three_credentials() -> Vec<Credential> {
        vec![
            credential("a", "Alpha", "pw-a"),
            credential("b", "Beta", "pw-b"),
            credential("c", "Gamma", "pw-c"),
        ]
    }

    /// Host + registry + reconciler wired together, with the device status
    /// recorded so broadcasts are deliverable, and all device events
    /// captured for assertions.
    fn harness(
        credentials: Vec<Credential>,
    ) -> (
        Arc<InMemoryVault>,
        Arc<SyncEventRegistry>,
        Reconciler,
        Arc<StdMutex<Vec<DeviceSyncEvent>>>,
    ) {
        let host = Arc::new(InMemoryVault::with_credentials(config(), credentials));
        let events = Arc::new(SyncEventRegistry::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.register_device_handler(PEER, move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        events.record_transport_status(PEER, TransportStatus::Connected);
        let reconciler = Reconciler::new(host.clone(), events.clone());
        (host, events, reconciler, seen)
    }

    fn synchronized_count(seen: &StdMutex<Vec<DeviceSyncEvent>>) -> usize {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, DeviceSyncEvent::Synchronized { .. }))
            .count()
    }

    fn error_causes(seen: &StdMutex<Vec<DeviceSyncEvent>>) -> Vec<String> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                DeviceSyncEvent::SyncError { cause, .. } => Some(cause.clone()),
                _ => None,
            })
            .collect()
    }

    // ==================== in sync ====================

    #[tokio::test]
    async fn test_matching_hashes_reply_in_sync() {
        let set = three_credentials();
        let local_hash = credential_set_hash(&set);
        let (_host, _events, reconciler, seen) = harness(set);

        let replies = reconciler
            .handle_message(PEER, SyncMessage::sync_request(local_hash.clone()))
            .await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::SyncResponse);
        assert_eq!(replies[0].hash.as_deref(), Some(local_hash.as_str()));
        assert!(replies[0].diffs.is_empty());
        assert_eq!(synchronized_count(&seen), 1);
    }

    #[tokio::test]
    async fn test_matching_response_marks_synchronized_without_reply() {
        let set = three_credentials();
        let local_hash = credential_set_hash(&set);
        let (_host, _events, reconciler, seen) = harness(set);

        let replies = reconciler
            .handle_message(PEER, SyncMessage::sync_response(local_hash, Vec::new()))
            .await;

        assert!(replies.is_empty());
        assert_eq!(synchronized_count(&seen), 1);
    }

    // ==================== ahead ====================

    #[tokio::test]
    async fn test_request_from_behind_peer_gets_tail_diffs() {
        // Local log: d1 (base), then d2 and d3 from two edits.
        let base = vec![credential("a", "Alpha", "pw-a")];
        let mut edited = base[0].clone();
        edited.password = "pw-rotated".into();
        let mut log = credentials_as_diffs(&base);
        let step2 = apply_diffs(&base, &[Diff {
            hash: String::new(),
            change: diff_against(&base[0], &edited),
        }])
        .unwrap();
        log.extend(step2.diffs.clone());
        let step3 = apply_diffs(&step2.credentials, &[Diff {
            hash: String::new(),
            change: DiffChange::add(&credential("b", "Beta", "pw-b")),
        }])
        .unwrap();
        log.extend(step3.diffs.clone());

        let local_hash = credential_set_hash(&step3.credentials);
        let (host, _events, reconciler, _seen) = harness(step3.credentials.clone());
        host.seed_diffs(log.clone());

        // Peer only knows the base checkpoint (d1)
        let replies = reconciler
            .handle_message(PEER, SyncMessage::sync_request(log[0].hash.clone()))
            .await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::SyncResponse);
        assert_eq!(replies[0].hash.as_deref(), Some(local_hash.as_str()));
        assert_eq!(replies[0].diffs, log[1..].to_vec());
    }

    #[tokio::test]
    async fn test_unexplainable_request_gets_empty_response() {
        let set = three_credentials();
        let (host, _events, reconciler, _seen) = harness(set.clone());
        host.seed_diffs(credentials_as_diffs(&set));

        let replies = reconciler
            .handle_message(PEER, SyncMessage::sync_request("unknown-hash"))
            .await;

        // We cannot determine the relationship — remote must escalate.
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::SyncResponse);
        assert!(replies[0].diffs.is_empty());
    }

    // ==================== behind: test-apply and commit ====================

    #[tokio::test]
    async fn test_response_with_diffs_commits_and_renotifies() {
        let base = three_credentials();
        let (host, _events, reconciler, seen) = harness(base.clone());
        host.seed_diffs(credentials_as_diffs(&base));
        let log_before = host.snapshot().diffs.len();

        // Peer is ahead by one delete
        let remote = apply_diffs(&base, &[Diff {
            hash: String::new(),
            change: DiffChange::delete("b"),
        }])
        .unwrap();
        let remote_hash = remote.final_hash();

        let replies = reconciler
            .handle_message(
                PEER,
                SyncMessage::sync_response(remote_hash.clone(), remote.diffs.clone()),
            )
            .await;

        // Commit happened
        let snapshot = host.snapshot();
        assert_eq!(snapshot.credentials.len(), 2);
        assert!(snapshot.credentials.iter().all(|c| c.id != "b"));
        assert_eq!(snapshot.diffs.len(), log_before + 1);
        assert_eq!(host.save_count(), 1);

        // Fresh SyncRequest lets the sender mark synchronized too
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::SyncRequest);
        assert_eq!(replies[0].hash.as_deref(), Some(remote_hash.as_str()));

        let events = seen.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, DeviceSyncEvent::CredentialsUpdated { count: 2 })));
        assert!(events
            .iter()
            .any(|e| matches!(e, DeviceSyncEvent::Synchronized { .. })));
    }

    #[tokio::test]
    async fn test_request_with_diffs_commits_too() {
        let base = three_credentials();
        let (host, _events, reconciler, _seen) = harness(base.clone());

        let remote = apply_diffs(&base, &[Diff {
            hash: String::new(),
            change: DiffChange::add(&credential("d", "Delta", "pw-d")),
        }])
        .unwrap();

        let replies = reconciler
            .handle_message(
                PEER,
                SyncMessage::sync_request_with_diffs(remote.final_hash(), remote.diffs.clone()),
            )
            .await;

        assert_eq!(host.snapshot().credentials.len(), 4);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::SyncRequest);
    }

    #[tokio::test]
    async fn test_declared_hash_mismatch_rejects_without_commit() {
        let base = three_credentials();
        let (host, _events, reconciler, seen) = harness(base.clone());

        let remote = apply_diffs(&base, &[Diff {
            hash: String::new(),
            change: DiffChange::delete("a"),
        }])
        .unwrap();

        let replies = reconciler
            .handle_message(
                PEER,
                SyncMessage::sync_response("not-the-real-hash", remote.diffs.clone()),
            )
            .await;

        assert!(replies.is_empty());
        assert_eq!(host.snapshot().credentials.len(), 3);
        assert_eq!(host.save_count(), 0);
        let causes = error_causes(&seen);
        assert_eq!(causes.len(), 1);
        assert!(causes[0].contains("sync-response"));
        assert!(causes[0].contains("hash mismatch"));
    }

    #[tokio::test]
    async fn test_corrupted_diff_log_rejects_whole_batch() {
        let base = three_credentials();
        let (host, _events, reconciler, seen) = harness(base.clone());

        let diffs = vec![Diff {
            hash: "whatever".into(),
            change: DiffChange::update("missing-id", Default::default()),
        }];

        let replies = reconciler
            .handle_message(PEER, SyncMessage::sync_request_with_diffs("whatever", diffs))
            .await;

        assert!(replies.is_empty());
        // Vault untouched after the failed call
        assert_eq!(host.snapshot().credentials, base);
        assert_eq!(host.save_count(), 0);
        assert!(error_causes(&seen)[0].contains("unknown credential"));
    }

    // ==================== divergence and manual sync ====================

    #[tokio::test]
    async fn test_divergent_response_escalates_to_manual_request() {
        let set = three_credentials();
        let (host, _events, reconciler, _seen) = harness(set.clone());
        host.seed_diffs(credentials_as_diffs(&set));

        let replies = reconciler
            .handle_message(
                PEER,
                SyncMessage::sync_response("hash-we-cannot-explain", Vec::new()),
            )
            .await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::ManualSyncDataRequest);
    }

    #[tokio::test]
    async fn test_manual_data_request_returns_full_set() {
        let set = three_credentials();
        let (_host, _events, reconciler, _seen) = harness(set.clone());

        let replies = reconciler
            .handle_message(PEER, SyncMessage::manual_sync_data_request())
            .await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::SyncResponse);
        assert!(replies[0].hash.is_none());
        assert_eq!(replies[0].diffs, credentials_as_diffs(&set));
    }

    #[tokio::test]
    async fn test_manual_data_is_surfaced_not_merged() {
        let local = three_credentials();
        let remote_set = vec![credential("z", "Zeta", "pw-z")];
        let (host, _events, reconciler, seen) = harness(local.clone());

        let replies = reconciler
            .handle_message(
                PEER,
                SyncMessage::manual_sync_data(credentials_as_diffs(&remote_set)),
            )
            .await;

        assert!(replies.is_empty());
        // No automatic merge
        assert_eq!(host.snapshot().credentials, local);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, DeviceSyncEvent::ManualSyncNeeded { diffs } if diffs.len() == 1)));
    }

    #[tokio::test]
    async fn test_manual_solve_commits_with_distinct_error_tag() {
        let local = vec![credential("a", "Alpha", "pw-a")];
        let (host, _events, reconciler, seen) = harness(local.clone());

        // Bad solve first: error carries the manual tag
        let bad = vec![Diff {
            hash: "nope".into(),
            change: DiffChange::delete("missing"),
        }];
        reconciler
            .handle_message(PEER, SyncMessage::manual_sync_solve("nope", bad))
            .await;
        assert!(error_causes(&seen)[0].contains("manual-sync-solve"));

        // Good solve: merged superset of the local set
        let merged = vec![
            local[0].clone(),
            credential("z", "Zeta", "pw-z"),
        ];
        let solve_diffs = credentials_as_diffs(&merged);
        let declared = solve_diffs.last().unwrap().hash.clone();
        let replies = reconciler
            .handle_message(PEER, SyncMessage::manual_sync_solve(declared, solve_diffs))
            .await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::SyncRequest);
        assert_eq!(host.snapshot().credentials.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_manual_synchronization_locally() {
        let local = vec![credential("a", "Alpha", "pw-a")];
        let merged = vec![local[0].clone(), credential("b", "Beta", "pw-b")];
        let (host, _events, reconciler, _seen) = harness(local);

        let diffs = credentials_as_diffs(&merged);
        let new_hash = reconciler.apply_manual_synchronization(&diffs).await.unwrap();

        assert_eq!(new_hash, credential_set_hash(&merged));
        assert_eq!(host.snapshot().credentials.len(), 2);
        assert_eq!(host.save_count(), 1);

        let solve = reconciler.manual_sync_solve_message(diffs);
        assert_eq!(solve.command, Command::ManualSyncSolve);
        assert_eq!(solve.hash.as_deref(), Some(new_hash.as_str()));
    }

    // ==================== full exchange ====================

    #[tokio::test]
    async fn test_two_vaults_converge_over_message_exchange() {
        // A is ahead of B by one addition; both share the base log.
        let base = three_credentials();
        let base_log = credentials_as_diffs(&base);

        let ahead = apply_diffs(&base, &[Diff {
            hash: String::new(),
            change: DiffChange::add(&credential("d", "Delta", "pw-d")),
        }])
        .unwrap();
        let mut a_log = base_log.clone();
        a_log.extend(ahead.diffs.clone());

        let (host_a, _ea, reconciler_a, _sa) = harness(ahead.credentials.clone());
        host_a.seed_diffs(a_log);
        let (host_b, _eb, reconciler_b, _sb) = harness(base.clone());
        host_b.seed_diffs(base_log);

        // B opens with its hash; A explains the difference
        let opening = reconciler_b.local_sync_request().await;
        let from_a = reconciler_a.handle_message("device-b", opening).await;
        assert_eq!(from_a.len(), 1);

        // B commits A's diffs and answers with a fresh request
        let from_b = reconciler_b.handle_message(PEER, from_a[0].clone()).await;
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].command, Command::SyncRequest);

        // A sees matching hashes and closes the loop
        let closing = reconciler_a.handle_message("device-b", from_b[0].clone()).await;
        assert_eq!(closing.len(), 1);
        assert!(closing[0].diffs.is_empty());

        assert_eq!(
            credential_set_hash(&host_a.snapshot().credentials),
            credential_set_hash(&host_b.snapshot().credentials)
        );
        assert_eq!(host_b.snapshot().credentials.len(), 4);
    }
}
