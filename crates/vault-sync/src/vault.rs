//! The host boundary: vault snapshots and the accessors the core requires
//! from its host application.
//!
//! The encrypted store, key derivation, and persistence format live on the
//! host side. The core only ever sees a decrypted [`Vault`] snapshot and
//! hands back replacement credential sets and diff logs through
//! [`VaultHost`]. [`InMemoryVault`] is the host used by this crate's own
//! tests and is exported for consumers' test suites.

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credential::Credential;
use crate::device::SynchronizationConfig;
use crate::diff::Diff;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault save failed: {0}")]
    Save(String),
}

/// A decrypted snapshot of the vault: the credential set plus its diff log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vault {
    pub credentials: Vec<Credential>,
    pub diffs: Vec<Diff>,
}

/// What the core requires from its host application.
///
/// All mutation goes through these methods; the core never persists
/// anything itself. Implementations are expected to be cheap — the
/// reconciler already serializes vault access, so no extra locking
/// discipline is required of the host.
#[async_trait]
pub trait VaultHost: Send + Sync {
    async fn get_vault(&self) -> Vault;
    async fn get_credentials(&self) -> Vec<Credential>;
    async fn update_credentials(&self, credentials: Vec<Credential>);
    async fn update_diffs(&self, diffs: Vec<Diff>);
    async fn save_vault(&self, vault: Vault) -> Result<(), VaultError>;
    fn get_synchronization_config(&self) -> SynchronizationConfig;
}

/// In-memory vault host for tests and examples.
pub struct InMemoryVault {
    state: RwLock<Vault>,
    config: SynchronizationConfig,
    save_count: RwLock<usize>,
}

impl InMemoryVault {
    pub fn new(config: SynchronizationConfig) -> Self {
        Self {
            state: RwLock::new(Vault::default()),
            config,
            save_count: RwLock::new(0),
        }
    }

    pub fn with_credentials(config: SynchronizationConfig, credentials: Vec<Credential>) -> Self {
        let host = Self::new(config);
        {
            let mut state = host.state.write().unwrap_or_else(|e| e.into_inner());
            state.credentials = credentials;
        }
        host
    }

    /// Current snapshot, for assertions.
    pub fn snapshot(&self) -> Vault {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times `save_vault` has been called.
    pub fn save_count(&self) -> usize {
        *self.save_count.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the diff log directly (test setup).
    pub fn seed_diffs(&self, diffs: Vec<Diff>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .diffs = diffs;
    }
}

#[async_trait]
impl VaultHost for InMemoryVault {
    async fn get_vault(&self) -> Vault {
        self.snapshot()
    }

    async fn get_credentials(&self) -> Vec<Credential> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .credentials
            .clone()
    }

    async fn update_credentials(&self, credentials: Vec<Credential>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .credentials = credentials;
    }

    async fn update_diffs(&self, diffs: Vec<Diff>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .diffs = diffs;
    }

    async fn save_vault(&self, vault: Vault) -> Result<(), VaultError> {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = vault;
        *self.save_count.write().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn get_synchronization_config(&self) -> SynchronizationConfig {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;

    fn config() -> SynchronizationConfig {
        SynchronizationConfig {
            local_device: DeviceIdentity {
                id: "local".into(),
                name: "Local".into(),
                created: 1,
            },
            devices: Vec::new(),
            signaling_servers: Vec::new(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_update_and_snapshot() {
        let host = InMemoryVault::new(config());
        let mut c = Credential::new("a");
        c.name = "Alpha".into();

        host.update_credentials(vec![c.clone()]).await;
        assert_eq!(host.get_credentials().await, vec![c]);
        assert!(host.get_vault().await.diffs.is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_state_and_counts() {
        let host = InMemoryVault::new(config());
        let vault = Vault {
            credentials: vec![Credential::new("a")],
            diffs: Vec::new(),
        };
        host.save_vault(vault.clone()).await.unwrap();
        assert_eq!(host.snapshot(), vault);
        assert_eq!(host.save_count(), 1);
    }
}
