//! Linked devices and connection-helper server configuration.
//!
//! These types are created by user action (linking a device) and persisted
//! by the host; the core only reads them per connection attempt. Server
//! configs carry a stable `id` that `LinkedDevice` references; lookups go
//! through [`SynchronizationConfig`].

use serde::{Deserialize, Serialize};

/// Identity of the local device: the minimum the core needs to derive the
/// shared pair-channel name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
    /// Creation time, ms since epoch. Decides channel-name seniority.
    pub created: u64,
}

/// A remote device linked to this vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedDevice {
    pub id: String,
    pub name: String,
    /// Root devices may manage other linked devices for the account.
    pub root: bool,
    /// Reconnect automatically after a transport failure.
    pub auto_connect: bool,
    /// Disconnect this many seconds after the transport connects.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sync_timeout_secs: Option<u64>,
    /// Creation time, ms since epoch. Decides channel-name seniority.
    pub created: u64,
    /// Signaling relay configs to use, by id. Empty = the default relay.
    #[serde(default)]
    pub signaling_server_ids: Vec<String>,
    /// STUN configs to use, by id. Empty = built-in defaults.
    #[serde(default)]
    pub stun_server_ids: Vec<String>,
    /// TURN configs to use, by id. Empty = built-in defaults.
    #[serde(default)]
    pub turn_server_ids: Vec<String>,
}

/// Connection parameters for a signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingServerConfig {
    pub id: String,
    pub endpoint: String,
}

impl SignalingServerConfig {
    /// The well-known "online services" relay used when a device does not
    /// name one of its own.
    pub fn online_services() -> Self {
        Self {
            id: "online-services".into(),
            endpoint: "wss://signal.credvault.io".into(),
        }
    }
}

/// Connection parameters for a STUN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StunServerConfig {
    pub id: String,
    pub url: String,
}

impl StunServerConfig {
    /// Built-in fallbacks used when a device configures no STUN servers.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                id: "stun-default-0".into(),
                url: "stun:stun.l.google.com:19302".into(),
            },
            Self {
                id: "stun-default-1".into(),
                url: "stun:stun1.l.google.com:19302".into(),
            },
        ]
    }
}

/// Connection parameters for a TURN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnServerConfig {
    pub id: String,
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl TurnServerConfig {
    /// Built-in fallback used when a device configures no TURN servers.
    pub fn defaults() -> Vec<Self> {
        vec![Self {
            id: "turn-default-0".into(),
            url: "turn:relay.credvault.io:3478".into(),
            username: "credvault".into(),
            credential: "sync".into(),
        }]
    }
}

/// Host-provided synchronization configuration: who we are, which devices
/// are linked, and the server configs their ids resolve against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationConfig {
    pub local_device: DeviceIdentity,
    #[serde(default)]
    pub devices: Vec<LinkedDevice>,
    #[serde(default)]
    pub signaling_servers: Vec<SignalingServerConfig>,
    #[serde(default)]
    pub stun_servers: Vec<StunServerConfig>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServerConfig>,
}

impl SynchronizationConfig {
    pub fn find_device(&self, id: &str) -> Option<&LinkedDevice> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn find_signaling_server(&self, id: &str) -> Option<&SignalingServerConfig> {
        self.signaling_servers.iter().find(|s| s.id == id)
    }

    pub fn find_stun_server(&self, id: &str) -> Option<&StunServerConfig> {
        self.stun_servers.iter().find(|s| s.id == id)
    }

    pub fn find_turn_server(&self, id: &str) -> Option<&TurnServerConfig> {
        self.turn_servers.iter().find(|s| s.id == id)
    }
}

/// Derive the shared pair-channel name both peers compute independently.
///
/// The device created earlier takes the senior slot. Exact creation-time
/// ties fall back to id order so the two sides still agree.
pub fn pair_channel_name(
    local_id: &str,
    local_created: u64,
    remote_id: &str,
    remote_created: u64,
) -> String {
    let local_is_senior = match local_created.cmp(&remote_created) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => local_id < remote_id,
    };
    if local_is_senior {
        format!("presence-{local_id}_{remote_id}")
    } else {
        format!("presence-{remote_id}_{local_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, created: u64) -> LinkedDevice {
        LinkedDevice {
            id: id.into(),
            name: id.into(),
            root: false,
            auto_connect: false,
            sync_timeout_secs: None,
            created,
            signaling_server_ids: Vec::new(),
            stun_server_ids: Vec::new(),
            turn_server_ids: Vec::new(),
        }
    }

    #[test]
    fn test_senior_device_takes_first_slot() {
        assert_eq!(
            pair_channel_name("older", 100, "newer", 200),
            "presence-older_newer"
        );
        assert_eq!(
            pair_channel_name("newer", 200, "older", 100),
            "presence-older_newer"
        );
    }

    #[test]
    fn test_both_sides_derive_identical_name() {
        let a = ("device-a", 5_000u64);
        let b = ("device-b", 4_000u64);
        let from_a = pair_channel_name(a.0, a.1, b.0, b.1);
        let from_b = pair_channel_name(b.0, b.1, a.0, a.1);
        assert_eq!(from_a, from_b);
        assert_eq!(from_a, "presence-device-b_device-a");
    }

    #[test]
    fn test_creation_tie_breaks_on_id() {
        assert_eq!(
            pair_channel_name("bbb", 100, "aaa", 100),
            "presence-aaa_bbb"
        );
        assert_eq!(
            pair_channel_name("aaa", 100, "bbb", 100),
            "presence-aaa_bbb"
        );
    }

    #[test]
    fn test_config_lookups() {
        let config = SynchronizationConfig {
            local_device: DeviceIdentity {
                id: "local".into(),
                name: "Local".into(),
                created: 1,
            },
            devices: vec![device("remote", 2)],
            signaling_servers: vec![SignalingServerConfig {
                id: "relay-1".into(),
                endpoint: "wss://relay.example".into(),
            }],
            stun_servers: StunServerConfig::defaults(),
            turn_servers: Vec::new(),
        };

        assert!(config.find_device("remote").is_some());
        assert!(config.find_device("missing").is_none());
        assert!(config.find_signaling_server("relay-1").is_some());
        assert!(config.find_signaling_server("relay-2").is_none());
        assert!(config.find_stun_server("stun-default-0").is_some());
        assert!(config.find_turn_server("turn-default-0").is_none());
    }

    #[test]
    fn test_default_relay_is_stable() {
        let relay = SignalingServerConfig::online_services();
        assert_eq!(relay.id, "online-services");
        assert!(!relay.endpoint.is_empty());
    }
}
