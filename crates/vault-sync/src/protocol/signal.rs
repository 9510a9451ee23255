//! Relay-carried signaling payloads for transport negotiation.
//!
//! One custom channel event ([`SIGNAL_EVENT`]) carries all four payload
//! kinds, disambiguated by a `"type"` tag. Payloads are JSON with
//! camelCase field names so browser and mobile peers can produce and
//! consume them directly.

use serde::{Deserialize, Serialize};

/// The single relay event name all signaling payloads travel under.
pub const SIGNAL_EVENT: &str = "client-sync-signal";

/// A transport session description (offer or answer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    /// "offer" or "answer", as the transport reports it.
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// A NAT-traversal candidate produced during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_m_line_index: Option<u32>,
}

/// Wire format: `{"type":"offer","description":{...}}`,
/// `{"type":"ice-candidate","candidate":{...}}`, etc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    IceCandidate { candidate: IceCandidate },
    /// Candidate generation finished on the sending side.
    IceCompleted,
}

impl SignalPayload {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("SignalPayload serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or an unrecognized `type` tag.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 49203 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    #[test]
    fn test_offer_roundtrip() {
        let payload = SignalPayload::Offer {
            description: SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0"),
        };
        let json = payload.to_json();
        assert_eq!(SignalPayload::from_json(&json).unwrap(), payload);
    }

    #[test]
    fn test_answer_roundtrip() {
        let payload = SignalPayload::Answer {
            description: SessionDescription::answer("v=0"),
        };
        let json = payload.to_json();
        assert_eq!(SignalPayload::from_json(&json).unwrap(), payload);
    }

    #[test]
    fn test_candidate_roundtrip() {
        let payload = SignalPayload::IceCandidate {
            candidate: candidate(),
        };
        let json = payload.to_json();
        assert_eq!(SignalPayload::from_json(&json).unwrap(), payload);
    }

    #[test]
    fn test_completed_roundtrip() {
        let json = SignalPayload::IceCompleted.to_json();
        assert_eq!(
            SignalPayload::from_json(&json).unwrap(),
            SignalPayload::IceCompleted
        );
    }

    #[test]
    fn test_wire_format_tags() {
        let offer = SignalPayload::Offer {
            description: SessionDescription::offer("sdp"),
        };
        let json = String::from_utf8(offer.to_json()).unwrap();
        assert!(json.contains("\"type\":\"offer\""));

        let done = String::from_utf8(SignalPayload::IceCompleted.to_json()).unwrap();
        assert!(done.contains("\"type\":\"ice-completed\""));

        let cand = SignalPayload::IceCandidate {
            candidate: candidate(),
        };
        let json = String::from_utf8(cand.to_json()).unwrap();
        assert!(json.contains("\"type\":\"ice-candidate\""));
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));
    }

    #[test]
    fn test_candidate_without_mid_omits_fields() {
        let payload = SignalPayload::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            },
        };
        let json = String::from_utf8(payload.to_json()).unwrap();
        assert!(!json.contains("sdpMid"));
        assert!(!json.contains("sdpMLineIndex"));

        let parsed = SignalPayload::from_json(json.as_bytes()).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(SignalPayload::from_json(br#"{"type":"renegotiate"}"#).is_none());
        assert!(SignalPayload::from_json(b"not json").is_none());
        assert!(SignalPayload::from_json(b"").is_none());
    }
}
