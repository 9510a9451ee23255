//! Transport negotiation as an explicit state machine.
//!
//! The offer/answer/candidate exchange is modeled as a queue of incoming
//! [`NegotiationEvent`]s producing [`NegotiationAction`]s, so the whole
//! flow is testable with no transport attached. The orchestrator feeds
//! relay payloads and transport happenings in and interprets the actions
//! against the real transport handles.
//!
//! ```text
//! Idle ──presence──▶ OfferSent ──answer──▶ AnswerExchanged ─┐
//!   └───offer──▶ OfferReceived ───────────────────────────┐ │
//!                                          candidates ▼   ▼ ▼
//!                                        CandidatesExchanging ──▶ Open
//!                                                  └──────────▶ Failed
//! ```

use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    CandidatesExchanging,
    Open,
    Failed,
}

/// An incoming happening: a relay payload or a transport signal.
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// The peer joined the shared channel.
    PresenceJoined,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    /// The peer finished generating candidates.
    RemoteCandidatesComplete,
    /// The local transport generated a candidate.
    LocalCandidate(IceCandidate),
    /// The local transport finished generating candidates.
    LocalGatheringComplete,
    /// The data channel is open.
    ChannelOpened,
    TransportFailed(String),
}

/// What the orchestrator must do against the transport and relay.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    /// Create a local offer and publish it on the channel.
    SendOffer,
    /// Apply the remote offer, create an answer, publish it.
    SendAnswer(SessionDescription),
    ApplyRemoteAnswer(SessionDescription),
    ApplyRemoteCandidate(IceCandidate),
    PublishCandidate(IceCandidate),
    PublishCandidatesComplete,
    /// The channel is up: record Connected and drop the relay channel.
    MarkOpen,
    /// Negotiation is over; record Failed.
    Fail(String),
}

/// Per-connection negotiation progress.
#[derive(Debug)]
pub struct Negotiation {
    state: NegotiationState,
    local_candidates: usize,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiation {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            local_candidates: 0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// True once the exchange has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(self.state, NegotiationState::Open | NegotiationState::Failed)
    }

    /// Consume one event, producing the actions it implies.
    ///
    /// Events that make no sense in the current state are dropped without
    /// actions; the channel may deliver stale payloads after settlement.
    pub fn handle(&mut self, event: NegotiationEvent) -> Vec<NegotiationAction> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        if self.state == S::Failed {
            return Vec::new();
        }
        if self.state == S::Open {
            return match event {
                E::TransportFailed(reason) => {
                    self.state = S::Failed;
                    vec![NegotiationAction::Fail(reason)]
                }
                _ => Vec::new(),
            };
        }

        match event {
            E::PresenceJoined => {
                if self.state == S::Idle {
                    self.state = S::OfferSent;
                    vec![NegotiationAction::SendOffer]
                } else {
                    Vec::new()
                }
            }
            E::RemoteOffer(description) => {
                if self.state == S::Idle {
                    self.state = S::OfferReceived;
                    vec![NegotiationAction::SendAnswer(description)]
                } else {
                    Vec::new()
                }
            }
            E::RemoteAnswer(description) => {
                if self.state == S::OfferSent {
                    self.state = S::AnswerExchanged;
                    vec![NegotiationAction::ApplyRemoteAnswer(description)]
                } else {
                    Vec::new()
                }
            }
            E::RemoteCandidate(candidate) => match self.state {
                S::OfferSent | S::OfferReceived | S::AnswerExchanged | S::CandidatesExchanging => {
                    self.state = S::CandidatesExchanging;
                    vec![NegotiationAction::ApplyRemoteCandidate(candidate)]
                }
                _ => Vec::new(),
            },
            E::RemoteCandidatesComplete => Vec::new(),
            E::LocalCandidate(candidate) => match self.state {
                S::OfferSent | S::OfferReceived | S::AnswerExchanged | S::CandidatesExchanging => {
                    self.local_candidates += 1;
                    self.state = S::CandidatesExchanging;
                    vec![NegotiationAction::PublishCandidate(candidate)]
                }
                _ => Vec::new(),
            },
            E::LocalGatheringComplete => {
                if self.local_candidates == 0 {
                    // Zero candidates means the transport cannot be reached
                    // at all: fatal, not "no NAT traversal available".
                    self.state = S::Failed;
                    vec![NegotiationAction::Fail(
                        "no ICE candidates generated".into(),
                    )]
                } else {
                    vec![NegotiationAction::PublishCandidatesComplete]
                }
            }
            E::ChannelOpened => {
                self.state = S::Open;
                vec![NegotiationAction::MarkOpen]
            }
            E::TransportFailed(reason) => {
                self.state = S::Failed;
                vec![NegotiationAction::Fail(reason)]
            }
        }
    }
}
