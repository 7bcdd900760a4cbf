//! Per-peer offer/answer/ICE choreography.
//!
//! [`Negotiation`] is pure transition logic: it consumes [`NegotiationInput`]s
//! and returns the [`NegotiationAction`]s the session actor must carry out. It
//! never touches a transport or the bus itself, so every rule here is testable
//! without a runtime.
//!
//! ```text
//! IDLE --start (initiator)--> OFFER_SENT --answer--> ANSWER_RECEIVED --connected--> CONNECTED
//! IDLE --offer--> OFFER_RECEIVED --local answer--> ANSWER_SENT --connected--> CONNECTED
//! any --leave | local end | timeout | transport failure--> CLOSED
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::signaling::message::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationState::Idle => "IDLE",
            NegotiationState::OfferSent => "OFFER_SENT",
            NegotiationState::OfferReceived => "OFFER_RECEIVED",
            NegotiationState::AnswerSent => "ANSWER_SENT",
            NegotiationState::AnswerReceived => "ANSWER_RECEIVED",
            NegotiationState::Connected => "CONNECTED",
            NegotiationState::Closed => "CLOSED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerRole {
    Initiator,
    Responder,
}

/// Glare tie-break: the lexicographically lower id sends the offer.
pub fn role_for(local_id: &str, remote_id: &str) -> PeerRole {
    if local_id < remote_id {
        PeerRole::Initiator
    } else {
        PeerRole::Responder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    RemoteLeft,
    LocalEnd,
    Timeout,
    TransportFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationInput {
    Start,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    LocalOffer(SessionDescription),
    LocalAnswer(SessionDescription),
    LocalCandidate(IceCandidate),
    RemoteApplied,
    TransportConnected,
    TransportFailed,
    Timeout,
    Leave,
    LocalEnd,
}

impl NegotiationInput {
    fn name(&self) -> &'static str {
        match self {
            NegotiationInput::Start => "start",
            NegotiationInput::RemoteOffer(_) => "remote offer",
            NegotiationInput::RemoteAnswer(_) => "remote answer",
            NegotiationInput::RemoteCandidate(_) => "remote candidate",
            NegotiationInput::LocalOffer(_) => "local offer",
            NegotiationInput::LocalAnswer(_) => "local answer",
            NegotiationInput::LocalCandidate(_) => "local candidate",
            NegotiationInput::RemoteApplied => "remote description applied",
            NegotiationInput::TransportConnected => "transport connected",
            NegotiationInput::TransportFailed => "transport failed",
            NegotiationInput::Timeout => "timeout",
            NegotiationInput::Leave => "leave",
            NegotiationInput::LocalEnd => "local end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAction {
    CreateOffer,
    CreateAnswer,
    ApplyRemote(SessionDescription),
    /// Add remote candidates to the transport, in this order.
    AddCandidates(Vec<IceCandidate>),
    SendOffer(SessionDescription),
    SendAnswer(SessionDescription),
    SendCandidates(Vec<IceCandidate>),
    Close(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// Both sides offered; the initiator keeps its own offer.
    #[error("ignoring glare offer while our own offer is outstanding")]
    Glare,
    #[error("unexpected {input} in state {state}")]
    Unexpected {
        state: NegotiationState,
        input: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Negotiation {
    role: PeerRole,
    state: NegotiationState,
    remote_applied: bool,
    local_sent: bool,
    transport_up: bool,
    pending_remote: Vec<IceCandidate>,
    pending_local: Vec<IceCandidate>,
}

impl Negotiation {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            remote_applied: false,
            local_sent: false,
            transport_up: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    /// Remote candidates waiting for the remote description, in receipt order.
    pub fn pending_remote_candidates(&self) -> &[IceCandidate] {
        &self.pending_remote
    }

    pub fn step(&mut self, input: NegotiationInput) -> Result<Vec<NegotiationAction>, NegotiationError> {
        use NegotiationInput as In;
        use NegotiationState as S;

        if self.state == S::Closed {
            // Late completions and stray signals for a closed link are no-ops.
            return Ok(Vec::new());
        }

        let actions = match input {
            In::Start => match (self.state, self.role) {
                (S::Idle, PeerRole::Initiator) => {
                    self.state = S::OfferSent;
                    vec![NegotiationAction::CreateOffer]
                }
                (S::Idle, PeerRole::Responder) => Vec::new(),
                (state, _) => return Err(unexpected(state, &In::Start)),
            },
            In::RemoteOffer(desc) => match self.state {
                S::Idle => {
                    self.role = PeerRole::Responder;
                    self.state = S::OfferReceived;
                    vec![NegotiationAction::ApplyRemote(desc)]
                }
                S::OfferSent => return Err(NegotiationError::Glare),
                state => return Err(unexpected(state, &In::RemoteOffer(desc))),
            },
            In::RemoteAnswer(desc) => match self.state {
                S::OfferSent => {
                    self.state = S::AnswerReceived;
                    vec![NegotiationAction::ApplyRemote(desc)]
                }
                state => return Err(unexpected(state, &In::RemoteAnswer(desc))),
            },
            In::RemoteCandidate(candidate) => {
                if self.remote_applied {
                    vec![NegotiationAction::AddCandidates(vec![candidate])]
                } else {
                    self.pending_remote.push(candidate);
                    Vec::new()
                }
            }
            In::RemoteApplied => {
                self.remote_applied = true;
                let mut actions = Vec::new();
                if !self.pending_remote.is_empty() {
                    actions.push(NegotiationAction::AddCandidates(std::mem::take(
                        &mut self.pending_remote,
                    )));
                }
                if self.state == S::OfferReceived {
                    actions.push(NegotiationAction::CreateAnswer);
                }
                actions
            }
            In::LocalOffer(desc) => match self.state {
                S::OfferSent => self.local_description_ready(NegotiationAction::SendOffer(desc)),
                state => return Err(unexpected(state, &In::LocalOffer(desc))),
            },
            In::LocalAnswer(desc) => match self.state {
                S::OfferReceived => {
                    // The engine may report connectivity before the answer
                    // completion reaches us.
                    self.state = if self.transport_up {
                        S::Connected
                    } else {
                        S::AnswerSent
                    };
                    self.local_description_ready(NegotiationAction::SendAnswer(desc))
                }
                state => return Err(unexpected(state, &In::LocalAnswer(desc))),
            },
            In::LocalCandidate(candidate) => {
                if self.local_sent {
                    vec![NegotiationAction::SendCandidates(vec![candidate])]
                } else {
                    self.pending_local.push(candidate);
                    Vec::new()
                }
            }
            In::TransportConnected => match self.state {
                S::AnswerSent | S::AnswerReceived => {
                    self.state = S::Connected;
                    Vec::new()
                }
                _ => {
                    self.transport_up = true;
                    Vec::new()
                }
            },
            In::TransportFailed => self.close(CloseReason::TransportFailed),
            In::Timeout => match self.state {
                S::Connected => Vec::new(),
                _ => self.close(CloseReason::Timeout),
            },
            In::Leave => self.close(CloseReason::RemoteLeft),
            In::LocalEnd => self.close(CloseReason::LocalEnd),
        };
        Ok(actions)
    }

    fn local_description_ready(&mut self, send: NegotiationAction) -> Vec<NegotiationAction> {
        self.local_sent = true;
        let mut actions = vec![send];
        if !self.pending_local.is_empty() {
            actions.push(NegotiationAction::SendCandidates(std::mem::take(
                &mut self.pending_local,
            )));
        }
        actions
    }

    fn close(&mut self, reason: CloseReason) -> Vec<NegotiationAction> {
        self.state = NegotiationState::Closed;
        self.pending_remote.clear();
        self.pending_local.clear();
        vec![NegotiationAction::Close(reason)]
    }
}

fn unexpected(state: NegotiationState, input: &NegotiationInput) -> NegotiationError {
    NegotiationError::Unexpected {
        state,
        input: input.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationAction as Act;
    use NegotiationInput as In;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn lower_id_initiates() {
        assert_eq!(role_for("alice", "bob"), PeerRole::Initiator);
        assert_eq!(role_for("bob", "alice"), PeerRole::Responder);
    }

    #[test]
    fn initiator_walks_to_connected() {
        let mut n = Negotiation::new(PeerRole::Initiator);
        assert_eq!(n.step(In::Start).unwrap(), vec![Act::CreateOffer]);
        assert_eq!(n.state(), NegotiationState::OfferSent);

        let offer = SessionDescription::offer("o");
        assert_eq!(n.step(In::LocalOffer(offer.clone())).unwrap(), vec![Act::SendOffer(offer)]);

        let answer = SessionDescription::answer("a");
        assert_eq!(
            n.step(In::RemoteAnswer(answer.clone())).unwrap(),
            vec![Act::ApplyRemote(answer)]
        );
        assert_eq!(n.state(), NegotiationState::AnswerReceived);
        assert!(n.step(In::RemoteApplied).unwrap().is_empty());
        n.step(In::TransportConnected).unwrap();
        assert_eq!(n.state(), NegotiationState::Connected);
    }

    #[test]
    fn responder_answers_after_applying_offer() {
        let mut n = Negotiation::new(PeerRole::Responder);
        assert!(n.step(In::Start).unwrap().is_empty());
        assert_eq!(n.state(), NegotiationState::Idle);

        let offer = SessionDescription::offer("o");
        assert_eq!(n.step(In::RemoteOffer(offer.clone())).unwrap(), vec![Act::ApplyRemote(offer)]);
        assert_eq!(n.step(In::RemoteApplied).unwrap(), vec![Act::CreateAnswer]);

        let answer = SessionDescription::answer("a");
        assert_eq!(
            n.step(In::LocalAnswer(answer.clone())).unwrap(),
            vec![Act::SendAnswer(answer)]
        );
        assert_eq!(n.state(), NegotiationState::AnswerSent);
        n.step(In::TransportConnected).unwrap();
        assert_eq!(n.state(), NegotiationState::Connected);
    }

    #[test]
    fn early_candidates_flush_in_receipt_order() {
        let mut n = Negotiation::new(PeerRole::Responder);
        for i in 1..=3 {
            assert!(n.step(In::RemoteCandidate(candidate(i))).unwrap().is_empty());
        }
        assert_eq!(n.pending_remote_candidates().len(), 3);

        n.step(In::RemoteOffer(SessionDescription::offer("o"))).unwrap();
        let actions = n.step(In::RemoteApplied).unwrap();
        assert_eq!(
            actions,
            vec![
                Act::AddCandidates(vec![candidate(1), candidate(2), candidate(3)]),
                Act::CreateAnswer,
            ]
        );
        assert!(n.pending_remote_candidates().is_empty());
        assert_eq!(
            n.step(In::RemoteCandidate(candidate(4))).unwrap(),
            vec![Act::AddCandidates(vec![candidate(4)])]
        );
    }

    #[test]
    fn local_candidates_wait_for_description() {
        let mut n = Negotiation::new(PeerRole::Initiator);
        n.step(In::Start).unwrap();
        assert!(n.step(In::LocalCandidate(candidate(1))).unwrap().is_empty());
        let offer = SessionDescription::offer("o");
        assert_eq!(
            n.step(In::LocalOffer(offer.clone())).unwrap(),
            vec![Act::SendOffer(offer), Act::SendCandidates(vec![candidate(1)])]
        );
        assert_eq!(
            n.step(In::LocalCandidate(candidate(2))).unwrap(),
            vec![Act::SendCandidates(vec![candidate(2)])]
        );
    }

    #[test]
    fn connectivity_reported_before_answer_completion() {
        let mut n = Negotiation::new(PeerRole::Responder);
        n.step(In::RemoteOffer(SessionDescription::offer("o"))).unwrap();
        n.step(In::RemoteApplied).unwrap();
        n.step(In::TransportConnected).unwrap();
        assert_eq!(n.state(), NegotiationState::OfferReceived);
        n.step(In::LocalAnswer(SessionDescription::answer("a"))).unwrap();
        assert_eq!(n.state(), NegotiationState::Connected);
    }

    #[test]
    fn initiator_ignores_glare_offer() {
        let mut n = Negotiation::new(PeerRole::Initiator);
        n.step(In::Start).unwrap();
        assert_eq!(
            n.step(In::RemoteOffer(SessionDescription::offer("theirs"))),
            Err(NegotiationError::Glare)
        );
        assert_eq!(n.state(), NegotiationState::OfferSent);
    }

    #[test]
    fn out_of_order_answer_is_rejected() {
        let mut n = Negotiation::new(PeerRole::Responder);
        assert!(matches!(
            n.step(In::RemoteAnswer(SessionDescription::answer("a"))),
            Err(NegotiationError::Unexpected {
                state: NegotiationState::Idle,
                ..
            })
        ));
    }

    #[test]
    fn timeout_closes_unless_connected() {
        let mut pending = Negotiation::new(PeerRole::Initiator);
        pending.step(In::Start).unwrap();
        pending.step(In::RemoteCandidate(candidate(1))).unwrap();
        assert_eq!(pending.step(In::Timeout).unwrap(), vec![Act::Close(CloseReason::Timeout)]);
        assert!(pending.is_closed());
        assert!(pending.pending_remote_candidates().is_empty());

        let mut connected = Negotiation::new(PeerRole::Responder);
        connected.step(In::RemoteOffer(SessionDescription::offer("o"))).unwrap();
        connected.step(In::RemoteApplied).unwrap();
        connected.step(In::LocalAnswer(SessionDescription::answer("a"))).unwrap();
        connected.step(In::TransportConnected).unwrap();
        assert!(connected.step(In::Timeout).unwrap().is_empty());
        assert_eq!(connected.state(), NegotiationState::Connected);
    }

    #[test]
    fn closed_link_absorbs_everything() {
        let mut n = Negotiation::new(PeerRole::Responder);
        assert_eq!(n.step(In::Leave).unwrap(), vec![Act::Close(CloseReason::RemoteLeft)]);
        assert!(n.step(In::RemoteCandidate(candidate(1))).unwrap().is_empty());
        assert!(n.step(In::LocalEnd).unwrap().is_empty());
        assert!(n.pending_remote_candidates().is_empty());
    }
}
