use std::collections::BTreeMap;

use crate::error::LiveError;
use crate::model::{CaptureFlags, SessionHandle};
use crate::negotiation::NegotiationState;

/// Read model published to the UI after every actor step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveView {
    pub is_streaming: bool,
    /// The live session, or once streaming stops, the last one with its
    /// final state.
    pub session: Option<SessionHandle>,
    pub participant_ids: Vec<String>,
    pub connection_state_by_peer: BTreeMap<String, NegotiationState>,
    pub capture: CaptureFlags,
    pub signaling_connected: bool,
    pub last_error: Option<LiveError>,
}

impl LiveView {
    pub fn connected_peers(&self) -> usize {
        self.connection_state_by_peer
            .values()
            .filter(|state| **state == NegotiationState::Connected)
            .count()
    }

    pub fn state_of(&self, peer_id: &str) -> Option<NegotiationState> {
        self.connection_state_by_peer.get(peer_id).copied()
    }
}
