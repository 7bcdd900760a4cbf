//! The peer transport seam.
//!
//! A [`PeerTransport`] is one peer connection as seen by the negotiation core:
//! it produces and consumes session descriptions and candidates. Events raised
//! by the engine (trickled candidates, connection state) are pushed through a
//! [`PeerEventSink`] onto the session actor's queue, tagged with the link
//! generation they belong to.

pub mod mock;
pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PeerTransportError;
use crate::media::LocalTrack;
use crate::signaling::message::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTransportEvent {
    LocalCandidate(IceCandidate),
    Connected,
    Disconnected,
    Failed,
}

/// Result of one queued transport operation, or an engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOutcome {
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    RemoteApplied,
    OperationFailed(String),
    Event(PeerTransportEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNotice {
    pub peer_id: String,
    pub generation: u64,
    pub outcome: PeerOutcome,
}

#[derive(Clone, Debug)]
pub struct PeerEventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerNotice>,
}

impl PeerEventSink {
    pub fn new(peer_id: impl Into<String>, generation: u64, tx: mpsc::UnboundedSender<PeerNotice>) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, event: PeerTransportEvent) {
        self.notify(PeerOutcome::Event(event));
    }

    pub(crate) fn notify(&self, outcome: PeerOutcome) {
        // The actor is gone once the session loop exits; nothing to tell.
        let _ = self.tx.send(PeerNotice {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            outcome,
        });
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn attach_tracks(&self, tracks: &[Arc<LocalTrack>]) -> Result<(), PeerTransportError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerTransportError>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, PeerTransportError>;

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), PeerTransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerTransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>, PeerTransportError>;
}
