use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::PeerTransportError;
use crate::media::LocalTrack;
use crate::negotiation::{Negotiation, NegotiationState, PeerRole};
use crate::signaling::message::{IceCandidate, SessionDescription};
use crate::transport::{PeerEventSink, PeerNotice, PeerOutcome, PeerTransport, PeerTransportFactory};

/// Transport work queued for one peer. Operations run strictly in order on
/// the link's worker task so a slow engine call for one peer never holds up
/// the session actor or another peer.
#[derive(Debug)]
pub enum PeerOp {
    AttachTracks(Vec<Arc<LocalTrack>>),
    CreateOffer,
    CreateAnswer,
    ApplyRemote(SessionDescription),
    AddCandidates(Vec<IceCandidate>),
}

pub struct PeerLink {
    peer_id: String,
    generation: u64,
    created_at: Instant,
    pub(crate) negotiation: Negotiation,
    ops: mpsc::UnboundedSender<PeerOp>,
    cancel: oneshot::Sender<()>,
    worker: JoinHandle<()>,
    tracks: Vec<String>,
}

impl PeerLink {
    pub(crate) fn spawn(
        peer_id: &str,
        role: PeerRole,
        generation: u64,
        factory: Arc<dyn PeerTransportFactory>,
        notices: mpsc::UnboundedSender<PeerNotice>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (cancel, cancelled) = oneshot::channel();
        let sink = PeerEventSink::new(peer_id, generation, notices);
        let worker = tokio::spawn(run_worker(factory, sink, ops_rx, cancelled));
        Self {
            peer_id: peer_id.to_string(),
            generation,
            created_at: Instant::now(),
            negotiation: Negotiation::new(role),
            ops: ops_tx,
            cancel,
            worker,
            tracks: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> PeerRole {
        self.negotiation.role()
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn pending_remote_candidates(&self) -> &[IceCandidate] {
        self.negotiation.pending_remote_candidates()
    }

    /// Ids of the local tracks lent to this link.
    pub fn track_ids(&self) -> &[String] {
        &self.tracks
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn submit(&self, op: PeerOp) {
        if self.ops.send(op).is_err() {
            tracing::debug!(
                target = "camp_live::negotiation",
                peer = %self.peer_id,
                generation = self.generation,
                "peer worker already stopped; dropping op"
            );
        }
    }

    pub(crate) fn lend_tracks(&mut self, tracks: &[Arc<LocalTrack>]) {
        self.tracks = tracks.iter().map(|track| track.id().to_string()).collect();
        self.submit(PeerOp::AttachTracks(tracks.to_vec()));
    }

    /// Abandon queued work. The worker closes the transport, once, on its
    /// way out; await the returned handle to know it is released.
    pub(crate) fn shutdown(self) -> JoinHandle<()> {
        let _ = self.cancel.send(());
        self.worker
    }
}

async fn run_worker(
    factory: Arc<dyn PeerTransportFactory>,
    sink: PeerEventSink,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    mut cancelled: oneshot::Receiver<()>,
) {
    let transport = tokio::select! {
        biased;
        _ = &mut cancelled => return,
        created = factory.create(sink.clone()) => match created {
            Ok(transport) => transport,
            Err(err) => {
                tracing::warn!(
                    target = "camp_live::webrtc",
                    peer = %sink.peer_id(),
                    error = %err,
                    "peer transport setup failed"
                );
                sink.notify(PeerOutcome::OperationFailed(err.to_string()));
                return;
            }
        },
    };

    loop {
        let op = tokio::select! {
            biased;
            _ = &mut cancelled => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let outcome = tokio::select! {
            biased;
            _ = &mut cancelled => break,
            outcome = apply_op(transport.as_ref(), op) => outcome,
        };
        match outcome {
            Ok(Some(outcome)) => sink.notify(outcome),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target = "camp_live::webrtc",
                    peer = %sink.peer_id(),
                    error = %err,
                    "peer transport operation failed"
                );
                sink.notify(PeerOutcome::OperationFailed(err.to_string()));
                break;
            }
        }
    }

    transport.close().await;
    tracing::debug!(
        target = "camp_live::webrtc",
        peer = %sink.peer_id(),
        "peer transport closed"
    );
}

async fn apply_op(
    transport: &dyn PeerTransport,
    op: PeerOp,
) -> Result<Option<PeerOutcome>, PeerTransportError> {
    match op {
        PeerOp::AttachTracks(tracks) => transport.attach_tracks(&tracks).await.map(|_| None),
        PeerOp::CreateOffer => transport
            .create_offer()
            .await
            .map(|desc| Some(PeerOutcome::OfferCreated(desc))),
        PeerOp::CreateAnswer => transport
            .create_answer()
            .await
            .map(|desc| Some(PeerOutcome::AnswerCreated(desc))),
        PeerOp::ApplyRemote(desc) => transport
            .apply_remote_description(desc)
            .await
            .map(|_| Some(PeerOutcome::RemoteApplied)),
        PeerOp::AddCandidates(candidates) => {
            for candidate in candidates {
                transport.add_remote_candidate(candidate).await?;
            }
            Ok(None)
        }
    }
}
