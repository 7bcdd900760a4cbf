//! In-process transport double.
//!
//! Mock transports behave like a well-mannered engine: descriptions are
//! opaque strings, each created description trickles one local candidate, and
//! the transport reports connected once both descriptions are installed.
//! Remote candidates added before the remote description are rejected, the
//! same way a real engine rejects them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PeerEventSink, PeerTransport, PeerTransportEvent, PeerTransportFactory};
use crate::error::PeerTransportError;
use crate::media::LocalTrack;
use crate::signaling::message::{IceCandidate, SessionDescription};

#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    manual_connect: AtomicBool,
    fail_create: AtomicBool,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Never report connected; negotiation stalls until it times out.
    pub fn stall_connections(&self, stall: bool) {
        self.manual_connect.store(stall, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    pub fn created_for(&self, peer_id: &str) -> Vec<Arc<MockTransport>> {
        self.transports
            .lock()
            .iter()
            .filter(|transport| transport.peer_id() == peer_id)
            .cloned()
            .collect()
    }

    pub fn latest_for(&self, peer_id: &str) -> Option<Arc<MockTransport>> {
        self.created_for(peer_id).pop()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>, PeerTransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PeerTransportError::Setup("mock transport creation disabled".into()));
        }
        let transport = Arc::new(MockTransport {
            events,
            manual_connect: self.manual_connect.load(Ordering::SeqCst),
            state: Mutex::new(MockState::default()),
            closes: AtomicUsize::new(0),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    track_ids: Vec<String>,
    connected: bool,
    op_log: Vec<&'static str>,
}

pub struct MockTransport {
    events: PeerEventSink,
    manual_connect: bool,
    state: Mutex<MockState>,
    closes: AtomicUsize,
}

impl MockTransport {
    pub fn peer_id(&self) -> &str {
        self.events.peer_id()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.state.lock().track_ids.clone()
    }

    /// Operations in the order the transport saw them.
    pub fn operations(&self) -> Vec<&'static str> {
        self.state.lock().op_log.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Simulate the engine reporting a connection failure.
    pub fn fail(&self) {
        self.events.emit(PeerTransportEvent::Failed);
    }

    fn ensure_open(&self) -> Result<(), PeerTransportError> {
        if self.is_closed() {
            Err(PeerTransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn describe(&self, kind: &'static str) -> Result<SessionDescription, PeerTransportError> {
        self.ensure_open()?;
        let sdp = format!("mock-{kind} for {}", self.peer_id());
        let desc = if kind == "offer" {
            SessionDescription::offer(sdp)
        } else {
            SessionDescription::answer(sdp)
        };
        {
            let mut state = self.state.lock();
            state.op_log.push(if kind == "offer" { "create_offer" } else { "create_answer" });
            state.local = Some(desc.clone());
        }
        self.events.emit(PeerTransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{kind} 1 udp 2130706431 127.0.0.1 9 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.maybe_connect();
        Ok(desc)
    }

    fn maybe_connect(&self) {
        if self.manual_connect {
            return;
        }
        let newly_connected = {
            let mut state = self.state.lock();
            if state.local.is_some() && state.remote.is_some() && !state.connected {
                state.connected = true;
                true
            } else {
                false
            }
        };
        if newly_connected {
            self.events.emit(PeerTransportEvent::Connected);
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn attach_tracks(&self, tracks: &[Arc<LocalTrack>]) -> Result<(), PeerTransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.op_log.push("attach_tracks");
        state
            .track_ids
            .extend(tracks.iter().map(|track| track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerTransportError> {
        self.describe("offer")
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerTransportError> {
        if self.state.lock().remote.is_none() {
            return Err(PeerTransportError::Negotiation(
                "answer requested without a remote offer".into(),
            ));
        }
        self.describe("answer")
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), PeerTransportError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            state.op_log.push("apply_remote");
            state.remote = Some(desc);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerTransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerTransportError::Negotiation(
                "remote description not set".into(),
            ));
        }
        state.op_log.push("add_candidate");
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PeerNotice, PeerOutcome};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn connects_after_both_descriptions() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerNotice>();
        let factory = MockTransportFactory::new();
        let transport = factory
            .create(PeerEventSink::new("bob", 7, tx))
            .await
            .unwrap();

        transport.create_offer().await.unwrap();
        let candidate = rx.recv().await.unwrap();
        assert_eq!(candidate.generation, 7);
        assert!(matches!(
            candidate.outcome,
            PeerOutcome::Event(PeerTransportEvent::LocalCandidate(_))
        ));

        transport
            .apply_remote_description(SessionDescription::answer("a"))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap().outcome,
            PeerOutcome::Event(PeerTransportEvent::Connected)
        );
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = MockTransportFactory::new();
        let transport = factory.create(PeerEventSink::new("bob", 1, tx)).await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:x".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(transport.add_remote_candidate(candidate.clone()).await.is_err());
        transport
            .apply_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();
        transport.add_remote_candidate(candidate).await.unwrap();
        assert_eq!(factory.latest_for("bob").unwrap().remote_candidates().len(), 1);
    }
}
