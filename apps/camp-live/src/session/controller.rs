//! The session actor.
//!
//! Everything that mutates session state runs on one task: UI commands,
//! signaling events, peer transport completions, negotiation deadlines and
//! presence failures are all funneled into a single `select!` loop. Slow work
//! (engine calls) happens on per-peer workers and comes back as
//! generation-tagged notices, which are discarded when the link they belong to
//! is gone.

use std::sync::Arc;

use stream_registry::{CreateStreamRequest, SessionRegistry};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use transport_bus::BusConnector;

use super::presence::PresenceMonitor;
use super::view::LiveView;
use crate::config::LiveConfig;
use crate::error::{BeginError, LiveError};
use crate::media::{LocalMedia, MediaDevices};
use crate::model::{
    AttendConfig, BeginConfig, Capability, CaptureFlags, Identity, SessionHandle, SessionRole,
    SessionState, StreamSession,
};
use crate::negotiation::{
    CloseReason, NegotiationAction, NegotiationError, NegotiationInput, NegotiationState, PeerRole,
    role_for,
};
use crate::peer::{PeerConnectionRegistry, PeerOp};
use crate::signaling::{Signal, SignalingClient, SignalingEvent, SignalingMessage};
use crate::transport::{PeerNotice, PeerOutcome, PeerTransportEvent, PeerTransportFactory};

/// Collaborators and context handed to the controller at construction.
pub struct ControllerDeps {
    pub identity: Identity,
    pub config: LiveConfig,
    pub registry: Arc<dyn SessionRegistry>,
    pub bus: Arc<dyn BusConnector>,
    pub media: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn PeerTransportFactory>,
}

enum Command {
    Begin(BeginConfig, oneshot::Sender<Result<SessionHandle, BeginError>>),
    Attend(AttendConfig, oneshot::Sender<Result<SessionHandle, BeginError>>),
    End(oneshot::Sender<()>),
    Toggle(Capability, oneshot::Sender<CaptureFlags>),
}

/// Handle to the session actor. Cheap to clone; the actor ends the active
/// session and exits once every handle is dropped.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<LiveView>,
}

impl SessionController {
    pub fn spawn(deps: ControllerDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(LiveView::default());
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (deadlines_tx, deadlines_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            peers: PeerConnectionRegistry::new(deps.transports.clone(), notices_tx),
            deps,
            view: view_tx,
            notices: notices_rx,
            deadlines_tx,
            deadlines: deadlines_rx,
            active: None,
            ended: None,
            last_error: None,
        };
        tokio::spawn(actor.run(commands_rx));
        Self {
            commands: commands_tx,
            view: view_rx,
        }
    }

    /// Capture media, register the session and start signaling.
    pub async fn begin(&self, config: BeginConfig) -> Result<SessionHandle, BeginError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Begin(config, tx))
            .map_err(|_| BeginError::ControllerStopped)?;
        rx.await.map_err(|_| BeginError::ControllerStopped)?
    }

    /// Join a session registered by someone else as a peer.
    pub async fn attend(&self, config: AttendConfig) -> Result<SessionHandle, BeginError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Attend(config, tx))
            .map_err(|_| BeginError::ControllerStopped)?;
        rx.await.map_err(|_| BeginError::ControllerStopped)?
    }

    /// Tear the session down. Calling it with no active session is a no-op.
    pub async fn end(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::End(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flip one capture source; returns the resulting flags.
    pub async fn toggle(&self, capability: Capability) -> CaptureFlags {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Toggle(capability, tx)).is_err() {
            return CaptureFlags::default();
        }
        rx.await.unwrap_or_default()
    }

    pub fn view(&self) -> watch::Receiver<LiveView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> LiveView {
        self.view.borrow().clone()
    }
}

struct ActiveSession {
    handle: SessionHandle,
    media: LocalMedia,
    flags: watch::Sender<CaptureFlags>,
    signaling: SignalingClient,
    signals: mpsc::UnboundedReceiver<SignalingEvent>,
    presence: Option<PresenceMonitor>,
    presence_exhausted: mpsc::UnboundedReceiver<u32>,
}

struct Deadline {
    peer_id: String,
    generation: u64,
}

enum Input {
    Command(Command),
    Signal(SignalingEvent),
    Notice(PeerNotice),
    Deadline(Deadline),
    PresenceExhausted(u32),
}

struct SessionActor {
    deps: ControllerDeps,
    view: watch::Sender<LiveView>,
    peers: PeerConnectionRegistry,
    notices: mpsc::UnboundedReceiver<PeerNotice>,
    deadlines_tx: mpsc::UnboundedSender<Deadline>,
    deadlines: mpsc::UnboundedReceiver<Deadline>,
    active: Option<ActiveSession>,
    /// Handle of the last session torn down, with its final state.
    ended: Option<SessionHandle>,
    last_error: Option<LiveError>,
}

async fn next<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let input = {
                let (signals, exhausted) = match self.active.as_mut() {
                    Some(active) => (
                        Some(&mut active.signals),
                        Some(&mut active.presence_exhausted),
                    ),
                    None => (None, None),
                };
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(command) => Input::Command(command),
                        None => break,
                    },
                    Some(event) = next(signals) => Input::Signal(event),
                    Some(failures) = next(exhausted) => Input::PresenceExhausted(failures),
                    Some(notice) = self.notices.recv() => Input::Notice(notice),
                    Some(deadline) = self.deadlines.recv() => Input::Deadline(deadline),
                }
            };

            match input {
                Input::Command(command) => self.on_command(command).await,
                Input::Signal(event) => self.on_signaling_event(event).await,
                Input::Notice(notice) => self.on_notice(notice),
                Input::Deadline(deadline) => {
                    if self.peers.is_current(&deadline.peer_id, deadline.generation) {
                        self.drive(&deadline.peer_id, NegotiationInput::Timeout);
                    }
                }
                Input::PresenceExhausted(failures) => {
                    tracing::error!(
                        target = "camp_live::presence",
                        failures,
                        "registry no longer acknowledges heartbeats; ending session locally"
                    );
                    self.teardown(false, Some(LiveError::HeartbeatExhausted { failures }))
                        .await;
                }
            }
            self.publish_view();
        }

        self.teardown(true, None).await;
        self.publish_view();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Begin(config, reply) => {
                let result = self.begin(config).await;
                self.record_begin(&result);
                let _ = reply.send(result);
            }
            Command::Attend(config, reply) => {
                let result = self.attend(config).await;
                self.record_begin(&result);
                let _ = reply.send(result);
            }
            Command::End(reply) => {
                self.teardown(true, None).await;
                let _ = reply.send(());
            }
            Command::Toggle(capability, reply) => {
                let _ = reply.send(self.toggle(capability));
            }
        }
    }

    fn record_begin(&mut self, result: &Result<SessionHandle, BeginError>) {
        match result {
            Ok(_) => {}
            // A rejected duplicate begin leaves the running session untouched.
            Err(BeginError::AlreadyActive(_)) => {}
            Err(err) => {
                tracing::warn!(target = "camp_live::session", error = %err, "session did not start");
                self.last_error = Some(LiveError::from(err));
            }
        }
    }

    async fn begin(&mut self, config: BeginConfig) -> Result<SessionHandle, BeginError> {
        if let Some(active) = &self.active {
            return Err(BeginError::AlreadyActive(active.handle.session_id().to_string()));
        }

        let media = self
            .deps
            .media
            .acquire(&config.capture)
            .await
            .map_err(BeginError::DeviceUnavailable)?;

        let request = CreateStreamRequest {
            title: config.title.clone(),
            kind: config.kind,
            camp_id: config.camp_id.clone(),
            track: config.track.clone(),
        };
        let created = match self.deps.registry.create_session(&request).await {
            Ok(created) => created,
            Err(err) => {
                media.release();
                return Err(BeginError::RegistrationFailed(err));
            }
        };

        let handle = SessionHandle {
            session: StreamSession {
                session_id: created.stream_id,
                owner_id: Some(self.deps.identity.peer_id.clone()),
                scope_id: config.camp_id,
                kind: config.kind,
                state: SessionState::Open,
                started_at: OffsetDateTime::now_utc(),
            },
            role: SessionRole::Owner,
            title: Some(config.title),
            capture: media.flags(),
        };
        self.open(handle, media).await
    }

    async fn attend(&mut self, config: AttendConfig) -> Result<SessionHandle, BeginError> {
        if let Some(active) = &self.active {
            return Err(BeginError::AlreadyActive(active.handle.session_id().to_string()));
        }

        let media = self
            .deps
            .media
            .acquire(&config.capture)
            .await
            .map_err(BeginError::DeviceUnavailable)?;

        let handle = SessionHandle {
            session: StreamSession {
                session_id: config.session_id,
                owner_id: None,
                scope_id: config.camp_id,
                kind: config.kind,
                state: SessionState::Open,
                started_at: OffsetDateTime::now_utc(),
            },
            role: SessionRole::Attendee,
            title: None,
            capture: media.flags(),
        };
        self.open(handle, media).await
    }

    async fn open(
        &mut self,
        handle: SessionHandle,
        media: LocalMedia,
    ) -> Result<SessionHandle, BeginError> {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let signaling = match SignalingClient::connect(
            self.deps.bus.clone(),
            handle.session_id(),
            &self.deps.identity.peer_id,
            self.deps.config.reconnect,
            signals_tx,
        )
        .await
        {
            Ok(signaling) => signaling,
            Err(err) => {
                media.release();
                if handle.is_owned() {
                    self.close_registry(&handle).await;
                }
                return Err(BeginError::Signaling(err));
            }
        };

        let (flags, flags_rx) = watch::channel(media.flags());
        let (exhausted_tx, presence_exhausted) = mpsc::unbounded_channel();
        let presence = handle.is_owned().then(|| {
            PresenceMonitor::start(
                self.deps.registry.clone(),
                handle.session_id().to_string(),
                flags_rx,
                self.deps.config.heartbeat_interval,
                self.deps.config.heartbeat_failure_budget,
                exhausted_tx,
            )
        });

        tracing::info!(
            target = "camp_live::session",
            session = %handle.session_id(),
            role = ?handle.role,
            camp = %handle.session.scope_id,
            "session started"
        );
        self.last_error = None;
        self.active = Some(ActiveSession {
            handle: handle.clone(),
            media,
            flags,
            signaling,
            signals,
            presence,
            presence_exhausted,
        });
        Ok(handle)
    }

    fn toggle(&mut self, capability: Capability) -> CaptureFlags {
        let Some(active) = self.active.as_mut() else {
            return CaptureFlags::default();
        };
        match active.media.toggle(capability) {
            Some(enabled) => {
                let flags = active.media.flags();
                active.flags.send_replace(flags.clone());
                active.handle.capture = flags.clone();
                tracing::debug!(
                    target = "camp_live::session",
                    %capability,
                    enabled,
                    "capture toggled"
                );
                flags
            }
            None => {
                tracing::debug!(
                    target = "camp_live::session",
                    %capability,
                    "capability was never acquired; toggle ignored"
                );
                active.media.flags()
            }
        }
    }

    /// Ordered teardown: peer links, signaling, presence, media, then the
    /// registry record. Every step runs regardless of how the previous went.
    async fn teardown(&mut self, close_registry: bool, cause: Option<LiveError>) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let grace = self.deps.config.teardown_timeout;
        active.handle.session.state = match &cause {
            Some(LiveError::HeartbeatExhausted { .. }) => SessionState::TimedOut,
            _ => SessionState::Closed,
        };

        self.peers.close_all(grace).await;
        if tokio::time::timeout(grace, active.signaling.close()).await.is_err() {
            tracing::warn!(target = "camp_live::signaling", "signaling close timed out");
        }
        if let Some(presence) = active.presence {
            presence.stop().await;
        }
        active.media.release();
        if close_registry && active.handle.is_owned() {
            self.close_registry(&active.handle).await;
        }

        tracing::info!(
            target = "camp_live::session",
            session = %active.handle.session_id(),
            cause = %cause.as_ref().map(|err| err.to_string()).unwrap_or_else(|| "end".into()),
            "session ended"
        );
        self.ended = Some(active.handle);
        if cause.is_some() {
            self.last_error = cause;
        }
    }

    async fn close_registry(&self, handle: &SessionHandle) {
        let grace = self.deps.config.teardown_timeout;
        let closing = self
            .deps
            .registry
            .close_session(&handle.session.scope_id, handle.session_id());
        match tokio::time::timeout(grace, closing).await {
            Ok(Ok(())) => tracing::debug!(
                target = "camp_live::registry",
                session = %handle.session_id(),
                "registry record closed"
            ),
            Ok(Err(err)) => tracing::warn!(
                target = "camp_live::registry",
                session = %handle.session_id(),
                error = %err,
                "registry close failed; the server will expire the record"
            ),
            Err(_) => tracing::warn!(
                target = "camp_live::registry",
                session = %handle.session_id(),
                "registry close timed out"
            ),
        }
    }

    async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message(message) => self.on_message(message),
            SignalingEvent::Reconnected => {
                // Peers answer our rejoin and renegotiate from scratch.
                let dropped = self.peers.len();
                self.peers.close_all(self.deps.config.teardown_timeout).await;
                tracing::info!(
                    target = "camp_live::signaling",
                    dropped,
                    "signaling reconnected; peer links reset"
                );
            }
            SignalingEvent::Lost(err) => {
                let cause = LiveError::TransportDisconnected(err.to_string());
                self.teardown(true, Some(cause)).await;
            }
        }
    }

    fn on_message(&mut self, message: SignalingMessage) {
        if self.active.is_none() {
            return;
        }
        let sender = message.sender;
        match message.signal {
            Signal::Join { reply_to: Some(_) } => {
                // Reply to an announce: only interesting if we have not met.
                if !self.peers.contains(&sender) {
                    self.open_link(&sender);
                }
            }
            Signal::Join { reply_to: None } | Signal::Rejoin => {
                if self.peers.remove(&sender) {
                    tracing::debug!(
                        target = "camp_live::negotiation",
                        peer = %sender,
                        "known peer announced again; renegotiating"
                    );
                }
                self.open_link(&sender);
                self.publish(
                    Signal::Join {
                        reply_to: Some(sender.clone()),
                    },
                    Some(&sender),
                );
            }
            Signal::Offer(desc) => {
                let fresh = match self.peers.get(&sender) {
                    None => true,
                    Some(link) => !matches!(
                        link.state(),
                        NegotiationState::Idle | NegotiationState::OfferSent
                    ),
                };
                if fresh {
                    self.peers.remove(&sender);
                    self.spawn_link(&sender, PeerRole::Responder);
                }
                self.drive(&sender, NegotiationInput::RemoteOffer(desc));
            }
            Signal::Answer(desc) => {
                if self.peers.contains(&sender) {
                    self.drive(&sender, NegotiationInput::RemoteAnswer(desc));
                } else {
                    tracing::debug!(target = "camp_live::negotiation", peer = %sender, "answer from unknown peer dropped");
                }
            }
            Signal::Ice(candidate) => {
                if self.peers.contains(&sender) {
                    self.drive(&sender, NegotiationInput::RemoteCandidate(candidate));
                } else {
                    tracing::debug!(target = "camp_live::negotiation", peer = %sender, "candidate from unknown peer dropped");
                }
            }
            Signal::Leave => {
                if self.peers.contains(&sender) {
                    self.drive(&sender, NegotiationInput::Leave);
                }
            }
        }
    }

    fn on_notice(&mut self, notice: PeerNotice) {
        if !self.peers.is_current(&notice.peer_id, notice.generation) {
            tracing::trace!(
                target = "camp_live::negotiation",
                peer = %notice.peer_id,
                generation = notice.generation,
                "stale peer notice ignored"
            );
            return;
        }
        let input = match notice.outcome {
            PeerOutcome::OfferCreated(desc) => NegotiationInput::LocalOffer(desc),
            PeerOutcome::AnswerCreated(desc) => NegotiationInput::LocalAnswer(desc),
            PeerOutcome::RemoteApplied => NegotiationInput::RemoteApplied,
            PeerOutcome::OperationFailed(_) => NegotiationInput::TransportFailed,
            PeerOutcome::Event(PeerTransportEvent::LocalCandidate(candidate)) => {
                NegotiationInput::LocalCandidate(candidate)
            }
            PeerOutcome::Event(PeerTransportEvent::Connected) => {
                tracing::info!(target = "camp_live::webrtc", peer = %notice.peer_id, "peer connected");
                NegotiationInput::TransportConnected
            }
            PeerOutcome::Event(PeerTransportEvent::Disconnected) => {
                tracing::debug!(target = "camp_live::webrtc", peer = %notice.peer_id, "peer disconnected; waiting for ICE to recover");
                return;
            }
            PeerOutcome::Event(PeerTransportEvent::Failed) => NegotiationInput::TransportFailed,
        };
        self.drive(&notice.peer_id, input);
    }

    /// New link in the role the tie-break assigns, started right away.
    fn open_link(&mut self, peer_id: &str) {
        let role = role_for(&self.deps.identity.peer_id, peer_id);
        self.spawn_link(peer_id, role);
        self.drive(peer_id, NegotiationInput::Start);
    }

    fn spawn_link(&mut self, peer_id: &str, role: PeerRole) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let (link, created) = self.peers.get_or_create(peer_id, role);
        if !created {
            return;
        }
        let generation = link.generation();
        self.peers.attach_local_tracks(peer_id, active.media.tracks());

        let deadlines = self.deadlines_tx.clone();
        let timeout = self.deps.config.negotiation_timeout;
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = deadlines.send(Deadline {
                peer_id,
                generation,
            });
        });
    }

    fn drive(&mut self, peer_id: &str, input: NegotiationInput) {
        let Some(link) = self.peers.get_mut(peer_id) else {
            return;
        };
        let before = link.state();
        let actions = match link.negotiation.step(input) {
            Ok(actions) => actions,
            Err(NegotiationError::Glare) => {
                tracing::debug!(target = "camp_live::negotiation", peer = %peer_id, "glare offer ignored");
                return;
            }
            Err(err) => {
                tracing::warn!(target = "camp_live::negotiation", peer = %peer_id, error = %err, "signal ignored");
                return;
            }
        };
        let after = link.state();
        if after != before {
            tracing::debug!(
                target = "camp_live::negotiation",
                peer = %peer_id,
                from = %before,
                to = %after,
                "negotiation state changed"
            );
        }
        for action in actions {
            self.execute(peer_id, action);
        }
    }

    fn execute(&mut self, peer_id: &str, action: NegotiationAction) {
        match action {
            NegotiationAction::CreateOffer => self.submit(peer_id, PeerOp::CreateOffer),
            NegotiationAction::CreateAnswer => self.submit(peer_id, PeerOp::CreateAnswer),
            NegotiationAction::ApplyRemote(desc) => self.submit(peer_id, PeerOp::ApplyRemote(desc)),
            NegotiationAction::AddCandidates(candidates) => {
                self.submit(peer_id, PeerOp::AddCandidates(candidates))
            }
            NegotiationAction::SendOffer(desc) => self.publish(Signal::Offer(desc), Some(peer_id)),
            NegotiationAction::SendAnswer(desc) => {
                self.publish(Signal::Answer(desc), Some(peer_id))
            }
            NegotiationAction::SendCandidates(candidates) => {
                for candidate in candidates {
                    self.publish(Signal::Ice(candidate), Some(peer_id));
                }
            }
            NegotiationAction::Close(reason) => {
                self.peers.remove(peer_id);
                match reason {
                    CloseReason::Timeout => {
                        tracing::warn!(target = "camp_live::negotiation", peer = %peer_id, "negotiation timed out; link dropped");
                        self.last_error = Some(LiveError::NegotiationTimeout {
                            peer_id: peer_id.to_string(),
                        });
                    }
                    CloseReason::TransportFailed => {
                        tracing::warn!(target = "camp_live::negotiation", peer = %peer_id, "peer transport failed; link dropped");
                    }
                    CloseReason::RemoteLeft | CloseReason::LocalEnd => {
                        tracing::info!(target = "camp_live::negotiation", peer = %peer_id, ?reason, "peer link closed");
                    }
                }
            }
        }
    }

    fn submit(&self, peer_id: &str, op: PeerOp) {
        if let Some(link) = self.peers.get(peer_id) {
            link.submit(op);
        }
    }

    fn publish(&self, signal: Signal, target: Option<&str>) {
        if let Some(active) = &self.active {
            active.signaling.publish(signal, target);
        }
    }

    fn publish_view(&self) {
        let view = match &self.active {
            Some(active) => LiveView {
                is_streaming: true,
                session: Some(active.handle.clone()),
                participant_ids: self.peers.peer_ids(),
                connection_state_by_peer: self.peers.states(),
                capture: active.media.flags(),
                signaling_connected: active.signaling.is_connected(),
                last_error: self.last_error.clone(),
            },
            None => LiveView {
                session: self.ended.clone(),
                last_error: self.last_error.clone(),
                ..LiveView::default()
            },
        };
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
