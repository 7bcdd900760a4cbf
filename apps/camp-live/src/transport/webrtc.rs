//! webrtc-rs backed peer transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::setting_engine::SettingEngine;
use ::webrtc::api::{API, APIBuilder};
use ::webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use async_trait::async_trait;

use super::{PeerEventSink, PeerTransport, PeerTransportEvent, PeerTransportFactory};
use crate::error::PeerTransportError;
use crate::media::LocalTrack;
use crate::signaling::message::{IceCandidate, SdpKind, SessionDescription};

fn build_api() -> Result<API, PeerTransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> PeerTransportError {
    PeerTransportError::Setup(err.to_string())
}

pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self, PeerTransportError> {
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        Ok(Self {
            api: build_api()?,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>, PeerTransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerTransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(err) => tracing::warn!(
                        target = "camp_live::webrtc",
                        peer = %sink.peer_id(),
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let sink = state_sink.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "camp_live::webrtc",
                    peer = %sink.peer_id(),
                    ?state,
                    "peer connection state changed"
                );
                match state {
                    RTCPeerConnectionState::Connected => sink.emit(PeerTransportEvent::Connected),
                    RTCPeerConnectionState::Disconnected => sink.emit(PeerTransportEvent::Disconnected),
                    RTCPeerConnectionState::Failed => sink.emit(PeerTransportEvent::Failed),
                    _ => {}
                }
            })
        }));

        Ok(Arc::new(RtcPeerTransport {
            pc,
            peer_id: events.peer_id().to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    peer_id: String,
    closed: AtomicBool,
}

impl RtcPeerTransport {
    fn ensure_open(&self) -> Result<(), PeerTransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PeerTransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn attach_tracks(&self, tracks: &[Arc<LocalTrack>]) -> Result<(), PeerTransportError> {
        self.ensure_open()?;
        for track in tracks {
            let sender = self.pc.add_track(track.rtc_track()).await?;
            // RTCP has to be drained for the interceptors to make progress.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        tracing::debug!(
            target = "camp_live::webrtc",
            peer = %self.peer_id,
            tracks = tracks.len(),
            "local tracks attached"
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerTransportError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerTransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), PeerTransportError> {
        self.ensure_open()?;
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerTransportError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "camp_live::webrtc",
                peer = %self.peer_id,
                error = %err,
                "peer connection close reported an error"
            );
        }
    }
}
