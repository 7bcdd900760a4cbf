use stream_registry::RegistryError;
use thiserror::Error;
use transport_bus::BusError;

use crate::model::Capability;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} capture device unavailable: {1}")]
    DeviceUnavailable(Capability, String),
    #[error("failed to write media sample: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
pub enum PeerTransportError {
    #[error("peer transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation step failed: {0}")]
    Negotiation(String),
    #[error("peer transport closed")]
    Closed,
}

impl From<webrtc::Error> for PeerTransportError {
    fn from(err: webrtc::Error) -> Self {
        PeerTransportError::Negotiation(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("signaling bus unreachable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: BusError },
}

/// Why `begin` or `attend` could not open a session.
#[derive(Debug, Error)]
pub enum BeginError {
    #[error("a session is already active: {0}")]
    AlreadyActive(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(#[source] MediaError),
    #[error("session registration failed: {0}")]
    RegistrationFailed(#[source] RegistryError),
    #[error("signaling unavailable: {0}")]
    Signaling(#[source] SignalingError),
    #[error("session controller stopped")]
    ControllerStopped,
}

/// Session-wide failures surfaced through the read model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("session registration failed: {0}")]
    RegistrationFailed(String),
    #[error("signaling transport disconnected: {0}")]
    TransportDisconnected(String),
    #[error("negotiation with {peer_id} timed out")]
    NegotiationTimeout { peer_id: String },
    #[error("presence heartbeat failed {failures} times in a row")]
    HeartbeatExhausted { failures: u32 },
}

impl From<&BeginError> for LiveError {
    fn from(err: &BeginError) -> Self {
        match err {
            BeginError::DeviceUnavailable(inner) => LiveError::DeviceUnavailable(inner.to_string()),
            BeginError::Signaling(inner) => LiveError::TransportDisconnected(inner.to_string()),
            other => LiveError::RegistrationFailed(other.to_string()),
        }
    }
}
