pub mod client;
pub mod message;

pub use client::{SignalingClient, SignalingEvent};
pub use message::{IceCandidate, SdpKind, SessionDescription, Signal, SignalType, SignalingMessage};
