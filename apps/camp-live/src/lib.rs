//! Live-session core for camp streams: media capture, registry bookkeeping,
//! pub/sub signaling and the WebRTC peer mesh, driven by one session actor.

pub mod config;
pub mod error;
pub mod media;
pub mod model;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::LiveConfig;
pub use error::{BeginError, LiveError};
pub use model::{AttendConfig, BeginConfig, Capability, CaptureFlags, Identity, SessionHandle};
pub use session::{ControllerDeps, LiveView, SessionController};
