mod controller;
pub mod presence;
mod view;

pub use controller::{ControllerDeps, SessionController};
pub use presence::PresenceMonitor;
pub use view::LiveView;
