mod link;
mod registry;

pub use link::{PeerLink, PeerOp};
pub use registry::PeerConnectionRegistry;
