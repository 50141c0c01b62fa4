//! Listener, session and stream plumbing.

pub mod channel;
pub mod downstream;
pub mod session;
pub mod upstream;

pub use channel::{ChannelManager, NodeChannel};
pub use downstream::DownstreamStream;
pub use session::SessionContext;
pub use upstream::UpstreamStream;
