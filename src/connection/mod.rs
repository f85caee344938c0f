pub mod handle;
pub mod protocol;
mod socket;

pub use handle::{open, ConnectionHandle, Credentials, LinkStatus, Listener, LoopbackPeer, Subscription};
pub use protocol::{ClientEvent, EventKind, Location, ServerEvent};
pub use socket::ConnectOptions;
