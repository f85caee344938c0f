mod role;
mod snapshot;

pub use role::Role;
pub use snapshot::{PresenceSnapshot, WindowView};
