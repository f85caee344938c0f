mod book;
pub mod coordinator;
pub mod geolocation;
mod locks;
mod state;

pub use book::PunchBook;
pub use coordinator::{PunchCoordinator, PunchReceipt};
pub use geolocation::{FixedLocation, GeolocationProvider, LocationError, ScriptedLocation};
pub use state::{Direction, PendingPunch, PunchEntry, PunchState};
