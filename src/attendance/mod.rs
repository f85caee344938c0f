mod state;
mod tracker;

pub use state::{AttendanceWindow, WindowMap, MS_PER_MINUTE};
pub use tracker::WindowTracker;
