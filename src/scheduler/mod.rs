//! Scheduling: timezone window resolution and the daily scheduling pass.

pub mod daily;
pub mod window;

pub use daily::{ScheduleReport, Scheduler};
pub use window::resolve_window;
