//! Background Tasks Module
//!
//! Long-running tasks spawned next to the admin server.

mod refresh;

pub use refresh::spawn_refresh_task;
