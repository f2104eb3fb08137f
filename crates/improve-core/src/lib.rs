pub mod backlog;
pub mod config;
pub mod events;
pub mod markers;
pub mod matching;
pub mod prompt;
pub mod reconcile;
pub mod types;

pub use backlog::{BacklogEntry, BacklogStore};
pub use config::Config;
pub use events::{EventKind, LogEvent};
pub use types::*;
