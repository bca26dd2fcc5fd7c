//! usagebar-core: keeps usage metrics published in tmux options, fresh and
//! supervised.
//!
//! The worker (`daemon`) runs the `refresh` cycle on a timer: fetch a usage
//! snapshot, skip recomputation through the `cache`, render with `format`,
//! and publish differentially into the tmux option table. The `monitor`
//! layer ages that data, watches the worker pid, and recovers both.
//! `control` holds the lifecycle operations the CLI runs from outside.

pub mod cache;
pub mod clock;
pub mod control;
pub mod daemon;
pub mod error;
pub mod format;
pub mod infrastructure;
pub mod lock;
pub mod monitor;
pub mod recovery;
pub mod refresh;
pub mod timer;
pub mod types;

pub use error::{Error, Result};
