//! The refresh path: fetch usage from upstream, publish it to the store.

pub mod cycle;
pub mod publish;
pub mod upstream;

pub use cycle::{CycleOutcome, CycleStats, RefreshCycle};
pub use publish::{PublishOutcome, Publisher};
pub use upstream::{CommandSource, UpstreamSource};
