//! Per-collection replication: dumps, change stream tailing and recovery.

mod dump;
mod feed;
mod replicator;
mod state;

pub use replicator::*;
pub use state::{DumpOutcome, ReplicatorPhase, ReplicatorStatus, ResetOptions};
