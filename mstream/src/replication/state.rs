use std::fmt;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::concurrency::signal::SignalTx;
use crate::dispatcher::DispatchStats;
use crate::types::{DumpProgress, ResumeMarker};

/// Lifecycle phase of a collection replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatorPhase {
    Idle,
    Dumping,
    PausedDuringDump,
    Tailing,
    /// The change stream failed and a recovery is scheduled.
    Error,
}

impl fmt::Display for ReplicatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicatorPhase::Idle => "idle",
            ReplicatorPhase::Dumping => "dumping",
            ReplicatorPhase::PausedDuringDump => "paused_during_dump",
            ReplicatorPhase::Tailing => "tailing",
            ReplicatorPhase::Error => "error",
        };

        f.write_str(name)
    }
}

/// What a change stream reset does besides reopening the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Delete the destination copy and dump the collection again before reopening.
    pub dump: bool,
    /// Reopen at the current end of the stream instead of the last known position.
    pub ignore_resume_marker: bool,
}

impl ResetOptions {
    /// Reconnect at the last known position.
    pub fn reconnect() -> Self {
        Self::default()
    }

    /// Rebuild the destination copy and tail from now.
    pub fn resync() -> Self {
        Self {
            dump: true,
            ignore_resume_marker: true,
        }
    }
}

/// Result of a dump pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    /// A previous pass completed and no document exists past its last key.
    AlreadyComplete,
    /// Nothing was left past the last key; the progress is now marked complete.
    MarkedComplete,
    Completed { documents: u64 },
}

/// Point in time view of a replicator, reported by the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicatorStatus {
    pub collection: String,
    pub phase: ReplicatorPhase,
    pub listening: bool,
    pub has_resume_marker: bool,
    pub dump_progress: Option<DumpProgress>,
    pub dispatch: DispatchStats,
}

#[derive(Debug)]
pub(super) struct FeedListener {
    pub(super) stop_tx: SignalTx,
    pub(super) handle: JoinHandle<()>,
}

#[derive(Debug)]
pub(super) struct RecoveryRequest {
    /// Generation of the change stream that failed.
    pub(super) generation: u64,
    pub(super) options: ResetOptions,
    /// Transient failures are retried with back-off.
    pub(super) transient: bool,
}

#[derive(Debug)]
pub(super) struct ReplicatorState {
    pub(super) phase: ReplicatorPhase,
    pub(super) marker: Option<ResumeMarker>,
    /// Whether `marker` reflects the store or a newer position.
    pub(super) marker_loaded: bool,
    pub(super) progress: Option<DumpProgress>,
    pub(super) listener: Option<FeedListener>,
    /// Incremented each time a change stream is opened.
    pub(super) generation: u64,
    /// Set on removal; no change stream is opened afterwards.
    pub(super) retired: bool,
    pub(super) consecutive_failures: u32,
}

impl ReplicatorState {
    pub(super) fn new() -> Self {
        Self {
            phase: ReplicatorPhase::Idle,
            marker: None,
            marker_loaded: false,
            progress: None,
            listener: None,
            generation: 0,
            retired: false,
            consecutive_failures: 0,
        }
    }

    pub(super) fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished())
    }
}
