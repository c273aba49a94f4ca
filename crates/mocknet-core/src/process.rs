//! Process-group tracking and force-kill.
//!
//! Nodes are launched in their own process group so a single `killpg`
//! takes down the node and everything it spawned. There is no cooperative
//! cancellation: stopping a node means SIGKILL to its group.
//!
//! # Invariants
//!
//! - [INV-PROC-001] A process group is published to the registry before
//!   any of its output is consumed.
//! - [INV-PROC-002] Spawning happens under the registry lock after the stop
//!   flag has been checked, so once cleanup has taken the lock no new node
//!   can appear.
//! - [INV-PROC-003] Killing a group that is already gone is a no-op.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::KillError;

/// One-way stop signal shared by the orchestrator and its tasks.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct StopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    /// Create a cleared flag.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. Idempotent.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once a stop was requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Re-arm the flag for a new run.
    pub(crate) fn clear(&self) {
        self.tx.send_replace(false);
    }

    /// Resolve once a stop is requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Outcome of a force-kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// SIGKILL was delivered to the group.
    Killed,
    /// The group had already exited.
    AlreadyGone,
}

/// Send SIGKILL to every process in group `pgid`.
///
/// # Errors
///
/// Returns an error for anything other than "no such process", which is
/// reported as [`KillOutcome::AlreadyGone`].
pub fn kill_process_group(pgid: i32) -> Result<KillOutcome, KillError> {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => {
            info!(pgid, "killed process group");
            Ok(KillOutcome::Killed)
        },
        Err(Errno::ESRCH) => {
            info!(pgid, "process group already gone");
            Ok(KillOutcome::AlreadyGone)
        },
        Err(source) => Err(KillError { pgid, source }),
    }
}

/// Returns `true` if any process in group `pgid` still exists.
///
/// Zombies count as existing until they are reaped.
#[must_use]
pub fn process_group_alive(pgid: i32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid), None), Err(Errno::ESRCH))
}

/// Process groups started during a run.
#[derive(Debug, Default)]
struct RegistryState {
    /// Groups not yet drained by cleanup.
    tracked: Vec<TrackedGroup>,
    /// Every group ever started, for post-run inspection.
    history: Vec<i32>,
}

/// A tracked node process group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedGroup {
    /// Label of the node that owns the group.
    pub label: String,
    /// Process group id (equal to the leader's pid).
    pub pgid: i32,
}

/// Registry of live process groups.
///
/// Append-only for supervisors, drain-only for cleanup.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` in a fresh process group and publish its group id.
    ///
    /// Returns `Ok(None)` without spawning if `stop` is already set. The
    /// flag check, the spawn and the publish happen under one lock.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the process could not be started.
    pub fn spawn_tracked(
        &self,
        label: &str,
        command: &mut Command,
        stop: &StopFlag,
    ) -> io::Result<Option<(Child, i32)>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if stop.is_set() {
            return Ok(None);
        }

        let child = command.process_group(0).spawn()?;
        let Some(pid) = child.id() else {
            return Err(io::Error::other("spawned process has no pid"));
        };
        let pgid = i32::try_from(pid).map_err(io::Error::other)?;

        state.tracked.push(TrackedGroup {
            label: label.to_string(),
            pgid,
        });
        state.history.push(pgid);
        Ok(Some((child, pgid)))
    }

    /// Remove and return every tracked group.
    #[must_use]
    pub fn drain(&self) -> Vec<TrackedGroup> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut state.tracked)
    }

    /// Kill every tracked group, logging failures instead of returning them.
    ///
    /// Returns the number of groups that were drained.
    pub fn kill_all(&self) -> usize {
        let groups = self.drain();
        for group in &groups {
            if let Err(err) = kill_process_group(group.pgid) {
                warn!(node = %group.label, error = %err, "failed to kill node");
            }
        }
        groups.len()
    }

    /// Number of groups awaiting cleanup.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracked
            .len()
    }

    /// Every group started since the last [`reset_history`](Self::reset_history).
    #[must_use]
    pub fn history(&self) -> Vec<i32> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    pub(crate) fn reset_history(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clear();
    }
}
