//! Error types for the cluster harness.
//!
//! Each concern gets its own error enum so callers can tell a node that
//! failed to start apart from a cluster that ran out of time:
//!
//! - [`ConfigError`]: the cluster configuration cannot be used.
//! - [`SupervisorError`]: a node could not be prepared, spawned or read.
//!   Local to that node's supervisor task.
//! - [`KillError`]: a process group could not be signalled. Logged during
//!   cleanup, never raised past the original failure.
//! - [`MonitorError`]: an abort trigger was seen in node output.
//! - [`ClusterError`]: what [`ClusterOrchestrator::run`] surfaces.
//!
//! [`ClusterOrchestrator::run`]: crate::orchestrator::ClusterOrchestrator::run

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Invalid cluster configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port stride is zero, so every node would share the same ports.
    #[error("ports_per_node must be at least {min}, got {actual}")]
    PortStrideTooSmall {
        /// Minimum stride required by the port slots.
        min: u16,
        /// Configured stride.
        actual: u16,
    },

    /// The last node's highest port does not fit in a TCP port number.
    #[error("port range exhausted: node {node_index} would need port {port}")]
    PortRangeExhausted {
        /// Index of the first node that does not fit.
        node_index: usize,
        /// Port number that would have been allocated.
        port: u32,
    },

    /// No launcher program was configured.
    #[error("node launcher program is empty")]
    EmptyLauncher,
}

/// Errors raised by a single node supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The node's working directory could not be created.
    #[error("failed to create node directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The node configuration could not be serialized.
    #[error("failed to serialize node config: {0}")]
    SerializeConfig(#[from] serde_yaml::Error),

    /// The node configuration file could not be written.
    #[error("failed to write node config {path}: {source}")]
    WriteConfig {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The launcher could not be started.
    #[error("failed to spawn {label}: {source}")]
    Spawn {
        /// Node label, e.g. `Node 3`.
        label: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Reading the node's output failed.
    #[error("failed to read output of {label}: {source}")]
    Output {
        /// Node label.
        label: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Waiting for the node process to exit failed.
    #[error("failed to wait for {label}: {source}")]
    Wait {
        /// Node label.
        label: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// A process group could not be killed.
///
/// A group that is already gone is not an error; see
/// [`kill_process_group`](crate::process::kill_process_group).
#[derive(Debug, thiserror::Error)]
#[error("failed to kill process group {pgid}: {source}")]
pub struct KillError {
    /// Process group id that was targeted.
    pub pgid: i32,
    /// Errno returned by `killpg`.
    #[source]
    pub source: nix::Error,
}

/// Errors raised by the log monitor loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// An abort trigger was observed and the channel has since gone quiet.
    #[error("ABORT TRIGGERED: node output matched {trigger:?}")]
    AbortTriggered {
        /// The trigger substring that matched first.
        trigger: String,
    },
}

/// Errors surfaced by a cluster run.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The test routine did not finish within the run's time budget.
    #[error("test routine did not finish within {timeout:?}")]
    TimeoutExceeded {
        /// Configured time budget.
        timeout: Duration,
    },

    /// The test routine returned an error, including an abort raised by a
    /// [`LogMonitor`](crate::monitor::LogMonitor).
    #[error("test routine failed: {0:#}")]
    TestFailed(#[source] anyhow::Error),

    /// The test routine panicked or was cancelled.
    #[error("test routine panicked: {0}")]
    TestPanicked(String),

    /// The preparation command could not run or exited unsuccessfully.
    #[error("prepare command failed: {0}")]
    Prepare(String),

    /// The cluster configuration was rejected before anything started.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClusterError {
    /// Returns `true` if the run failed because an abort trigger fired.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::TestFailed(err)
                if matches!(err.downcast_ref::<MonitorError>(), Some(MonitorError::AbortTriggered { .. }))
        )
    }

    /// Returns `true` if the run ran out of time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutExceeded { .. })
    }
}

/// Result alias for cluster runs.
pub type ClusterResult<T> = Result<T, ClusterError>;
