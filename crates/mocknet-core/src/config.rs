//! Cluster configuration.
//!
//! [`ClusterConfig`] collects everything a run needs: how many nodes, how
//! long the test may take, how nodes are launched, and what the log
//! monitor treats as fatal. Defaults describe a local cluster on
//! `127.0.0.1` starting at port 10000.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::channel::DEFAULT_LOG_CAPACITY;
use crate::error::ConfigError;
use crate::ports::{LOCALHOST_IP, PortAllocator, PortSlot};

/// Default time budget for a run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause between successive node launches.
pub const DEFAULT_STAGGER_DELAY: Duration = Duration::from_secs(2);

/// How long the monitor waits for a line before reporting an empty tick.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// How long cleanup waits for the test routine and supervisors to unwind.
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// Status a node reports once it has caught up with the network.
pub const DEFAULT_READY_STATUS: &str = "synced";

/// Flag passed to the launcher ahead of the node directory.
pub const DEFAULT_DATA_DIR_FLAG: &str = "--data-dir";

/// Marker printed when a gRPC call terminated with an unknown status.
pub const RPC_TERMINATED_MARKER: &str = "<_Rendezvous of RPC that terminated with (StatusCode.UNKNOWN";

/// Marker printed when the node process itself crashed.
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// Abort triggers used when none are configured.
#[must_use]
pub fn default_abort_triggers() -> Vec<String> {
    vec![RPC_TERMINATED_MARKER.to_string(), TRACEBACK_MARKER.to_string()]
}

/// External program that starts one node.
///
/// The command line is
/// `program [leading_args..] [data_dir_flag] <node_dir> [extra_args..]`,
/// run with `<node_dir>` as the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLauncher {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments placed before the data-dir flag.
    pub leading_args: Vec<String>,
    /// Flag preceding the node directory; `None` passes the directory bare.
    pub data_dir_flag: Option<String>,
    /// Opaque extra arguments, split on whitespace.
    pub extra_args: String,
}

impl Default for NodeLauncher {
    fn default() -> Self {
        Self::new("./run_node.sh")
    }
}

impl NodeLauncher {
    /// Launch nodes with `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            data_dir_flag: Some(DEFAULT_DATA_DIR_FLAG.to_string()),
            extra_args: String::new(),
        }
    }

    /// Launch nodes with an inline `sh -c` script.
    ///
    /// Inside the script `$1` is the data-dir flag and `$2` the node
    /// directory.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            leading_args: vec!["-c".to_string(), script.into(), "mocknet-node".to_string()],
            ..Self::new("sh")
        }
    }

    /// Set the flag preceding the node directory.
    #[must_use]
    pub fn with_data_dir_flag(mut self, flag: Option<String>) -> Self {
        self.data_dir_flag = flag;
        self
    }

    /// Set the extra arguments appended to every launch.
    #[must_use]
    pub fn with_extra_args(mut self, args: impl Into<String>) -> Self {
        self.extra_args = args.into();
        self
    }

    /// Resolve a relative program path containing a directory against the
    /// current directory, so it does not depend on the node's working
    /// directory. Bare program names are left for `PATH` lookup.
    #[must_use]
    pub fn resolved(mut self) -> Self {
        if self.program.is_relative() && self.program.components().count() > 1 {
            if let Ok(program) = std::path::absolute(&self.program) {
                self.program = program;
            }
        }
        self
    }

    /// Build the launch command for a node living in `node_dir`.
    #[must_use]
    pub fn command(&self, node_dir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        if let Some(flag) = &self.data_dir_flag {
            command.arg(flag);
        }
        command
            .arg(node_dir)
            .args(self.extra_args.split_whitespace())
            .current_dir(node_dir);
        command
    }
}

/// Configuration for one cluster run.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes to launch.
    pub node_count: usize,

    /// Time budget for the test routine, measured from the start of the run.
    pub timeout: Duration,

    /// Pause after each node launch.
    pub stagger_delay: Duration,

    /// Root directory holding one subdirectory per node.
    pub data_dir: PathBuf,

    /// Remove `data_dir` when the orchestrator is created.
    pub remove_data: bool,

    /// How nodes are started.
    pub launcher: NodeLauncher,

    /// Port layout.
    pub ports: PortAllocator,

    /// Address nodes listen on.
    pub host: String,

    /// Substrings in node output that abort the run.
    pub abort_triggers: Vec<String>,

    /// Status token meaning "node is ready".
    pub ready_status: String,

    /// Maximum unread lines held by the log channel.
    pub log_capacity: usize,

    /// Monitor poll timeout.
    pub tick: Duration,

    /// Bounded wait for tasks to unwind during cleanup.
    pub cleanup_grace: Duration,

    /// Command run by [`ClusterOrchestrator::prepare`] before a run.
    ///
    /// [`ClusterOrchestrator::prepare`]: crate::orchestrator::ClusterOrchestrator::prepare
    pub prepare_command: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_count: 0,
            timeout: DEFAULT_TIMEOUT,
            stagger_delay: DEFAULT_STAGGER_DELAY,
            data_dir: PathBuf::from("tmp").join("data"),
            remove_data: true,
            launcher: NodeLauncher::default(),
            ports: PortAllocator::default(),
            host: LOCALHOST_IP.to_string(),
            abort_triggers: default_abort_triggers(),
            ready_status: DEFAULT_READY_STATUS.to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            tick: DEFAULT_TICK,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            prepare_command: None,
        }
    }
}

impl ClusterConfig {
    /// Create a config for `node_count` nodes with default settings.
    #[must_use]
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            ..Default::default()
        }
    }

    /// Set the number of nodes.
    #[must_use]
    pub const fn with_node_count(mut self, node_count: usize) -> Self {
        self.node_count = node_count;
        self
    }

    /// Set the run's time budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause between node launches.
    #[must_use]
    pub const fn with_stagger_delay(mut self, delay: Duration) -> Self {
        self.stagger_delay = delay;
        self
    }

    /// Set the cluster data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Keep or remove existing data when the orchestrator is created.
    #[must_use]
    pub const fn with_remove_data(mut self, remove_data: bool) -> Self {
        self.remove_data = remove_data;
        self
    }

    /// Set the node launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: NodeLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Set the port layout.
    #[must_use]
    pub const fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Replace the abort triggers.
    #[must_use]
    pub fn with_abort_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abort_triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the status token that counts as ready.
    #[must_use]
    pub fn with_ready_status(mut self, status: impl Into<String>) -> Self {
        self.ready_status = status.into();
        self
    }

    /// Set the log channel capacity.
    #[must_use]
    pub const fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Set the monitor tick.
    #[must_use]
    pub const fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the cleanup grace period.
    #[must_use]
    pub const fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    /// Set the preparation command.
    #[must_use]
    pub fn with_prepare_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.prepare_command = Some(command.into());
        self
    }

    /// Check that the configuration can be run.
    ///
    /// # Errors
    ///
    /// Returns an error if the port stride is narrower than the port slots,
    /// the last node's ports run past 65535, or the launcher is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.ports_per_node() < PortSlot::COUNT {
            return Err(ConfigError::PortStrideTooSmall {
                min: PortSlot::COUNT,
                actual: self.ports.ports_per_node(),
            });
        }

        if let Some(last) = self.node_count.checked_sub(1) {
            let port = self.ports.port_wide(last, PortSlot::GrpcProxy);
            if port > u32::from(u16::MAX) {
                return Err(ConfigError::PortRangeExhausted {
                    node_index: last,
                    port,
                });
            }
        }

        if self.launcher.program.as_os_str().is_empty() {
            return Err(ConfigError::EmptyLauncher);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_local_cluster() {
        let config = ClusterConfig::default();
        assert_eq!(config.node_count, 0);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.stagger_delay, Duration::from_secs(2));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.ready_status, "synced");
        assert_eq!(config.abort_triggers.len(), 2);
        assert!(config.remove_data);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_narrow_stride() {
        let config = ClusterConfig::new(2).with_ports(PortAllocator::new(10_000, 3));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortStrideTooSmall { min: 5, actual: 3 })
        ));
    }

    #[test]
    fn rejects_exhausted_port_range() {
        let config = ClusterConfig::new(10).with_ports(PortAllocator::new(65_500, 5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortRangeExhausted { node_index: 9, .. })
        ));

        let config = ClusterConfig::new(7).with_ports(PortAllocator::new(65_500, 5));
        config.validate().unwrap();
    }

    #[test]
    fn launcher_command_line() {
        let launcher = NodeLauncher::new("/opt/node/run.sh").with_extra_args("--quiet  --mocknet");
        let command = launcher.command(Path::new("/tmp/data/node003"));
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "/opt/node/run.sh");
        let args: Vec<_> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["--data-dir", "/tmp/data/node003", "--quiet", "--mocknet"]
        );
        assert_eq!(
            std_command.get_current_dir(),
            Some(Path::new("/tmp/data/node003"))
        );
    }

    #[test]
    fn shell_launcher_without_flag() {
        let launcher = NodeLauncher::shell("echo $2").with_data_dir_flag(None);
        let command = launcher.command(Path::new("/tmp/n"));
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["-c", "echo $2", "mocknet-node", "/tmp/n"]);
    }
}
