//! Lifecycle of a single node process.
//!
//! A [`NodeSupervisor`] writes the node's configuration, launches it in its
//! own process group, forwards every output line into the shared
//! [`LogChannel`], and force-kills the group once the cluster is stopping.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

use crate::channel::{LogChannel, LogLine};
use crate::config::{ClusterConfig, NodeLauncher};
use crate::error::SupervisorError;
use crate::node_config::{NodeConfig, node_data_dir};
use crate::process::{ProcessRegistry, StopFlag, kill_process_group};

/// Label used for node `index` in log lines, e.g. `Node 3` or `Node12`.
#[must_use]
pub fn node_label(index: usize) -> String {
    format!("Node{index:2}")
}

/// Supervises one node from launch until exit or kill.
#[derive(Debug)]
pub struct NodeSupervisor {
    label: String,
    config: NodeConfig,
    node_dir: PathBuf,
    launcher: NodeLauncher,
    channel: Arc<LogChannel>,
    registry: Arc<ProcessRegistry>,
}

impl NodeSupervisor {
    /// Prepare a supervisor for node `index` of `cluster`.
    #[must_use]
    pub fn new(
        index: usize,
        cluster: &ClusterConfig,
        channel: Arc<LogChannel>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            label: node_label(index),
            config: NodeConfig::for_node(&cluster.ports, &cluster.host, index),
            node_dir: node_data_dir(&cluster.data_dir, index),
            launcher: cluster.launcher.clone(),
            channel,
            registry,
        }
    }

    /// Configuration this node is launched with.
    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run the node until its output closes or `stop` is set.
    ///
    /// Does not spawn anything if `stop` is already set when the spawn step
    /// is reached. Returns once the node has exited and been reaped.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be written, the launcher cannot
    /// be started, or the node's output cannot be read. A node that was
    /// spawned stays in the registry, so cleanup still kills it.
    pub async fn launch(self, stop: StopFlag) -> Result<(), SupervisorError> {
        let config_path = self.config.write_to(&self.node_dir)?;
        debug!(node = %self.label, config = %config_path.display(), "wrote node config");

        let mut command = self.launcher.command(&self.node_dir);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let spawned = self
            .registry
            .spawn_tracked(&self.label, &mut command, &stop)
            .map_err(|source| SupervisorError::Spawn {
                label: self.label.clone(),
                source,
            })?;
        let Some((mut child, pgid)) = spawned else {
            info!(node = %self.label, "stop requested, skipping launch");
            return Ok(());
        };
        info!(node = %self.label, pgid, "node started");

        let stdout = child.stdout.take().map(LineReader::new);
        let stderr = child.stderr.take().map(LineReader::new);
        let streamed = self.forward_output(stdout, stderr, &stop).await;

        if stop.is_set() {
            self.force_stop(pgid);
        }

        let status = tokio::select! {
            status = child.wait() => status,
            () = stop.wait() => {
                self.force_stop(pgid);
                child.wait().await
            }
        }
        .map_err(|source| SupervisorError::Wait {
            label: self.label.clone(),
            source,
        })?;
        self.log_exit(status, &stop);

        streamed
    }

    /// Forward output lines until both streams close or `stop` is set.
    ///
    /// The stop flag is checked again before every push, so a line read
    /// after the stop was requested is never enqueued.
    async fn forward_output<O, E>(
        &self,
        mut stdout: Option<LineReader<O>>,
        mut stderr: Option<LineReader<E>>,
        stop: &StopFlag,
    ) -> Result<(), SupervisorError>
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        while stdout.is_some() || stderr.is_some() {
            let read = tokio::select! {
                () = stop.wait() => break,
                line = next_line(&mut stdout) => line,
                line = next_line(&mut stderr) => line,
            };

            let line = match read {
                Ok(Some(line)) => line,
                // One stream closed; keep draining the other.
                Ok(None) => continue,
                Err(source) => {
                    return Err(SupervisorError::Output {
                        label: self.label.clone(),
                        source,
                    });
                },
            };

            if stop.is_set() {
                break;
            }
            self.channel.push(LogLine::new(
                self.label.clone(),
                format!("{} | {line}", self.label),
            ));
        }
        Ok(())
    }

    /// Kill the node's whole process group. Already-dead groups are fine.
    fn force_stop(&self, pgid: i32) {
        if let Err(err) = kill_process_group(pgid) {
            warn!(node = %self.label, error = %err, "failed to kill node");
        }
    }

    fn log_exit(&self, status: ExitStatus, stop: &StopFlag) {
        if status.success() || stop.is_set() {
            info!(node = %self.label, status = %status, "node exited");
        } else {
            warn!(node = %self.label, status = %status, "node exited with error");
        }
    }
}

/// Line reader that tolerates output that is not valid UTF-8.
///
/// Partial lines stay in `buf` between calls, so a read cancelled by
/// `select!` loses nothing.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its `\n` or `\r\n`, invalid bytes replaced.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.reader.read_until(b'\n', &mut self.buf).await?;
        if self.buf.is_empty() {
            return Ok(None);
        }
        let line = trim_line_ending(&self.buf);
        let line = String::from_utf8_lossy(line).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Read the next line from `lines`, clearing it at end of stream.
///
/// Never resolves once the stream is gone, so a closed stream drops out of
/// the surrounding `select!`.
async fn next_line<R>(lines: &mut Option<LineReader<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = lines.as_mut() else {
        return std::future::pending().await;
    };
    let line = reader.next_line().await;
    if matches!(line, Ok(None)) {
        *lines = None;
    }
    line
}
