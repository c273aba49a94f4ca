//! Log monitor: the single consumer of the shared log channel.
//!
//! Each call to [`LogMonitor::track`] is one tick: pop one line (or time
//! out), update the per-node status table, and scan for abort triggers.
//!
//! # State machine
//!
//! ```text
//! RUNNING --line seen--> RUNNING
//! RUNNING --trigger matched--> RUNNING (abort pending)
//! abort pending --empty tick--> ABORTED (track returns Err)
//! ```
//!
//! A trigger match is not fatal on the tick that sees it. The monitor keeps
//! reading until the channel goes quiet, so the lines that follow a crash
//! are still consumed before the run is aborted.
//!
//! # Status lines
//!
//! A line is a status update when it has at least four `|`-separated
//! fields. Field 0 (trimmed) is the node label and field 3 (trimmed) the
//! new status. The latest update always wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::channel::{LogChannel, LogLine};
use crate::config::{DEFAULT_READY_STATUS, DEFAULT_TICK, default_abort_triggers};
use crate::error::MonitorError;
use crate::process::StopFlag;

/// Status reported for nodes that have not logged a status line yet.
pub const UNKNOWN_STATUS: &str = "unknown";

/// Pause after an empty tick before the next poll.
const IDLE_PAUSE: Duration = Duration::from_millis(50);

/// Minimum number of `|`-separated fields in a status line.
const STATUS_FIELDS: usize = 4;

/// Split a status line into `(node id, status)`.
///
/// Returns `None` for lines with fewer than four fields.
#[must_use]
pub fn parse_status_line(text: &str) -> Option<(&str, &str)> {
    let fields: Vec<&str> = text.split('|').collect();
    if fields.len() < STATUS_FIELDS {
        return None;
    }
    Some((fields[0].trim(), fields[3].trim()))
}

/// Consumes node output, tracks node status and detects abort triggers.
#[derive(Debug)]
pub struct LogMonitor {
    channel: Arc<LogChannel>,
    abort_triggers: Vec<String>,
    ready_status: String,
    tick: Duration,
    echo: bool,
    node_status: HashMap<String, String>,
    abort_trigger: Option<String>,
}

impl LogMonitor {
    /// Create a monitor on `channel` with default triggers and tick.
    #[must_use]
    pub fn new(channel: Arc<LogChannel>) -> Self {
        Self {
            channel,
            abort_triggers: default_abort_triggers(),
            ready_status: DEFAULT_READY_STATUS.to_string(),
            tick: DEFAULT_TICK,
            echo: true,
            node_status: HashMap::new(),
            abort_trigger: None,
        }
    }

    /// Replace the abort triggers.
    #[must_use]
    pub fn with_abort_triggers(mut self, triggers: Vec<String>) -> Self {
        self.abort_triggers = triggers;
        self
    }

    /// Set the status token counted by [`synced_count`](Self::synced_count).
    #[must_use]
    pub fn with_ready_status(mut self, status: impl Into<String>) -> Self {
        self.ready_status = status.into();
        self
    }

    /// Set how long one tick waits for a line.
    #[must_use]
    pub const fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Echo consumed lines to the `mocknet::node` log target.
    #[must_use]
    pub const fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Run one tick.
    ///
    /// Returns the consumed line, or `None` if the tick was empty.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::AbortTriggered`] on the first empty tick
    /// after an abort trigger was seen.
    pub async fn track(&mut self) -> Result<Option<LogLine>, MonitorError> {
        let Some(line) = self.channel.pop(self.tick).await else {
            if let Some(trigger) = &self.abort_trigger {
                return Err(MonitorError::AbortTriggered {
                    trigger: trigger.clone(),
                });
            }
            tokio::time::sleep(IDLE_PAUSE).await;
            return Ok(None);
        };

        self.observe(&line);
        Ok(Some(line))
    }

    /// Apply one line to the status table and the abort check.
    fn observe(&mut self, line: &LogLine) {
        if let Some((node_id, status)) = parse_status_line(&line.raw_text) {
            self.node_status
                .insert(node_id.to_string(), status.to_string());
        }

        if self.echo {
            info!(target: "mocknet::node", "{}", line.raw_text);
        }

        if self.abort_trigger.is_none() {
            if let Some(trigger) = self
                .abort_triggers
                .iter()
                .find(|trigger| line.raw_text.contains(trigger.as_str()))
            {
                info!(node = %line.node_id, trigger = %trigger, "abort trigger matched");
                self.abort_trigger = Some(trigger.clone());
            }
        }
    }

    /// Call [`track`](Self::track) until `stop` is set.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::AbortTriggered`] if an abort fires first.
    pub async fn run_until_stopped(&mut self, stop: &StopFlag) -> Result<(), MonitorError> {
        while !stop.is_set() {
            self.track().await?;
        }
        Ok(())
    }

    /// Number of nodes whose latest status is the ready status.
    #[must_use]
    pub fn synced_count(&self) -> usize {
        self.node_status
            .values()
            .filter(|status| **status == self.ready_status)
            .count()
    }

    /// Latest status of `node_id`, or `"unknown"`.
    #[must_use]
    pub fn get_status(&self, node_id: &str) -> &str {
        self.node_status
            .get(node_id)
            .map_or(UNKNOWN_STATUS, String::as_str)
    }

    /// Returns `true` once an abort trigger has matched.
    #[must_use]
    pub const fn abort_requested(&self) -> bool {
        self.abort_trigger.is_some()
    }
}
