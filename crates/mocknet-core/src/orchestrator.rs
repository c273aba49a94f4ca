//! Cluster orchestrator.
//!
//! [`ClusterOrchestrator::run`] starts the test routine as its own task,
//! launches the nodes one by one while the routine is still running, waits
//! for the routine within the remaining time budget, and then cleans up.
//!
//! # Cleanup order
//!
//! Cleanup runs exactly once on every exit path (success, timeout, test
//! failure):
//!
//! 1. set the stop flag, so no supervisor spawns after this point
//! 2. drain the process registry and kill every process group
//! 3. wait (bounded) for the test routine to unwind
//! 4. release the supervisor pool
//! 5. release the log channel's consumer side
//!
//! If the `run` future itself is dropped before cleanup starts, a drop
//! guard still performs steps 1 and 2 synchronously.
//!
//! # Invariants
//!
//! - [INV-ORCH-001] Nodes launch in increasing index order, one stagger
//!   delay apart, and only while the test routine has not finished.
//! - [INV-ORCH-002] The remaining budget is computed when the wait starts
//!   and never goes negative.
//! - [INV-ORCH-003] Failures during cleanup are logged and never replace
//!   the run's own outcome.

use std::future::Future;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::channel::LogChannel;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult, SupervisorError};
use crate::monitor::LogMonitor;
use crate::ports::PortSlot;
use crate::process::{ProcessRegistry, StopFlag};
use crate::supervisor::{NodeSupervisor, node_label};

/// Time left of `timeout` after `uptime`, clamped at zero.
///
/// A zero budget still results in one wait on the test routine, so a
/// routine that has already finished is reported as such rather than as a
/// timeout.
#[must_use]
pub const fn remaining_budget(timeout: Duration, uptime: Duration) -> Duration {
    timeout.saturating_sub(uptime)
}

/// API addresses of launched nodes, indexed by launch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterAddresses {
    /// Admin API `ip:port` per node.
    pub admin: Vec<String>,
    /// Public API `ip:port` per node.
    pub public: Vec<String>,
    /// Mining API `ip:port` per node.
    pub mining: Vec<String>,
}

/// Handle given to the test routine.
///
/// Cheap to clone. Exposes read-only views of the cluster plus the log
/// channel the routine's [`LogMonitor`] consumes.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    stop: StopFlag,
    started_at: Instant,
    node_count: usize,
    addresses: Arc<RwLock<ClusterAddresses>>,
    channel: Arc<LogChannel>,
    abort_triggers: Vec<String>,
    ready_status: String,
    tick: Duration,
}

impl ClusterContext {
    /// Returns `true` until cleanup starts.
    #[must_use]
    pub fn running(&self) -> bool {
        !self.stop.is_set()
    }

    /// The run's stop flag.
    #[must_use]
    pub const fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    /// Time since the run started.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Number of nodes the run was configured with.
    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.node_count
    }

    /// Admin API addresses of the nodes launched so far.
    #[must_use]
    pub fn admin_addresses(&self) -> Vec<String> {
        self.read_addresses(|addresses| addresses.admin.clone())
    }

    /// Public API addresses of the nodes launched so far.
    #[must_use]
    pub fn public_addresses(&self) -> Vec<String> {
        self.read_addresses(|addresses| addresses.public.clone())
    }

    /// Mining API addresses of the nodes launched so far.
    #[must_use]
    pub fn mining_addresses(&self) -> Vec<String> {
        self.read_addresses(|addresses| addresses.mining.clone())
    }

    /// The shared log channel.
    #[must_use]
    pub fn log_channel(&self) -> Arc<LogChannel> {
        Arc::clone(&self.channel)
    }

    /// A monitor on this run's log channel, configured from the cluster
    /// config.
    ///
    /// Only one monitor should consume the channel at a time.
    #[must_use]
    pub fn monitor(&self) -> LogMonitor {
        LogMonitor::new(Arc::clone(&self.channel))
            .with_abort_triggers(self.abort_triggers.clone())
            .with_ready_status(self.ready_status.clone())
            .with_tick(self.tick)
    }

    fn read_addresses<R>(&self, read: impl FnOnce(&ClusterAddresses) -> R) -> R {
        let addresses = self
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        read(&addresses)
    }
}

/// Kills tracked nodes if a run is dropped before its cleanup ran.
struct CleanupGuard {
    stop: StopFlag,
    registry: Arc<ProcessRegistry>,
    armed: bool,
}

impl CleanupGuard {
    const fn new(stop: StopFlag, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            stop,
            registry,
            armed: true,
        }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("run dropped before cleanup, killing nodes");
            self.stop.set();
            self.registry.kill_all();
        }
    }
}

type SupervisorPool = JoinSet<Result<(), SupervisorError>>;

/// Top-level controller for one local cluster.
#[derive(Debug)]
pub struct ClusterOrchestrator {
    config: ClusterConfig,
    stop: StopFlag,
    registry: Arc<ProcessRegistry>,
    addresses: Arc<RwLock<ClusterAddresses>>,
    started_at: Option<Instant>,
}

impl ClusterOrchestrator {
    /// Create an orchestrator.
    ///
    /// Relative paths in `config` are resolved against the current
    /// directory. When `config.remove_data` is set, the data directory is
    /// removed here.
    #[must_use]
    pub fn new(mut config: ClusterConfig) -> Self {
        config.launcher = config.launcher.resolved();
        if let Ok(data_dir) = std::path::absolute(&config.data_dir) {
            config.data_dir = data_dir;
        }

        info!(
            node_count = config.node_count,
            timeout_secs = config.timeout.as_secs_f64(),
            data_dir = %config.data_dir.display(),
            "starting mocknet"
        );

        if config.remove_data {
            match std::fs::remove_dir_all(&config.data_dir) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    warn!(error = %err, data_dir = %config.data_dir.display(), "failed to remove data dir");
                },
                _ => {},
            }
        }

        Self {
            config,
            stop: StopFlag::new(),
            registry: Arc::new(ProcessRegistry::new()),
            addresses: Arc::new(RwLock::new(ClusterAddresses::default())),
            started_at: None,
        }
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Returns `true` while no stop has been requested.
    #[must_use]
    pub fn running(&self) -> bool {
        !self.stop.is_set()
    }

    /// Time since the last run started, or zero before the first run.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |started| started.elapsed())
    }

    /// Addresses recorded by the last run.
    #[must_use]
    pub fn addresses(&self) -> ClusterAddresses {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process group ids of every node started by the last run.
    #[must_use]
    pub fn launched_process_groups(&self) -> Vec<i32> {
        self.registry.history()
    }

    /// Run the configured preparation command, if any, to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Prepare`] if the command cannot be started or
    /// exits unsuccessfully.
    pub async fn prepare(&self) -> ClusterResult<()> {
        let Some(program) = &self.config.prepare_command else {
            return Ok(());
        };

        info!(command = %program.display(), "preparing source");
        let status = Command::new(program)
            .status()
            .await
            .map_err(|err| ClusterError::Prepare(format!("{}: {err}", program.display())))?;
        if !status.success() {
            return Err(ClusterError::Prepare(format!(
                "{} exited with {status}",
                program.display()
            )));
        }
        Ok(())
    }

    /// Run `test` against a freshly launched cluster.
    ///
    /// The routine starts immediately, before any node. Returns its value
    /// once it succeeds; in every case all node processes are killed before
    /// this returns.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::TimeoutExceeded`] if the routine is still running
    ///   when the time budget runs out.
    /// - [`ClusterError::TestFailed`] if the routine returns an error,
    ///   including an abort raised by its monitor.
    /// - [`ClusterError::TestPanicked`] if the routine panics.
    /// - [`ClusterError::Config`] if the configuration is invalid; nothing
    ///   is started in that case.
    pub async fn run<F, Fut, T>(&mut self, test: F) -> ClusterResult<T>
    where
        F: FnOnce(ClusterContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.config.validate()?;

        info!("run");
        self.stop.clear();
        self.registry.reset_history();
        *self
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner) = ClusterAddresses::default();

        let started_at = Instant::now();
        self.started_at = Some(started_at);
        let channel = Arc::new(LogChannel::new(self.config.log_capacity));

        let context = ClusterContext {
            stop: self.stop.clone(),
            started_at,
            node_count: self.config.node_count,
            addresses: Arc::clone(&self.addresses),
            channel: Arc::clone(&channel),
            abort_triggers: self.config.abort_triggers.clone(),
            ready_status: self.config.ready_status.clone(),
            tick: self.config.tick,
        };
        let mut test_task = tokio::spawn(test(context));

        let mut guard = CleanupGuard::new(self.stop.clone(), Arc::clone(&self.registry));
        let mut pool = SupervisorPool::new();

        let outcome = self
            .drive(&mut test_task, &mut pool, &channel, started_at)
            .await;

        self.clean_up(test_task, pool, &channel).await;
        guard.disarm();
        outcome
    }

    /// Launch nodes, then wait for the test routine within the budget.
    async fn drive<T>(
        &self,
        test_task: &mut JoinHandle<anyhow::Result<T>>,
        pool: &mut SupervisorPool,
        channel: &Arc<LogChannel>,
        started_at: Instant,
    ) -> ClusterResult<T> {
        for index in 0..self.config.node_count {
            if test_task.is_finished() {
                info!(
                    launched = index,
                    "test routine finished, not launching more nodes"
                );
                break;
            }

            info!(node = %node_label(index), "launch node");
            self.record_addresses(index);
            let supervisor = NodeSupervisor::new(
                index,
                &self.config,
                Arc::clone(channel),
                Arc::clone(&self.registry),
            );
            pool.spawn(supervisor.launch(self.stop.clone()));
            tokio::time::sleep(self.config.stagger_delay).await;
        }

        let remaining = remaining_budget(self.config.timeout, started_at.elapsed());
        info!(
            remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
            "waiting for test routine"
        );

        match tokio::time::timeout(remaining, &mut *test_task).await {
            Err(_elapsed) => {
                error!(timeout_secs = self.config.timeout.as_secs_f64(), "TIMEOUT");
                Err(ClusterError::TimeoutExceeded {
                    timeout: self.config.timeout,
                })
            },
            Ok(Err(join_err)) => {
                error!(error = %join_err, "exception detected");
                Err(ClusterError::TestPanicked(join_err.to_string()))
            },
            Ok(Ok(Err(err))) => {
                let message = format!("{err:#}");
                error!(error = %message, "exception detected");
                Err(ClusterError::TestFailed(err))
            },
            Ok(Ok(Ok(value))) => {
                info!(uptime_secs = started_at.elapsed().as_secs_f64(), "finished");
                Ok(value)
            },
        }
    }

    fn record_addresses(&self, index: usize) {
        let ports = &self.config.ports;
        let host = &self.config.host;
        let mut addresses = self
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        addresses
            .admin
            .push(ports.address(host, index, PortSlot::AdminApi));
        addresses
            .public
            .push(ports.address(host, index, PortSlot::PublicApi));
        addresses
            .mining
            .push(ports.address(host, index, PortSlot::MiningApi));
    }

    /// Ordered teardown. Never fails; problems are logged.
    async fn clean_up<T>(
        &self,
        mut test_task: JoinHandle<anyhow::Result<T>>,
        mut pool: SupervisorPool,
        channel: &LogChannel,
    ) {
        info!("cleaning up");
        self.stop.set();
        let killed = self.registry.kill_all();
        debug!(killed, "killed tracked process groups");

        info!("waiting");
        let grace = self.config.cleanup_grace;
        if !test_task.is_finished() {
            match tokio::time::timeout(grace, &mut test_task).await {
                Ok(Ok(Err(err))) => {
                    let message = format!("{err:#}");
                    debug!(error = %message, "test routine unwound with error");
                },
                Ok(Err(join_err)) => {
                    warn!(error = %join_err, "test routine panicked while unwinding");
                },
                Ok(Ok(Ok(_))) => {},
                Err(_elapsed) => {
                    warn!(
                        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                        "test routine still running after grace period, detaching"
                    );
                },
            }
        }
        info!("monitor done");

        release_pool(&mut pool, grace).await;
        channel.release_consumer().await;

        let dropped = channel.dropped();
        if dropped > 0 {
            warn!(dropped, "log lines were dropped during the run");
        }
        info!("clean up finished");
    }
}

/// Wait (bounded) for supervisors to finish, logging their failures, then
/// abort whatever is left.
async fn release_pool(pool: &mut SupervisorPool, grace: Duration) {
    let drained = tokio::time::timeout(grace, async {
        while let Some(result) = pool.join_next().await {
            match result {
                Ok(Ok(())) => {},
                Ok(Err(err)) => error!(error = %err, "node supervisor failed"),
                Err(join_err) => error!(error = %join_err, "node supervisor panicked"),
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = pool.len(),
            "node supervisors still running after grace period, aborting"
        );
    }
    pool.shutdown().await;
}
