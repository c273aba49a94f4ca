//! mocknet-core - local multi-node test clusters.
//!
//! Launches a small cluster of node processes on one host, runs a test
//! routine against it, and tears everything down within a time budget.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │ ClusterOrchestrator  │  run(), timeout, cleanup
//!                 └──────────┬───────────┘
//!          spawns            │            spawns
//!   ┌────────────────────────┼─────────────────────────┐
//!   ▼                        ▼                         ▼
//! NodeSupervisor 0 ... NodeSupervisor N-1        test routine
//!   │ stdout/stderr lines                           │
//!   └────────────► LogChannel ──────────────► LogMonitor
//! ```
//!
//! - [`ports`]: `(node, slot) -> port` mapping
//! - [`node_config`]: per-node YAML config
//! - [`channel`]: shared, bounded log queue
//! - [`process`]: stop flag, process-group registry, force-kill
//! - [`supervisor`]: one node's lifecycle
//! - [`monitor`]: status table and abort detection
//! - [`orchestrator`]: the run loop and ordered cleanup
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mocknet_core::{ClusterConfig, ClusterOrchestrator, NodeLauncher};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ClusterConfig::new(4)
//!     .with_timeout(Duration::from_secs(600))
//!     .with_launcher(NodeLauncher::new("./run_node.sh"));
//! let mut cluster = ClusterOrchestrator::new(config);
//!
//! let synced = cluster
//!     .run(|ctx| async move {
//!         let mut monitor = ctx.monitor();
//!         while ctx.running() && monitor.synced_count() < ctx.node_count() {
//!             monitor.track().await?;
//!         }
//!         Ok::<_, anyhow::Error>(monitor.synced_count())
//!     })
//!     .await?;
//! assert_eq!(synced, 4);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod monitor;
pub mod node_config;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod supervisor;

pub use channel::{LogChannel, LogLine};
pub use config::{ClusterConfig, NodeLauncher};
pub use error::{
    ClusterError, ClusterResult, ConfigError, KillError, MonitorError, SupervisorError,
};
pub use monitor::LogMonitor;
pub use node_config::NodeConfig;
pub use orchestrator::{ClusterAddresses, ClusterContext, ClusterOrchestrator};
pub use ports::{PortAllocator, PortSlot};
pub use process::{ProcessRegistry, StopFlag};
pub use supervisor::NodeSupervisor;
