//! mocknet - run a local node cluster and watch its output.
//!
//! Launches the configured number of nodes and tails their combined
//! output until the time budget runs out or an abort trigger fires. Both
//! end the run with a non-zero exit status; the nodes are killed either
//! way.
//!
//! Configuration comes from the environment:
//!
//! | Variable                | Default          |
//! |-------------------------|------------------|
//! | `MOCKNET_NODE_COUNT`    | `4`              |
//! | `MOCKNET_TIMEOUT_SECS`  | `600`            |
//! | `MOCKNET_LAUNCHER`      | `./run_node.sh`  |
//! | `MOCKNET_DATA_DIR_FLAG` | `--data-dir`     |
//! | `MOCKNET_NODE_ARGS`     | empty            |
//! | `MOCKNET_DATA_DIR`      | `tmp/data`       |
//! | `MOCKNET_PREPARE`       | unset            |
//! | `MOCKNET_KEEP_DATA`     | unset            |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use mocknet_core::{ClusterConfig, ClusterOrchestrator, NodeLauncher};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = cluster_config_from_env()?;
    let mut orchestrator = ClusterOrchestrator::new(config);
    orchestrator
        .prepare()
        .await
        .context("failed to prepare node sources")?;

    let result = orchestrator
        .run(|ctx| async move {
            let mut monitor = ctx.monitor();
            monitor.run_until_stopped(ctx.stop_flag()).await?;
            Ok::<_, anyhow::Error>(monitor.synced_count())
        })
        .await;

    match result {
        Ok(synced) => {
            info!(synced, "cluster run finished");
            Ok(())
        },
        Err(err) => {
            error!(error = %err, "cluster run failed");
            Err(err.into())
        },
    }
}

fn cluster_config_from_env() -> Result<ClusterConfig> {
    let node_count = parse_env("MOCKNET_NODE_COUNT", 4_usize)?;
    let timeout_secs = parse_env("MOCKNET_TIMEOUT_SECS", 600_u64)?;

    let launcher = env::var("MOCKNET_LAUNCHER")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map_or_else(NodeLauncher::default, NodeLauncher::new);
    let launcher = match env::var("MOCKNET_DATA_DIR_FLAG") {
        Ok(flag) if flag.trim().is_empty() => launcher.with_data_dir_flag(None),
        Ok(flag) => launcher.with_data_dir_flag(Some(flag)),
        Err(_) => launcher,
    };
    let launcher = launcher.with_extra_args(env::var("MOCKNET_NODE_ARGS").unwrap_or_default());

    let mut config = ClusterConfig::new(node_count)
        .with_timeout(Duration::from_secs(timeout_secs))
        .with_launcher(launcher)
        .with_remove_data(env::var_os("MOCKNET_KEEP_DATA").is_none());

    if let Ok(data_dir) = env::var("MOCKNET_DATA_DIR") {
        if !data_dir.trim().is_empty() {
            config = config.with_data_dir(PathBuf::from(data_dir));
        }
    }

    if let Ok(prepare) = env::var("MOCKNET_PREPARE") {
        if !prepare.trim().is_empty() {
            config = config.with_prepare_command(prepare);
        }
    }

    config.validate().context("invalid cluster configuration")?;
    Ok(config)
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("failed to parse {name}")),
        _ => Ok(default),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
