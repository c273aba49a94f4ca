//! End-to-end cluster runs against `/bin/sh` node stand-ins.
//!
//! Each test launches real processes through the orchestrator and checks
//! that nothing outlives the run, whatever its outcome.
//!
//! Test command: `cargo test -p mocknet-core --test cluster_lifecycle`

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mocknet_core::config::TRACEBACK_MARKER;
use mocknet_core::node_config::{CONFIG_FILE_NAME, node_data_dir};
use mocknet_core::process::process_group_alive;
use mocknet_core::{ClusterConfig, ClusterError, ClusterOrchestrator, NodeConfig, NodeLauncher};
use tempfile::TempDir;

/// Node that reports itself synced and then idles.
const SYNCING_NODE: &str = "echo 'info | x | synced'; exec sleep 30";

/// Node that idles without output.
const IDLE_NODE: &str = "exec sleep 30";

fn cluster(tmp: &TempDir, node_count: usize, script: &str) -> ClusterConfig {
    ClusterConfig::new(node_count)
        .with_data_dir(tmp.path().join("data"))
        .with_launcher(NodeLauncher::shell(script))
        .with_stagger_delay(Duration::from_millis(100))
        .with_tick(Duration::from_millis(100))
        .with_cleanup_grace(Duration::from_millis(500))
}

/// Poll until every group is gone or `grace` elapses.
async fn assert_all_dead(pgids: &[i32], grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        let alive: Vec<i32> = pgids
            .iter()
            .copied()
            .filter(|pgid| process_group_alive(*pgid))
            .collect();
        if alive.is_empty() {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "process groups survived the run: {alive:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn read_node_config(data_dir: &Path, index: usize) -> Result<NodeConfig> {
    let path = node_data_dir(data_dir, index).join(CONFIG_FILE_NAME);
    let content = std::fs::read_to_string(&path).context("read config.yml")?;
    serde_yaml::from_str(&content).context("parse config.yml")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_nodes_returns_immediately() {
    let tmp = TempDir::new().unwrap();
    let mut orchestrator = ClusterOrchestrator::new(cluster(&tmp, 0, IDLE_NODE));

    let result = orchestrator.run(|_ctx| async { Ok("ok") }).await.unwrap();

    assert_eq!(result, "ok");
    assert!(orchestrator.launched_process_groups().is_empty());
    assert!(orchestrator.addresses().admin.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routine_succeeds_once_all_nodes_sync() {
    let tmp = TempDir::new().unwrap();
    let config = cluster(&tmp, 3, SYNCING_NODE).with_timeout(Duration::from_secs(30));
    let mut orchestrator = ClusterOrchestrator::new(config);

    let synced = orchestrator
        .run(|ctx| async move {
            let mut monitor = ctx.monitor().with_echo(false);
            while monitor.synced_count() < 3 {
                anyhow::ensure!(ctx.uptime() < Duration::from_secs(30), "nodes never synced");
                monitor.track().await?;
            }
            Ok::<_, anyhow::Error>(monitor.synced_count())
        })
        .await
        .unwrap();

    assert_eq!(synced, 3);
    let pgids = orchestrator.launched_process_groups();
    assert_eq!(pgids.len(), 3);
    assert_all_dead(&pgids, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_form_a_forward_chain() {
    let tmp = TempDir::new().unwrap();
    let config = cluster(&tmp, 3, SYNCING_NODE).with_timeout(Duration::from_secs(30));
    let mut orchestrator = ClusterOrchestrator::new(config);

    orchestrator
        .run(|ctx| async move {
            let mut monitor = ctx.monitor().with_echo(false);
            while monitor.synced_count() < 3 {
                monitor.track().await?;
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

    let data_dir = orchestrator.config().data_dir.clone();
    let node0 = read_node_config(&data_dir, 0).unwrap();
    let node1 = read_node_config(&data_dir, 1).unwrap();
    let node2 = read_node_config(&data_dir, 2).unwrap();

    assert!(node0.peer_list.is_empty());
    assert_eq!(node1.peer_list, vec!["127.0.0.1:10000"]);
    assert_eq!(node2.peer_list, vec!["127.0.0.1:10000", "127.0.0.1:10005"]);
    assert!(!node2.mining_enabled);

    let addresses = orchestrator.addresses();
    assert_eq!(
        addresses.admin,
        vec!["127.0.0.1:10001", "127.0.0.1:10006", "127.0.0.1:10011"]
    );
    assert_eq!(addresses.public[2], "127.0.0.1:10012");
    assert_eq!(addresses.mining[1], "127.0.0.1:10008");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_kills_every_node() {
    let tmp = TempDir::new().unwrap();
    let config = cluster(&tmp, 2, IDLE_NODE).with_timeout(Duration::from_secs(2));
    let mut orchestrator = ClusterOrchestrator::new(config);

    let started = Instant::now();
    let err = orchestrator
        .run(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::TimeoutExceeded { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));

    let pgids = orchestrator.launched_process_groups();
    assert_eq!(pgids.len(), 2);
    assert_all_dead(&pgids, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_trigger_fails_the_run() {
    let tmp = TempDir::new().unwrap();
    let script = format!("echo '{TRACEBACK_MARKER}'; echo '  File \"node.py\"'; exec sleep 30");
    let config = cluster(&tmp, 1, &script).with_timeout(Duration::from_secs(20));
    let mut orchestrator = ClusterOrchestrator::new(config);

    let err = orchestrator
        .run(|ctx| async move {
            let mut monitor = ctx.monitor().with_echo(false);
            monitor.run_until_stopped(ctx.stop_flag()).await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap_err();

    assert!(err.is_abort(), "expected abort, got {err}");
    assert_all_dead(&orchestrator.launched_process_groups(), Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_routine_stops_further_launches() {
    let tmp = TempDir::new().unwrap();
    let config = cluster(&tmp, 5, IDLE_NODE).with_stagger_delay(Duration::from_millis(300));
    let mut orchestrator = ClusterOrchestrator::new(config);

    orchestrator.run(|_ctx| async { Ok(()) }).await.unwrap();

    let launched = orchestrator.launched_process_groups();
    assert!(launched.len() < 5, "launched {} nodes", launched.len());
    assert_all_dead(&launched, Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawn_failure_does_not_stop_the_run() {
    let tmp = TempDir::new().unwrap();
    let config = ClusterConfig::new(2)
        .with_data_dir(tmp.path().join("data"))
        .with_launcher(NodeLauncher::new("/nonexistent/run_node.sh"))
        .with_stagger_delay(Duration::from_millis(50))
        .with_cleanup_grace(Duration::from_millis(500));
    let mut orchestrator = ClusterOrchestrator::new(config);

    let value = orchestrator
        .run(|ctx| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(ctx.admin_addresses().len())
        })
        .await
        .unwrap();

    assert_eq!(value, 2);
    assert!(orchestrator.launched_process_groups().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_a_run_kills_its_nodes() {
    let tmp = TempDir::new().unwrap();
    let config = cluster(&tmp, 2, IDLE_NODE).with_timeout(Duration::from_secs(60));
    let mut orchestrator = ClusterOrchestrator::new(config);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(800),
        orchestrator.run(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(())
        }),
    )
    .await;
    assert!(cancelled.is_err(), "run should still be in progress");

    assert!(!orchestrator.running());
    let pgids = orchestrator.launched_process_groups();
    assert_eq!(pgids.len(), 2);
    assert_all_dead(&pgids, Duration::from_secs(5)).await;
}
