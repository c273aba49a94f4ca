//! Per-node configuration file.
//!
//! Written once into each node's private directory before the node is
//! launched. The harness never reads it back; the node's startup script
//! does.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SupervisorError;
use crate::ports::{PortAllocator, PortSlot};

/// File name the node reads its configuration from.
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Configuration handed to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// P2p addresses of every node with a smaller index, in index order.
    pub peer_list: Vec<String>,
    /// Always `false`; the harness never mines.
    pub mining_enabled: bool,
    pub p2p_local_port: u16,
    pub p2p_public_port: u16,
    pub admin_api_port: u16,
    pub public_api_port: u16,
    pub mining_api_port: u16,
    pub grpc_proxy_port: u16,
}

impl NodeConfig {
    /// Build the configuration for node `node_index`.
    #[must_use]
    pub fn for_node(ports: &PortAllocator, host: &str, node_index: usize) -> Self {
        let p2p = ports.port(node_index, PortSlot::P2p);
        Self {
            peer_list: ports.peers(host, node_index),
            mining_enabled: false,
            p2p_local_port: p2p,
            p2p_public_port: p2p,
            admin_api_port: ports.port(node_index, PortSlot::AdminApi),
            public_api_port: ports.port(node_index, PortSlot::PublicApi),
            mining_api_port: ports.port(node_index, PortSlot::MiningApi),
            grpc_proxy_port: ports.port(node_index, PortSlot::GrpcProxy),
        }
    }

    /// Serialize to `dir/config.yml`, creating `dir` if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, SupervisorError> {
        std::fs::create_dir_all(dir).map_err(|source| SupervisorError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(CONFIG_FILE_NAME);
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml).map_err(|source| SupervisorError::WriteConfig {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// Working directory of node `node_index` under the cluster data dir.
#[must_use]
pub fn node_data_dir(data_dir: &Path, node_index: usize) -> PathBuf {
    data_dir.join(format!("node{node_index:03}"))
}
