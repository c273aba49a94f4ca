//! Port allocation for cluster nodes.
//!
//! Every node owns a contiguous stride of ports starting at
//! `base_port + node_index * ports_per_node`. Each role a node exposes maps
//! to a fixed slot inside that stride, so a peer address computed for node
//! `j` always lands on node `j`'s p2p port.
//!
//! ```text
//! slot 0  p2p (local and public)
//! slot 1  admin API
//! slot 2  public API
//! slot 3  mining API
//! slot 4  gRPC proxy
//! ```

/// First port handed out to node 0.
pub const DEFAULT_BASE_PORT: u16 = 10_000;

/// Ports reserved per node.
pub const DEFAULT_PORTS_PER_NODE: u16 = 5;

/// Loopback address nodes bind to.
pub const LOCALHOST_IP: &str = "127.0.0.1";

/// Role of a port inside a node's stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSlot {
    /// Peer-to-peer listener; used for both the local and public p2p port.
    P2p = 0,
    /// Admin gRPC API.
    AdminApi = 1,
    /// Public gRPC API.
    PublicApi = 2,
    /// Mining gRPC API.
    MiningApi = 3,
    /// gRPC proxy.
    GrpcProxy = 4,
}

impl PortSlot {
    /// Number of distinct slots; the smallest usable stride.
    pub const COUNT: u16 = 5;

    /// Slot offset inside a node's stride.
    #[must_use]
    pub const fn offset(self) -> u16 {
        self as u16
    }
}

/// Maps `(node index, slot)` to a TCP port.
///
/// Pure and stateless: the same inputs always give the same port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    base_port: u16,
    ports_per_node: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT, DEFAULT_PORTS_PER_NODE)
    }
}

impl PortAllocator {
    /// Create an allocator with the given base port and stride.
    #[must_use]
    pub const fn new(base_port: u16, ports_per_node: u16) -> Self {
        Self {
            base_port,
            ports_per_node,
        }
    }

    /// First port of node 0.
    #[must_use]
    pub const fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Ports reserved per node.
    #[must_use]
    pub const fn ports_per_node(&self) -> u16 {
        self.ports_per_node
    }

    /// Port for `slot` of node `node_index`, computed without narrowing.
    ///
    /// Used by configuration validation to detect strides that run past
    /// the end of the port range.
    #[must_use]
    pub fn port_wide(&self, node_index: usize, slot: PortSlot) -> u32 {
        let index = u32::try_from(node_index).unwrap_or(u32::MAX);
        u32::from(self.base_port)
            .saturating_add(index.saturating_mul(u32::from(self.ports_per_node)))
            .saturating_add(u32::from(slot.offset()))
    }

    /// Port for `slot` of node `node_index`.
    ///
    /// Callers are expected to have validated the cluster size with
    /// [`ClusterConfig::validate`](crate::config::ClusterConfig::validate);
    /// out-of-range results saturate at `u16::MAX`.
    #[must_use]
    pub fn port(&self, node_index: usize, slot: PortSlot) -> u16 {
        u16::try_from(self.port_wide(node_index, slot)).unwrap_or(u16::MAX)
    }

    /// `ip:port` address of `slot` on node `node_index`.
    #[must_use]
    pub fn address(&self, host: &str, node_index: usize, slot: PortSlot) -> String {
        ip_port(host, self.port(node_index, slot))
    }

    /// P2p addresses of every node started before `node_index`, in index
    /// order.
    ///
    /// A node only knows its predecessors, so the cluster forms a
    /// forward-only chain rather than a full mesh.
    #[must_use]
    pub fn peers(&self, host: &str, node_index: usize) -> Vec<String> {
        (0..node_index)
            .map(|peer| self.address(host, peer, PortSlot::P2p))
            .collect()
    }
}

/// Formats an `ip:port` pair.
#[must_use]
pub fn ip_port(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_stride() {
        let ports = PortAllocator::default();
        assert_eq!(ports.port(0, PortSlot::P2p), 10_000);
        assert_eq!(ports.port(0, PortSlot::GrpcProxy), 10_004);
        assert_eq!(ports.port(1, PortSlot::P2p), 10_005);
        assert_eq!(ports.port(3, PortSlot::AdminApi), 10_016);
        assert_eq!(ports.port(3, PortSlot::MiningApi), 10_018);
    }

    #[test]
    fn strides_never_overlap() {
        let ports = PortAllocator::default();
        let last_of_first = ports.port(0, PortSlot::GrpcProxy);
        let first_of_second = ports.port(1, PortSlot::P2p);
        assert!(last_of_first < first_of_second);
    }

    #[test]
    fn peers_are_predecessors_in_order() {
        let ports = PortAllocator::new(20_000, 5);
        assert!(ports.peers(LOCALHOST_IP, 0).is_empty());
        assert_eq!(
            ports.peers(LOCALHOST_IP, 3),
            vec![
                "127.0.0.1:20000".to_string(),
                "127.0.0.1:20005".to_string(),
                "127.0.0.1:20010".to_string(),
            ]
        );
    }

    #[test]
    fn wide_port_reports_overflow() {
        let ports = PortAllocator::new(65_530, 5);
        assert_eq!(ports.port_wide(2, PortSlot::P2p), 65_540);
        assert_eq!(ports.port(2, PortSlot::P2p), u16::MAX);
    }
}
