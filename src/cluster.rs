//! Cluster membership: node addresses, the line-oriented config files, and
//! the allocation RPC operation codes.

use std::fmt;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use regex::Regex;

use crate::ConfigError;

/// Operation codes of the allocation RPC a memory node honours.
///
/// Request format:
/// - `RemoteAllocation`: 1 byte op. Response: 8-byte little-endian
///   RemotePointer, null on exhaustion.
/// - `RemoteDeallocation`: 1 byte op + 8-byte little-endian RemotePointer.
///   Response: 1-byte boolean.
pub const RPC_REMOTE_ALLOCATION: u8 = 0;
pub const RPC_REMOTE_DEALLOCATION: u8 = 1;

/// Addresses of one cluster member, as listed in a config file line:
///
/// ```text
/// node<N>: <tcp_ip>:<port>, <rdma_ip>:<port>, <rpc_ip>:<port>
/// ```
///
/// `tcp` is the bootstrap socket, `data` the one-sided data channel, and
/// `rpc` the allocation RPC endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: u8,
    pub tcp_addr: SocketAddrV4,
    pub data_addr: SocketAddrV4,
    pub rpc_addr: SocketAddrV4,
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node{}: {}, {}, {}",
            self.node_id, self.tcp_addr, self.data_addr, self.rpc_addr
        )
    }
}

/// RDMA device description carried by both config flavours. The transport
/// in this repository does not drive a verbs device; the fields are parsed
/// and logged so a deployment config round-trips unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RdmaDeviceInfo {
    pub device: String,
    pub port: u32,
    pub gid_idx: u32,
}

fn uri_regex() -> Regex {
    Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d+)").unwrap()
}

/// Parse one `node<N>: tcp, data, rpc` line. Lines that don't start with
/// `node` are ignored by returning Ok(None).
pub fn parse_node_line(line: &str) -> Result<Option<NodeInfo>, ConfigError> {
    let nid = Regex::new(r"^\s*node(\d*):").unwrap();
    let Some(caps) = nid.captures(line) else {
        return Ok(None);
    };
    let node_id = caps[1].parse::<u8>().unwrap_or(0);

    let mut addrs = Vec::with_capacity(3);
    for cap in uri_regex().captures_iter(line) {
        let ip = cap[1]
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::BadUri(line.to_string()))?;
        let port = cap[2]
            .parse::<u16>()
            .map_err(|_| ConfigError::BadUri(line.to_string()))?;
        addrs.push(SocketAddrV4::new(ip, port));
    }
    if addrs.len() != 3 {
        return Err(ConfigError::BadUri(line.to_string()));
    }

    Ok(Some(NodeInfo {
        node_id,
        tcp_addr: addrs[0],
        data_addr: addrs[1],
        rpc_addr: addrs[2],
    }))
}

fn capture_u32(content: &str, pattern: &str, field: &'static str) -> Result<u32, ConfigError> {
    let re = Regex::new(pattern).unwrap();
    re.captures(content)
        .and_then(|c| c[1].parse::<u32>().ok())
        .ok_or(ConfigError::MissingField(field))
}

pub fn parse_rdma_device(content: &str) -> Result<RdmaDeviceInfo, ConfigError> {
    let dev = Regex::new(r"rdma_device:\s+(\S+)").unwrap();
    let device = dev
        .captures(content)
        .map(|c| c[1].to_string())
        .ok_or(ConfigError::MissingField("rdma_device"))?;
    let port = capture_u32(content, r"rdma_port:\s+(\d+)", "rdma_port")?;
    let gid_idx = capture_u32(content, r"gid_idx:\s+(\d+)", "gid_idx")?;
    Ok(RdmaDeviceInfo {
        device,
        port,
        gid_idx,
    })
}

/// A compute node's own config file.
#[derive(Clone, Debug)]
pub struct ComputeConfig {
    pub self_info: NodeInfo,
    pub rdma: RdmaDeviceInfo,
}

impl ComputeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ComputeConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ComputeConfig, ConfigError> {
        let self_info = content
            .lines()
            .find_map(|l| parse_node_line(l).transpose())
            .ok_or(ConfigError::MissingField("node"))??;
        let rdma = parse_rdma_device(content)?;
        Ok(ComputeConfig { self_info, rdma })
    }
}

/// A memory node's own config file: a node line plus `mem_cap`.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub self_info: NodeInfo,
    pub mem_cap: usize,
    pub rdma: RdmaDeviceInfo,
}

impl MemoryConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<MemoryConfig, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<MemoryConfig, ConfigError> {
        let self_info = content
            .lines()
            .find_map(|l| parse_node_line(l).transpose())
            .ok_or(ConfigError::MissingField("node"))??;
        let cap = Regex::new(r"mem_cap:\s+(\d+)").unwrap();
        let mem_cap = cap
            .captures(content)
            .and_then(|c| c[1].parse::<usize>().ok())
            .ok_or(ConfigError::MissingField("mem_cap"))?;
        let rdma = parse_rdma_device(content)?;
        Ok(MemoryConfig {
            self_info,
            mem_cap,
            rdma,
        })
    }
}

/// Parse the ordered memory-node list a compute node points at, one
/// `node<N>` line per memory node.
pub fn parse_memory_node_list<P: AsRef<Path>>(path: P) -> Result<Vec<NodeInfo>, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_memory_node_list_str(&content)
}

pub fn parse_memory_node_list_str(content: &str) -> Result<Vec<NodeInfo>, ConfigError> {
    let mut nodes = Vec::new();
    for line in content.lines() {
        if let Some(info) = parse_node_line(line)? {
            nodes.push(info);
        }
    }
    if nodes.is_empty() {
        return Err(ConfigError::MissingField("node"));
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_line() {
        let info = parse_node_line("node2: 10.0.0.2:1234, 10.0.0.2:4321, 10.0.0.2:3124")
            .unwrap()
            .unwrap();
        assert_eq!(info.node_id, 2);
        assert_eq!(info.tcp_addr, "10.0.0.2:1234".parse().unwrap());
        assert_eq!(info.data_addr, "10.0.0.2:4321".parse().unwrap());
        assert_eq!(info.rpc_addr, "10.0.0.2:3124".parse().unwrap());

        assert!(parse_node_line("# comment").unwrap().is_none());
        assert!(parse_node_line("node0: 1.2.3.4:1").is_err());
    }

    #[test]
    fn memory_config() {
        let cfg = MemoryConfig::parse(
            "node1: 127.0.0.1:1234, 127.0.0.1:4321, 127.0.0.1:3124\n\
             mem_cap: 1073745920\n\
             rdma_device: mlx5_0\n\
             rdma_port: 1\n\
             gid_idx: 2\n",
        )
        .unwrap();
        assert_eq!(cfg.self_info.node_id, 1);
        assert_eq!(cfg.mem_cap, 1073745920);
        assert_eq!(cfg.rdma.device, "mlx5_0");
        assert_eq!(cfg.rdma.gid_idx, 2);
    }

    #[test]
    fn memory_node_list_keeps_order() {
        let nodes = parse_memory_node_list_str(
            "node0: 127.0.0.1:1000, 127.0.0.1:1001, 127.0.0.1:1002\n\
             node1: 127.0.0.1:2000, 127.0.0.1:2001, 127.0.0.1:2002\n",
        )
        .unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_id, 0);
        assert_eq!(nodes[1].node_id, 1);
    }

    #[test]
    fn missing_fields_are_fatal() {
        assert!(MemoryConfig::parse("node0: 1.1.1.1:1, 1.1.1.1:2, 1.1.1.1:3\n").is_err());
        assert!(ComputeConfig::parse("rdma_device: mlx5_0\nrdma_port: 1\ngid_idx: 4\n").is_err());
    }
}
