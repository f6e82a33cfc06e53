//! Node addresses and the per-node cluster view.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Network identity of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    fn cmp_address_bytes(&self, other: &Self) -> Ordering {
        match (self.ip, other.ip) {
            (IpAddr::V4(a), IpAddr::V4(b)) => a.octets().cmp(&b.octets()),
            (IpAddr::V6(a), IpAddr::V6(b)) => a.octets().cmp(&b.octets()),
            (IpAddr::V4(a), IpAddr::V6(b)) => a.octets().as_slice().cmp(b.octets().as_slice()),
            (IpAddr::V6(a), IpAddr::V4(b)) => a.octets().as_slice().cmp(b.octets().as_slice()),
        }
    }
}

/// Raw address bytes compared lexicographically, then port.
///
/// Every node sorting the same member set gets the same order.
impl Ord for NodeAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_address_bytes(other)
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl PartialOrd for NodeAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

/// Sort members into the cluster-wide canonical order and drop duplicates.
pub fn sort_members(members: &mut Vec<NodeAddress>) {
    members.sort();
    members.dedup();
}

/// This node's view of the cluster, recomputed on every membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    pub is_coordinator: bool,
    pub ip_address: String,
    /// Incremented on every membership change.
    pub cluster_version: u64,
    /// 0-based index of this node in the canonical member order.
    pub position: usize,
    pub size: usize,
}

impl ClusterNodeInfo {
    /// View held before the first membership computation.
    pub(crate) fn initial(local: NodeAddress) -> Self {
        Self {
            is_coordinator: false,
            ip_address: local.ip.to_string(),
            cluster_version: 0,
            position: 0,
            size: 1,
        }
    }

    /// Compute the view of `local` within `members`.
    ///
    /// `local` is added when missing from `members`.
    pub fn compute(
        local: NodeAddress,
        mut members: Vec<NodeAddress>,
        is_coordinator: bool,
        cluster_version: u64,
    ) -> Self {
        if !members.contains(&local) {
            members.push(local);
        }
        sort_members(&mut members);

        let position = members.iter().position(|m| *m == local).unwrap_or(0);

        Self {
            is_coordinator,
            ip_address: local.ip.to_string(),
            cluster_version,
            position,
            size: members.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> NodeAddress {
        NodeAddress::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    #[test]
    fn test_order_by_bytes_then_port() {
        let mut members = vec![
            v4(10, 0, 0, 2, 7000),
            v4(10, 0, 0, 1, 7001),
            v4(9, 255, 255, 255, 7000),
            v4(10, 0, 0, 1, 7000),
        ];
        sort_members(&mut members);
        assert_eq!(
            members,
            vec![
                v4(9, 255, 255, 255, 7000),
                v4(10, 0, 0, 1, 7000),
                v4(10, 0, 0, 1, 7001),
                v4(10, 0, 0, 2, 7000),
            ]
        );
    }

    #[test]
    fn test_byte_order_not_numeric_string_order() {
        // "10.0.0.9" sorts after "10.0.0.10" as a string but before it as bytes.
        assert!(v4(10, 0, 0, 9, 1) < v4(10, 0, 0, 10, 1));
    }

    #[test]
    fn test_mixed_families_compare_bytes() {
        let v6 = NodeAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 1);
        // ::1 starts with a zero byte.
        assert!(v6 < v4(1, 0, 0, 0, 1));
        // Equal 4-byte prefix: the shorter address sorts first.
        let mapped = NodeAddress::new(IpAddr::V6("a00:1::".parse().unwrap()), 1);
        assert!(v4(10, 0, 0, 1, 1) < mapped);
    }

    #[test]
    fn test_compute_position_independent_of_input_order() {
        let a = v4(10, 0, 0, 1, 7000);
        let b = v4(10, 0, 0, 2, 7000);
        let c = v4(10, 0, 0, 3, 7000);

        let orders = [vec![a, b, c], vec![c, b, a], vec![b, c, a], vec![c, a, b]];
        for members in orders {
            assert_eq!(ClusterNodeInfo::compute(a, members.clone(), false, 1).position, 0);
            assert_eq!(ClusterNodeInfo::compute(b, members.clone(), false, 1).position, 1);
            assert_eq!(ClusterNodeInfo::compute(c, members, false, 1).position, 2);
        }
    }

    #[test]
    fn test_compute_adds_missing_local() {
        let a = v4(10, 0, 0, 1, 7000);
        let b = v4(10, 0, 0, 2, 7000);
        let info = ClusterNodeInfo::compute(a, vec![b], true, 7);
        assert_eq!(info.size, 2);
        assert_eq!(info.position, 0);
        assert_eq!(info.cluster_version, 7);
        assert!(info.is_coordinator);
        assert_eq!(info.ip_address, "10.0.0.1");
    }

    #[test]
    fn test_display() {
        assert_eq!(v4(127, 0, 0, 1, 80).to_string(), "127.0.0.1:80");
    }
}
