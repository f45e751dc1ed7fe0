//! A container's attachment to one network.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use keg_common::{KegError, KegResult};

use crate::iptables::PortMapping;
use crate::network::NetworkRecord;

/// Characters of the endpoint ID used in veth names.
const IFNAME_ID_LEN: usize = 5;

/// Prefix of the container-side veth name.
const PEER_PREFIX: &str = "netns-";

/// Wiring for one container on one network. Lives only for the duration
/// of a connect or disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `<container id>-<network name>`.
    pub id: String,
    /// Allocated address.
    pub ip: Ipv4Addr,
    /// The network being joined.
    pub network: NetworkRecord,
    /// Published ports.
    pub ports: Vec<PortMapping>,
}

impl Endpoint {
    /// Describe the attachment of `container_id` to `network`.
    #[must_use]
    pub fn new(
        container_id: &str,
        network: NetworkRecord,
        ip: Ipv4Addr,
        ports: Vec<PortMapping>,
    ) -> Self {
        Self {
            id: format!("{container_id}-{}", network.name),
            ip,
            network,
            ports,
        }
    }

    fn short_id(&self) -> &str {
        self.id.get(..IFNAME_ID_LEN).unwrap_or(&self.id)
    }

    /// Name of the host-side veth, the bridge port.
    #[must_use]
    pub fn host_ifname(&self) -> String {
        self.short_id().to_string()
    }

    /// Name of the veth end moved into the container.
    #[must_use]
    pub fn peer_ifname(&self) -> String {
        format!("{PEER_PREFIX}{}", self.short_id())
    }

    /// Container address with the network prefix.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::InvalidSubnet`] if the network prefix is invalid.
    pub fn address(&self) -> KegResult<Ipv4Network> {
        Ipv4Network::new(self.ip, self.network.ip_range.prefix()).map_err(|_| {
            KegError::InvalidSubnet {
                cidr: self.network.ip_range.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        let network = NetworkRecord::new(
            "testbr",
            Ipv4Addr::new(172, 18, 0, 1),
            "172.18.0.0/24".parse().unwrap(),
            "bridge",
        )
        .unwrap();
        Endpoint::new(
            "a1b2c3d4e5f6",
            network,
            Ipv4Addr::new(172, 18, 0, 2),
            vec![PortMapping::parse("8080:80").unwrap()],
        )
    }

    #[test]
    fn id_joins_container_and_network() {
        assert_eq!(endpoint().id, "a1b2c3d4e5f6-testbr");
    }

    #[test]
    fn veth_names_derive_from_id() {
        let ep = endpoint();
        assert_eq!(ep.host_ifname(), "a1b2c");
        assert_eq!(ep.peer_ifname(), "netns-a1b2c");
    }

    #[test]
    fn address_uses_network_prefix() {
        assert_eq!(endpoint().address().unwrap().to_string(), "172.18.0.2/24");
    }
}
