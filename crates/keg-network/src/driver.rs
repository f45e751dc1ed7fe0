//! The closed set of network drivers.

use ipnetwork::Ipv4Network;
use keg_common::{KegError, KegResult};

use crate::bridge::BridgeDriver;
use crate::endpoint::Endpoint;
use crate::ipam::Ipam;
use crate::link::Netlink;
use crate::network::NetworkRecord;

/// A network driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDriver {
    /// Linux bridge with NAT.
    Bridge(BridgeDriver),
}

impl NetworkDriver {
    /// Every registered driver.
    pub const ALL: [Self; 1] = [Self::Bridge(BridgeDriver)];

    /// Look a driver up by name.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::UnknownDriver`] for unregistered names.
    pub fn from_name(name: &str) -> KegResult<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| KegError::UnknownDriver {
                driver: name.to_string(),
            })
    }

    /// Driver name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bridge(_) => BridgeDriver::NAME,
        }
    }

    /// Create a network.
    ///
    /// # Errors
    ///
    /// Propagates the driver's error.
    pub async fn create(
        &self,
        netlink: &Netlink,
        ipam: &Ipam,
        name: &str,
        subnet: Ipv4Network,
    ) -> KegResult<NetworkRecord> {
        match self {
            Self::Bridge(driver) => driver.create(netlink, ipam, name, subnet).await,
        }
    }

    /// Delete a network.
    ///
    /// # Errors
    ///
    /// Propagates the driver's error.
    pub async fn delete(&self, netlink: &Netlink, record: &NetworkRecord) -> KegResult<()> {
        match self {
            Self::Bridge(driver) => driver.delete(netlink, record).await,
        }
    }

    /// Attach an endpoint.
    ///
    /// # Errors
    ///
    /// Propagates the driver's error.
    pub async fn connect(
        &self,
        netlink: &Netlink,
        record: &NetworkRecord,
        endpoint: &Endpoint,
    ) -> KegResult<()> {
        match self {
            Self::Bridge(driver) => driver.connect(netlink, record, endpoint).await,
        }
    }

    /// Detach an endpoint.
    ///
    /// # Errors
    ///
    /// Propagates the driver's error.
    pub async fn disconnect(&self, netlink: &Netlink, endpoint: &Endpoint) -> KegResult<()> {
        match self {
            Self::Bridge(driver) => driver.disconnect(netlink, endpoint).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_is_registered() {
        let driver = NetworkDriver::from_name("bridge").unwrap();
        assert_eq!(driver.name(), "bridge");
    }

    #[test]
    fn unknown_driver_is_rejected() {
        assert!(matches!(
            NetworkDriver::from_name("overlay"),
            Err(KegError::UnknownDriver { .. })
        ));
    }
}
