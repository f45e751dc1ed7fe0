//! Linux bridge driver.
//!
//! A network is a bridge device named after the network, carrying the
//! gateway address, plus a MASQUERADE rule for its subnet. Each container
//! joins through a veth pair whose host end is a bridge port.

use ipnetwork::Ipv4Network;
use keg_common::KegResult;

use crate::endpoint::Endpoint;
use crate::ipam::Ipam;
use crate::iptables::{NatRule, enable_ip_forwarding};
use crate::link::{AddressOutcome, Netlink};
use crate::network::NetworkRecord;

/// Driver backed by a Linux bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeDriver;

impl BridgeDriver {
    /// Driver name as stored in network records.
    pub const NAME: &'static str = "bridge";

    /// Create the bridge for a new network.
    ///
    /// The subnet's first address becomes the gateway. If any step fails,
    /// a bridge created by this call is deleted again and the gateway is
    /// returned to `ipam`. A bridge that already existed is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway cannot be allocated or the bridge,
    /// its address or the masquerade rule cannot be set up.
    pub async fn create(
        &self,
        netlink: &Netlink,
        ipam: &Ipam,
        name: &str,
        subnet: Ipv4Network,
    ) -> KegResult<NetworkRecord> {
        self.create_with(netlink, ipam, name, subnet, |record| {
            NatRule::masquerade(record.subnet(), &record.name).append()
        })
        .await
    }

    async fn create_with<F>(
        &self,
        netlink: &Netlink,
        ipam: &Ipam,
        name: &str,
        subnet: Ipv4Network,
        masquerade: F,
    ) -> KegResult<NetworkRecord>
    where
        F: FnOnce(&NetworkRecord) -> KegResult<()>,
    {
        let gateway = ipam.allocate(&subnet)?;
        let release = || {
            if let Err(e) = ipam.release(&subnet, gateway) {
                tracing::warn!(network = name, error = %e, "Failed to release gateway");
            }
        };

        let record = match NetworkRecord::new(name, gateway, subnet, Self::NAME) {
            Ok(record) => record,
            Err(e) => {
                release();
                return Err(e);
            }
        };

        let (index, created) = match self.find_or_add(netlink, &record.name).await {
            Ok(link) => link,
            Err(e) => {
                release();
                return Err(e);
            }
        };

        let configured = async {
            self.configure(netlink, &record, index).await?;
            masquerade(&record)
        };
        if let Err(e) = configured.await {
            if created {
                match netlink.delete(index).await {
                    Ok(()) => tracing::debug!(bridge = name, "Removed half-configured bridge"),
                    Err(cleanup) => {
                        tracing::warn!(bridge = name, error = %cleanup, "Failed to delete bridge");
                    }
                }
            }
            release();
            return Err(e);
        }

        tracing::info!(network = name, gateway = %record.ip_range, "Bridge network created");
        Ok(record)
    }

    /// Index of the bridge called `name` and whether this call created it.
    async fn find_or_add(&self, netlink: &Netlink, name: &str) -> KegResult<(u32, bool)> {
        match netlink.find(name).await? {
            Some(index) => {
                tracing::debug!(bridge = name, "Reusing existing bridge");
                Ok((index, false))
            }
            None => Ok((netlink.add_bridge(name).await?, true)),
        }
    }

    async fn configure(&self, netlink: &Netlink, record: &NetworkRecord, index: u32) -> KegResult<()> {
        if netlink.add_address(index, record.ip_range).await? == AddressOutcome::AlreadyPresent {
            tracing::warn!(bridge = %record.name, ip = %record.ip_range, "Bridge already has address");
        }
        netlink.set_up(index).await?;

        if let Err(e) = enable_ip_forwarding() {
            tracing::warn!(error = %e, "Failed to enable IP forwarding");
        }
        Ok(())
    }

    /// Remove the bridge and its masquerade rule.
    ///
    /// Releasing the subnet is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge exists but cannot be deleted.
    pub async fn delete(&self, netlink: &Netlink, record: &NetworkRecord) -> KegResult<()> {
        if !netlink.delete_by_name(&record.name).await? {
            tracing::warn!(bridge = %record.name, "Bridge not present");
        }
        if let Err(e) = NatRule::masquerade(record.subnet(), &record.name).delete() {
            tracing::warn!(bridge = %record.name, error = %e, "Failed to remove masquerade rule");
        }
        tracing::info!(network = %record.name, "Bridge network deleted");
        Ok(())
    }

    /// Create the endpoint's veth pair and attach its host end to the bridge.
    ///
    /// The peer stays in the host namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge is missing or the veth cannot be set
    /// up. A half-configured veth is deleted first.
    pub async fn connect(
        &self,
        netlink: &Netlink,
        record: &NetworkRecord,
        endpoint: &Endpoint,
    ) -> KegResult<()> {
        let bridge = netlink.index_of(&record.name).await?;
        let host = endpoint.host_ifname();
        let index = netlink.add_veth(&host, &endpoint.peer_ifname()).await?;

        let attach = async {
            netlink.set_controller(index, bridge).await?;
            netlink.set_up(index).await
        };
        if let Err(e) = attach.await {
            if let Err(cleanup) = netlink.delete(index).await {
                tracing::warn!(veth = %host, error = %cleanup, "Failed to delete veth");
            }
            return Err(e);
        }

        tracing::debug!(bridge = %record.name, veth = %host, "Endpoint attached");
        Ok(())
    }

    /// Delete the endpoint's host-side veth, which also removes its peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the veth exists but cannot be deleted.
    pub async fn disconnect(&self, netlink: &Netlink, endpoint: &Endpoint) -> KegResult<()> {
        let host = endpoint.host_ifname();
        if !netlink.delete_by_name(&host).await? {
            tracing::debug!(veth = %host, "Veth already gone");
        }
        Ok(())
    }
}
