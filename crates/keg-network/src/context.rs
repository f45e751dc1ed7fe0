//! Network registry and container connect/disconnect flows.
//!
//! A [`NetworkContext`] is built once per invocation from the on-disk
//! network records and carries everything network operations need.

use std::collections::BTreeMap;
use std::fs::File;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use ipnetwork::Ipv4Network;
use keg_common::{ContainerRecord, KegError, KegPaths, KegResult, RecordStore};

use crate::driver::NetworkDriver;
use crate::endpoint::Endpoint;
use crate::ipam::Ipam;
use crate::iptables::{NatRule, PortMapping};
use crate::link::Netlink;
use crate::netns::{netns_path, run_in_netns};
use crate::network::NetworkRecord;

/// Longest name a network device may carry.
const MAX_IFNAME_LEN: usize = 15;

/// Networks known to this invocation.
#[derive(Debug)]
pub struct NetworkContext {
    dir: PathBuf,
    networks: BTreeMap<String, NetworkRecord>,
    ipam: Ipam,
}

impl NetworkContext {
    /// Load every network record under the paths' network directory.
    ///
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn load(paths: &KegPaths) -> KegResult<Self> {
        let dir = paths.networks();
        let mut networks = BTreeMap::new();

        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                match NetworkRecord::load(&path) {
                    Ok(record) => {
                        networks.insert(record.name.clone(), record);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable network");
                    }
                }
            }
        }

        tracing::debug!(count = networks.len(), "Loaded networks");
        Ok(Self {
            dir,
            networks,
            ipam: Ipam::new(paths.ipam()),
        })
    }

    /// The address allocator.
    #[must_use]
    pub const fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    /// Look up a network.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::NetworkNotFound`] for unknown names.
    pub fn get(&self, name: &str) -> KegResult<&NetworkRecord> {
        self.networks
            .get(name)
            .ok_or_else(|| KegError::NetworkNotFound {
                name: name.to_string(),
            })
    }

    /// All networks, ordered by name.
    pub fn list(&self) -> impl Iterator<Item = &NetworkRecord> {
        self.networks.values()
    }

    /// Create and persist a network.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or unusable as a device name, the driver
    /// is unknown, the subnet does not parse, or the driver cannot set the
    /// network up.
    pub async fn create_network(
        &mut self,
        name: &str,
        driver: &str,
        subnet: &str,
    ) -> KegResult<&NetworkRecord> {
        validate_name(name)?;
        if self.networks.contains_key(name) {
            return Err(KegError::NetworkExists {
                name: name.to_string(),
            });
        }
        let driver = NetworkDriver::from_name(driver)?;
        let subnet: Ipv4Network = subnet.parse().map_err(|_| KegError::InvalidSubnet {
            cidr: subnet.to_string(),
        })?;

        let netlink = Netlink::connect()?;
        let record = driver.create(&netlink, &self.ipam, name, subnet).await?;
        record.save(&self.dir)?;

        Ok(&*self.networks.entry(name.to_string()).or_insert(record))
    }

    /// Tear a network down: forget its subnet, delete the driver state,
    /// then remove the record.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::NetworkNotFound`] for unknown names, or the
    /// first failing step's error.
    pub async fn remove_network(&mut self, name: &str) -> KegResult<()> {
        let record = self.get(name)?.clone();
        self.ipam.remove_subnet(&record.subnet())?;

        let driver = NetworkDriver::from_name(&record.driver)?;
        let netlink = Netlink::connect()?;
        driver.delete(&netlink, &record).await?;

        record.remove(&self.dir)?;
        self.networks.remove(name);
        tracing::info!(network = name, "Network removed");
        Ok(())
    }

    /// Attach a running container to `network` and persist its address.
    ///
    /// Port specs are validated before anything is allocated. If a later
    /// step fails, the veth, NAT rules and address are rolled back.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn connect(
        &self,
        network: &str,
        record: &mut ContainerRecord,
        store: &RecordStore,
    ) -> KegResult<()> {
        let net = self.get(network)?.clone();
        let ports = PortMapping::parse_all(&record.port)?;
        let driver = NetworkDriver::from_name(&net.driver)?;

        let netlink = Netlink::connect()?;

        let ip = self.ipam.allocate(&net.subnet())?;
        let endpoint = Endpoint::new(&record.id, net, ip, ports);

        if let Err(e) = attach(&netlink, driver, &endpoint, record.pid).await {
            tracing::warn!(container = %record.name, error = %e, "Connect failed, rolling back");
            if let Err(cleanup) = driver.disconnect(&netlink, &endpoint).await {
                tracing::warn!(error = %cleanup, "Failed to remove endpoint");
            }
            if let Err(cleanup) = self.ipam.release(&endpoint.network.subnet(), ip) {
                tracing::warn!(error = %cleanup, "Failed to release address");
            }
            return Err(e);
        }

        let address = endpoint.address()?;
        record.set_network(address.to_string(), &endpoint.network.name);
        store.save(record)?;

        tracing::info!(
            container = %record.name,
            network = %endpoint.network.name,
            ip = %address,
            "Container connected"
        );
        Ok(())
    }

    /// Detach a container from its network. Every step is best-effort.
    ///
    /// A container without an address succeeds trivially. The record is
    /// updated in memory; the caller decides whether to persist it.
    pub async fn disconnect(&self, record: &mut ContainerRecord) {
        let (Some(ip), Some(network)) = (record.ip.clone(), record.network.clone()) else {
            return;
        };

        match (ip.parse::<Ipv4Network>(), self.get(&network)) {
            (Ok(address), Ok(net)) => {
                let ports = record
                    .port
                    .iter()
                    .filter_map(|spec| PortMapping::parse(spec).ok())
                    .collect();
                let endpoint = Endpoint::new(&record.id, net.clone(), address.ip(), ports);
                self.detach(&endpoint).await;
            }
            (Err(e), _) => {
                tracing::warn!(container = %record.name, ip = %ip, error = %e, "Unparseable address");
            }
            (_, Err(e)) => {
                tracing::warn!(container = %record.name, error = %e, "Network gone");
            }
        }

        record.clear_network();
        tracing::info!(container = %record.name, network = %network, "Container disconnected");
    }

    async fn detach(&self, endpoint: &Endpoint) {
        for mapping in &endpoint.ports {
            if let Err(e) = NatRule::dnat(endpoint.ip, *mapping).delete() {
                tracing::warn!(port = %mapping, error = %e, "Failed to remove DNAT rule");
            }
        }

        match NetworkDriver::from_name(&endpoint.network.driver) {
            Ok(driver) => match Netlink::connect() {
                Ok(netlink) => {
                    if let Err(e) = driver.disconnect(&netlink, endpoint).await {
                        tracing::warn!(endpoint = %endpoint.id, error = %e, "Failed to remove endpoint");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Netlink unavailable"),
            },
            Err(e) => tracing::warn!(error = %e, "Cannot resolve driver"),
        }

        if let Err(e) = self.ipam.release(&endpoint.network.subnet(), endpoint.ip) {
            tracing::warn!(ip = %endpoint.ip, error = %e, "Failed to release address");
        }
    }

    /// Load a container's record, detach it and persist the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be loaded or saved.
    pub async fn disconnect_container(&self, store: &RecordStore, name: &str) -> KegResult<()> {
        let mut record = store.load(name)?;
        self.disconnect(&mut record).await;
        store.save(&record)
    }
}

fn validate_name(name: &str) -> KegResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && !name.contains(|c: char| c == '/' || c.is_whitespace());
    if valid {
        Ok(())
    } else {
        Err(KegError::Config {
            message: format!(
                "network name {name:?} must be 1-{MAX_IFNAME_LEN} characters without '/' or spaces"
            ),
        })
    }
}

/// Wire the endpoint into the container whose init is `pid`.
async fn attach(
    netlink: &Netlink,
    driver: NetworkDriver,
    endpoint: &Endpoint,
    pid: i32,
) -> KegResult<()> {
    driver.connect(netlink, &endpoint.network, endpoint).await?;

    let peer = endpoint.peer_ifname();
    let peer_index = netlink.index_of(&peer).await?;
    let ns = File::open(netns_path(pid))?;
    netlink.set_netns_fd(peer_index, ns.as_raw_fd()).await?;
    drop(ns);

    let address = endpoint.address()?;
    let gateway = endpoint.network.gateway();
    run_in_netns(netns_path(pid), move |netlink| {
        configure_peer(netlink, peer, address, gateway)
    })
    .await?;

    let mut installed = Vec::with_capacity(endpoint.ports.len());
    for mapping in &endpoint.ports {
        let rule = NatRule::dnat(endpoint.ip, *mapping);
        if let Err(e) = rule.append() {
            for done in &installed {
                if let Err(cleanup) = NatRule::delete(done) {
                    tracing::warn!(rule = ?done, error = %cleanup, "Failed to remove DNAT rule");
                }
            }
            return Err(e);
        }
        installed.push(rule);
    }
    Ok(())
}

/// Runs inside the container's network namespace.
async fn configure_peer(
    netlink: Netlink,
    peer: String,
    address: Ipv4Network,
    gateway: Ipv4Addr,
) -> KegResult<()> {
    let index = netlink.index_of(&peer).await?;
    netlink.add_address(index, address).await?;
    netlink.set_up(index).await?;

    let lo = netlink.index_of("lo").await?;
    netlink.set_up(lo).await?;

    netlink.add_default_route(index, gateway).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use keg_common::ContainerId;
    use tempfile::tempdir;

    fn paths_in(dir: &std::path::Path) -> KegPaths {
        KegPaths::with_root(dir)
    }

    fn seeded(dir: &std::path::Path) -> KegPaths {
        let paths = paths_in(dir);
        let network = NetworkRecord::new(
            "testbr",
            Ipv4Addr::new(172, 18, 0, 1),
            "172.18.0.0/24".parse().unwrap(),
            "bridge",
        )
        .unwrap();
        network.save(&paths.networks()).unwrap();
        paths
    }

    fn container(ports: &[&str]) -> ContainerRecord {
        let ports: Vec<String> = ports.iter().map(ToString::to_string).collect();
        ContainerRecord::new(&ContainerId::generate(), "web", 1, "busybox", &[], &[], &ports)
    }

    #[test]
    fn load_reads_records_and_skips_junk() {
        let temp = tempdir().unwrap();
        let paths = seeded(temp.path());
        std::fs::write(paths.networks().join("broken.json"), "{").unwrap();
        std::fs::write(paths.networks().join("notes.txt"), "hi").unwrap();
        std::fs::create_dir_all(paths.ipam().parent().unwrap()).unwrap();

        let ctx = NetworkContext::load(&paths).unwrap();
        let names: Vec<_> = ctx.list().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["testbr"]);
        assert_eq!(ctx.get("testbr").unwrap().ip_range.to_string(), "172.18.0.1/24");
    }

    #[test]
    fn load_without_directory_is_empty() {
        let temp = tempdir().unwrap();
        let ctx = NetworkContext::load(&paths_in(temp.path())).unwrap();
        assert_eq!(ctx.list().count(), 0);
        assert!(matches!(ctx.get("x"), Err(KegError::NetworkNotFound { .. })));
    }

    #[tokio::test]
    async fn create_rejects_before_touching_the_host() {
        let temp = tempdir().unwrap();
        let mut ctx = NetworkContext::load(&seeded(temp.path())).unwrap();

        assert!(matches!(
            ctx.create_network("testbr", "bridge", "172.19.0.0/24").await,
            Err(KegError::NetworkExists { .. })
        ));
        assert!(matches!(
            ctx.create_network("other", "overlay", "172.19.0.0/24").await,
            Err(KegError::UnknownDriver { .. })
        ));
        assert!(matches!(
            ctx.create_network("other", "bridge", "not-a-cidr").await,
            Err(KegError::InvalidSubnet { .. })
        ));
        assert!(matches!(
            ctx.create_network("a-very-long-network-name", "bridge", "172.19.0.0/24").await,
            Err(KegError::Config { .. })
        ));
        assert!(!ctx.ipam().path().exists());
    }

    #[tokio::test]
    async fn connect_validates_ports_before_allocating() {
        let temp = tempdir().unwrap();
        let paths = seeded(temp.path());
        let ctx = NetworkContext::load(&paths).unwrap();
        let store = RecordStore::new(paths.records());

        let mut record = container(&["8080"]);
        assert!(matches!(
            ctx.connect("testbr", &mut record, &store).await,
            Err(KegError::InvalidPortMapping { .. })
        ));
        assert!(record.ip.is_none());
        assert!(!ctx.ipam().path().exists());
    }

    #[tokio::test]
    async fn connect_to_unknown_network_fails() {
        let temp = tempdir().unwrap();
        let paths = seeded(temp.path());
        let ctx = NetworkContext::load(&paths).unwrap();
        let store = RecordStore::new(paths.records());

        let mut record = container(&[]);
        assert!(matches!(
            ctx.connect("nope", &mut record, &store).await,
            Err(KegError::NetworkNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_without_address_is_trivial() {
        let temp = tempdir().unwrap();
        let paths = seeded(temp.path());
        let ctx = NetworkContext::load(&paths).unwrap();
        let store = RecordStore::new(paths.records());

        let record = container(&[]);
        store.save(&record).unwrap();
        ctx.disconnect_container(&store, "web").await.unwrap();
        assert_eq!(store.load("web").unwrap(), record);
    }

    #[tokio::test]
    async fn disconnect_on_missing_network_clears_record() {
        let temp = tempdir().unwrap();
        let paths = seeded(temp.path());
        let ctx = NetworkContext::load(&paths).unwrap();

        let mut record = container(&[]);
        record.set_network("10.9.0.2/24", "gone");
        ctx.disconnect(&mut record).await;
        assert!(record.ip.is_none());
        assert!(record.network.is_none());
    }

    #[test]
    fn network_names_must_fit_a_device_name() {
        assert!(validate_name("testbr").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("abcdefghijklmnop").is_err());
        assert!(validate_name("a/b").is_err());
    }
}
