//! Persisted network definitions.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;
use keg_common::{KegError, KegResult};
use serde::{Deserialize, Serialize};

/// One user-created network, stored as `<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// Network name, also the bridge device name.
    pub name: String,
    /// Gateway address with the subnet prefix, e.g. `172.18.0.1/24`.
    pub ip_range: Ipv4Network,
    /// Driver name.
    pub driver: String,
}

impl NetworkRecord {
    /// Create a record for a network whose gateway is `gateway` in `subnet`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::InvalidSubnet`] if the prefix is out of range.
    pub fn new(
        name: impl Into<String>,
        gateway: Ipv4Addr,
        subnet: Ipv4Network,
        driver: impl Into<String>,
    ) -> KegResult<Self> {
        let ip_range =
            Ipv4Network::new(gateway, subnet.prefix()).map_err(|_| KegError::InvalidSubnet {
                cidr: subnet.to_string(),
            })?;
        Ok(Self {
            name: name.into(),
            ip_range,
            driver: driver.into(),
        })
    }

    /// The masked subnet, e.g. `172.18.0.0/24`.
    #[must_use]
    pub fn subnet(&self) -> Ipv4Network {
        crate::ipam::masked(&self.ip_range)
    }

    /// The gateway address.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.ip()
    }

    /// Write the record into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, dir: &Path) -> KegResult<()> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.name));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!(network = %self.name, path = %path.display(), "Saved network record");
        Ok(())
    }

    /// Read a record file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> KegResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Remove the record file from `dir`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, dir: &Path) -> KegResult<()> {
        let path = dir.join(format!("{}.json", self.name));
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> NetworkRecord {
        NetworkRecord::new(
            "testbr",
            Ipv4Addr::new(172, 18, 0, 1),
            "172.18.0.0/24".parse().unwrap(),
            "bridge",
        )
        .unwrap()
    }

    #[test]
    fn ip_range_carries_gateway_and_prefix() {
        let record = sample();
        assert_eq!(record.ip_range.to_string(), "172.18.0.1/24");
        assert_eq!(record.gateway(), Ipv4Addr::new(172, 18, 0, 1));
        assert_eq!(record.subnet().to_string(), "172.18.0.0/24");
    }

    #[test]
    fn json_layout() {
        let json: serde_json::Value = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["name"], "testbr");
        assert_eq!(json["ip_range"], "172.18.0.1/24");
        assert_eq!(json["driver"], "bridge");
    }

    #[test]
    fn save_load_remove() {
        let temp = tempdir().unwrap();
        let record = sample();
        record.save(temp.path()).unwrap();

        let path = temp.path().join("testbr.json");
        assert_eq!(NetworkRecord::load(&path).unwrap(), record);

        record.remove(temp.path()).unwrap();
        assert!(!path.exists());
        record.remove(temp.path()).unwrap();
    }
}
