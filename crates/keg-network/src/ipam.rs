//! IP address management.
//!
//! Each subnet owns a bitmap of 64-bit words persisted as JSON
//! (`{"172.18.0.0/24": [..]}`). Bit 63 of word 0 is host offset 1, bit 0
//! of word 0 is offset 64, bit 63 of word 1 is offset 65 and so on. The
//! table is reloaded at the start of every call and rewritten at the end;
//! there is no locking, so two concurrent keg invocations can lose updates.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use keg_common::{KegError, KegResult};

/// Subnet (masked CIDR string) to allocation words.
type SubnetTable = BTreeMap<String, Vec<i64>>;

/// A word with every bit set.
const FULL_WORD: i64 = -1;

/// File-backed address allocator.
#[derive(Debug, Clone)]
pub struct Ipam {
    /// Location of the subnet allocation table.
    path: PathBuf,
}

impl Ipam {
    /// Create an allocator persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the allocation table.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> KegResult<SubnetTable> {
        if !self.path.exists() {
            return Ok(SubnetTable::new());
        }
        let json = std::fs::read_to_string(&self.path)?;
        if json.trim().is_empty() {
            return Ok(SubnetTable::new());
        }
        Ok(serde_json::from_str(&json)?)
    }

    fn store(&self, table: &SubnetTable) -> KegResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string(table)?)?;
        Ok(())
    }

    /// Allocate the next free host address of `subnet`.
    ///
    /// Words are scanned in order and bits from 63 down to 0. The first
    /// clear bit decides the result: when its offset lies past the last
    /// usable address the call fails without persisting anything.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::SubnetExhausted`] when no usable address is
    /// left, or an I/O error if the table cannot be read or written.
    pub fn allocate(&self, subnet: &Ipv4Network) -> KegResult<Ipv4Addr> {
        let network = masked(subnet);
        let key = network.to_string();
        let host_bits = 32 - u32::from(network.prefix());
        let total = usable_hosts(host_bits);

        let mut table = self.load()?;
        let words = table
            .entry(key.clone())
            .or_insert_with(|| vec![0; word_count(host_bits)]);

        for (idx, word) in words.iter_mut().enumerate() {
            if *word == FULL_WORD {
                continue;
            }
            for bit in (0..64).rev() {
                if (*word >> bit) & 1 != 0 {
                    continue;
                }
                let offset = 64 * idx as u64 + 64 - bit as u64;
                if offset > total {
                    return Err(KegError::SubnetExhausted { subnet: key });
                }
                *word |= 1i64 << bit;

                let ip = Ipv4Addr::from(u32::from(network.network()) + offset as u32);
                self.store(&table)?;
                tracing::debug!(subnet = %key, %ip, offset, "Allocated address");
                return Ok(ip);
            }
        }

        Err(KegError::SubnetExhausted { subnet: key })
    }

    /// Return `ip` to the pool of `subnet`.
    ///
    /// Releasing an address of a subnet with no allocation table is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::InvalidSubnet`] when `ip` is not a host address
    /// of `subnet`.
    pub fn release(&self, subnet: &Ipv4Network, ip: Ipv4Addr) -> KegResult<()> {
        let network = masked(subnet);
        let key = network.to_string();
        let offset = host_offset(&network, ip)?;

        let mut table = self.load()?;
        let Some(words) = table.get_mut(&key) else {
            tracing::debug!(subnet = %key, %ip, "Release on unknown subnet ignored");
            return Ok(());
        };

        let (idx, bit) = bit_position(offset);
        if let Some(word) = words.get_mut(idx) {
            *word &= !(1i64 << bit);
        }
        self.store(&table)?;

        tracing::debug!(subnet = %key, %ip, offset, "Released address");
        Ok(())
    }

    /// Drop the whole allocation table of `subnet`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read or written.
    pub fn remove_subnet(&self, subnet: &Ipv4Network) -> KegResult<()> {
        let key = masked(subnet).to_string();
        let mut table = self.load()?;
        if table.remove(&key).is_some() {
            self.store(&table)?;
            tracing::debug!(subnet = %key, "Removed subnet allocation table");
        }
        Ok(())
    }
}

/// `subnet` with its host bits cleared.
pub(crate) fn masked(subnet: &Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(subnet.network(), subnet.prefix()).unwrap_or(*subnet)
}

/// Usable addresses: everything except the network and broadcast ends.
fn usable_hosts(host_bits: u32) -> u64 {
    (1u64 << host_bits).saturating_sub(2)
}

/// One word per 64 hosts, at least one.
fn word_count(host_bits: u32) -> usize {
    1usize << host_bits.saturating_sub(6)
}

/// 1-based host offset of `ip` inside `network`.
fn host_offset(network: &Ipv4Network, ip: Ipv4Addr) -> KegResult<u64> {
    let invalid = || KegError::InvalidSubnet {
        cidr: format!("{ip} not in {network}"),
    };
    if !network.contains(ip) {
        return Err(invalid());
    }
    let offset = u64::from(u32::from(ip) - u32::from(network.network()));
    let host_bits = 32 - u32::from(network.prefix());
    if offset == 0 || offset > usable_hosts(host_bits) {
        return Err(invalid());
    }
    Ok(offset)
}

/// Word index and bit number holding a 1-based offset.
fn bit_position(offset: u64) -> (usize, u32) {
    let zero_based = offset - 1;
    ((zero_based / 64) as usize, 63 - (zero_based % 64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn ipam_in(dir: &Path) -> Ipam {
        Ipam::new(dir.join("ipam").join("subnet.json"))
    }

    #[test]
    fn first_addresses_are_sequential() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("172.18.0.0/24");

        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(172, 18, 0, 1));
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(172, 18, 0, 2));
        assert!(ipam.path().exists());
    }

    #[test]
    fn unmasked_subnet_uses_network_base() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());

        assert_eq!(ipam.allocate(&net("172.18.0.0/24")).unwrap(), Ipv4Addr::new(172, 18, 0, 1));
        assert_eq!(ipam.allocate(&net("172.18.0.1/24")).unwrap(), Ipv4Addr::new(172, 18, 0, 2));
    }

    #[test]
    fn slash_24_allows_exactly_254() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("172.18.0.0/24");

        let mut seen = HashSet::new();
        for _ in 0..254 {
            let ip = ipam.allocate(&subnet).unwrap();
            assert!(subnet.contains(ip));
            assert!(seen.insert(ip));
        }
        assert!(!seen.contains(&Ipv4Addr::new(172, 18, 0, 0)));
        assert!(!seen.contains(&Ipv4Addr::new(172, 18, 0, 255)));

        let err = ipam.allocate(&subnet).unwrap_err();
        assert!(matches!(err, KegError::SubnetExhausted { .. }));
    }

    #[test]
    fn exhaustion_does_not_persist_the_overflow_bit() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("10.0.0.0/30");

        ipam.allocate(&subnet).unwrap();
        ipam.allocate(&subnet).unwrap();
        let before = std::fs::read_to_string(ipam.path()).unwrap();
        assert!(ipam.allocate(&subnet).is_err());
        assert!(ipam.allocate(&subnet).is_err());
        assert_eq!(std::fs::read_to_string(ipam.path()).unwrap(), before);
    }

    #[test]
    fn multi_word_subnet() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("10.1.0.0/25");

        for expected in 1..=126u32 {
            let ip = ipam.allocate(&subnet).unwrap();
            assert_eq!(u32::from(ip) - u32::from(subnet.network()), expected);
        }
        assert!(ipam.allocate(&subnet).is_err());
    }

    #[test]
    fn release_then_reallocate_same_address() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("192.168.10.0/24");

        let _a = ipam.allocate(&subnet).unwrap();
        let b = ipam.allocate(&subnet).unwrap();
        let _c = ipam.allocate(&subnet).unwrap();

        ipam.release(&subnet, b).unwrap();
        assert_eq!(ipam.allocate(&subnet).unwrap(), b);
    }

    #[test]
    fn release_across_word_boundary() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("10.2.0.0/24");

        let ips: Vec<_> = (0..70).map(|_| ipam.allocate(&subnet).unwrap()).collect();
        for &ip in &[ips[63], ips[64]] {
            ipam.release(&subnet, ip).unwrap();
            assert_eq!(ipam.allocate(&subnet).unwrap(), ip);
        }
    }

    #[test]
    fn release_rejects_foreign_address() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("10.3.0.0/24");
        ipam.allocate(&subnet).unwrap();

        assert!(ipam.release(&subnet, Ipv4Addr::new(10, 4, 0, 1)).is_err());
        assert!(ipam.release(&subnet, Ipv4Addr::new(10, 3, 0, 0)).is_err());
        assert!(ipam.release(&subnet, Ipv4Addr::new(10, 3, 0, 255)).is_err());
    }

    #[test]
    fn release_on_unknown_subnet_is_noop() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        ipam.release(&net("10.9.0.0/24"), Ipv4Addr::new(10, 9, 0, 7)).unwrap();
        assert!(!ipam.path().exists());
    }

    #[test]
    fn remove_subnet_resets_allocation() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        let subnet = net("172.24.0.0/24");

        ipam.allocate(&subnet).unwrap();
        ipam.allocate(&subnet).unwrap();
        ipam.remove_subnet(&subnet).unwrap();
        assert_eq!(ipam.allocate(&subnet).unwrap(), Ipv4Addr::new(172, 24, 0, 1));
    }

    #[test]
    fn tiny_subnets_have_no_hosts() {
        let temp = tempdir().unwrap();
        let ipam = ipam_in(temp.path());
        assert!(ipam.allocate(&net("10.5.0.0/31")).is_err());
        assert!(ipam.allocate(&net("10.5.0.0/32")).is_err());
    }

    #[test]
    fn bit_position_matches_allocation_order() {
        assert_eq!(bit_position(1), (0, 63));
        assert_eq!(bit_position(64), (0, 0));
        assert_eq!(bit_position(65), (1, 63));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn allocations_fill_subnet_exactly(prefix in 24u8..=30, third in 0u8..=255) {
            let temp = tempdir().unwrap();
            let ipam = ipam_in(temp.path());
            let subnet = Ipv4Network::new(Ipv4Addr::new(10, 20, third, 0), prefix).unwrap();
            let total = (1u32 << (32 - u32::from(prefix))) - 2;

            let mut seen = HashSet::new();
            for _ in 0..total {
                let ip = ipam.allocate(&subnet).unwrap();
                prop_assert!(subnet.contains(ip));
                prop_assert_ne!(ip, subnet.network());
                prop_assert_ne!(ip, subnet.broadcast());
                prop_assert!(seen.insert(ip));
            }
            prop_assert!(ipam.allocate(&subnet).is_err());
        }

        #[test]
        fn release_frees_exactly_one(prefix in 24u8..=28, pick in 0usize..14) {
            let temp = tempdir().unwrap();
            let ipam = ipam_in(temp.path());
            let subnet = Ipv4Network::new(Ipv4Addr::new(10, 30, 0, 0), prefix).unwrap();

            let ips: Vec<_> = (0..14).map(|_| ipam.allocate(&subnet).unwrap()).collect();
            ipam.release(&subnet, ips[pick]).unwrap();
            prop_assert_eq!(ipam.allocate(&subnet).unwrap(), ips[pick]);
        }
    }
}
