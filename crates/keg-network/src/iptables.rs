//! NAT rules for container networking.
//!
//! Two rule shapes are used: a per-network MASQUERADE rule so containers
//! reach the outside world, and a per-port DNAT rule exposing a container
//! port on the host.

use std::fmt;
use std::net::Ipv4Addr;
use std::process::Command;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use keg_common::{KegError, KegResult};

/// A `host_port:container_port` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Port exposed on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Parse a `host:container` spec.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::InvalidPortMapping`] unless the spec has exactly
    /// two non-empty colon-separated port numbers.
    pub fn parse(spec: &str) -> KegResult<Self> {
        let invalid = || KegError::InvalidPortMapping {
            spec: spec.to_string(),
        };
        let mut parts = spec.split(':');
        let (Some(host), Some(container), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        Ok(Self {
            host_port: host.parse().map_err(|_| invalid())?,
            container_port: container.parse().map_err(|_| invalid())?,
        })
    }

    /// Parse every spec, failing on the first malformed one.
    ///
    /// # Errors
    ///
    /// Returns the error of the first malformed spec.
    pub fn parse_all<S: AsRef<str>>(specs: &[S]) -> KegResult<Vec<Self>> {
        specs.iter().map(|s| Self::parse(s.as_ref())).collect()
    }
}

impl FromStr for PortMapping {
    type Err = KegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

/// Whether a rule is appended or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Append,
    Delete,
}

impl Action {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// A rule in the `nat` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatRule {
    /// Masquerade traffic from `subnet` unless it leaves through `bridge`.
    Masquerade {
        /// Source subnet.
        subnet: Ipv4Network,
        /// Bridge the subnet lives on.
        bridge: String,
    },
    /// Redirect inbound TCP on `mapping.host_port` to `ip:mapping.container_port`.
    Dnat {
        /// Container address.
        ip: Ipv4Addr,
        /// Port pair.
        mapping: PortMapping,
    },
}

impl NatRule {
    /// Masquerade rule for a bridge network.
    pub fn masquerade(subnet: Ipv4Network, bridge: impl Into<String>) -> Self {
        Self::Masquerade {
            subnet: crate::ipam::masked(&subnet),
            bridge: bridge.into(),
        }
    }

    /// Port forwarding rule for a container.
    #[must_use]
    pub const fn dnat(ip: Ipv4Addr, mapping: PortMapping) -> Self {
        Self::Dnat { ip, mapping }
    }

    fn args(&self, action: Action) -> Vec<String> {
        let mut args = vec!["-t", "nat", action.flag()];
        let tail = match self {
            Self::Masquerade { subnet, bridge } => {
                let source = subnet.to_string();
                args.extend(["POSTROUTING", "-s"]);
                vec![source, "!".into(), "-o".into(), bridge.clone(), "-j".into(), "MASQUERADE".into()]
            }
            Self::Dnat { ip, mapping } => {
                args.extend(["PREROUTING", "-p", "tcp", "-m", "tcp", "--dport"]);
                vec![
                    mapping.host_port.to_string(),
                    "-j".into(),
                    "DNAT".into(),
                    "--to-destination".into(),
                    format!("{ip}:{}", mapping.container_port),
                ]
            }
        };
        args.into_iter().map(String::from).chain(tail).collect()
    }

    /// Install the rule.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Iptables`] if iptables cannot run or rejects the rule.
    pub fn append(&self) -> KegResult<()> {
        tracing::debug!(rule = ?self, "Appending NAT rule");
        run_iptables(&self.args(Action::Append))
    }

    /// Remove the rule.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Iptables`] if iptables cannot run or the rule is absent.
    pub fn delete(&self) -> KegResult<()> {
        tracing::debug!(rule = ?self, "Deleting NAT rule");
        run_iptables(&self.args(Action::Delete))
    }
}

/// Run an iptables command.
fn run_iptables(args: &[String]) -> KegResult<()> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| KegError::Iptables {
            args: args.join(" "),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(KegError::Iptables {
            args: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Enable IPv4 forwarding on the host.
///
/// # Errors
///
/// Returns an error if the sysctl file cannot be written.
pub fn enable_ip_forwarding() -> KegResult<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")?;
    tracing::debug!("IP forwarding enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_mapping() {
        let mapping = PortMapping::parse("8080:80").unwrap();
        assert_eq!(mapping.host_port, 8080);
        assert_eq!(mapping.container_port, 80);
        assert_eq!(mapping.to_string(), "8080:80");
    }

    #[test]
    fn reject_malformed_port_mappings() {
        for bad in ["8080", "8080:", ":80", "1:2:3", "http:80", "70000:80", ""] {
            assert!(
                matches!(PortMapping::parse(bad), Err(KegError::InvalidPortMapping { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn parse_all_stops_at_first_bad_spec() {
        assert_eq!(PortMapping::parse_all(&["1:2", "3:4"]).unwrap().len(), 2);
        assert!(PortMapping::parse_all(&["1:2", "oops"]).is_err());
    }

    #[test]
    fn masquerade_args() {
        let rule = NatRule::masquerade("172.18.0.1/24".parse().unwrap(), "testbr");
        assert_eq!(
            rule.args(Action::Append).join(" "),
            "-t nat -A POSTROUTING -s 172.18.0.0/24 ! -o testbr -j MASQUERADE"
        );
        assert_eq!(
            rule.args(Action::Delete).join(" "),
            "-t nat -D POSTROUTING -s 172.18.0.0/24 ! -o testbr -j MASQUERADE"
        );
    }

    #[test]
    fn dnat_args() {
        let rule = NatRule::dnat(Ipv4Addr::new(172, 18, 0, 2), PortMapping::parse("8080:80").unwrap());
        assert_eq!(
            rule.args(Action::Append).join(" "),
            "-t nat -A PREROUTING -p tcp -m tcp --dport 8080 -j DNAT --to-destination 172.18.0.2:80"
        );
    }
}
