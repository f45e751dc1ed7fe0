//! # keg-network
//!
//! Bridge networking for keg containers.
//!
//! - [`Ipam`]: file-backed bitmap allocator for subnet host addresses
//! - [`BridgeDriver`]: Linux bridge + veth plumbing over rtnetlink
//! - [`netns`]: run netlink work inside a container's network namespace
//! - [`NetworkContext`]: per-invocation registry of networks and drivers,
//!   and the container connect/disconnect flows

#![warn(missing_docs)]

pub mod bridge;
pub mod context;
pub mod driver;
pub mod endpoint;
pub mod ipam;
pub mod iptables;
pub mod link;
pub mod netns;
pub mod network;

pub use bridge::BridgeDriver;
pub use context::NetworkContext;
pub use driver::NetworkDriver;
pub use endpoint::Endpoint;
pub use ipam::Ipam;
pub use iptables::{NatRule, PortMapping};
pub use link::Netlink;
pub use network::NetworkRecord;
