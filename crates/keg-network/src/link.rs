//! Link, address and route management over rtnetlink.
//!
//! A thin wrapper around an [`rtnetlink::Handle`] that speaks in interface
//! names and maps every failure to [`KegError::Netlink`].

use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use keg_common::{KegError, KegResult};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{Handle, LinkBridge, LinkUnspec, LinkVeth, RouteMessageBuilder};

/// Errno reported when an object already exists.
const EEXIST: i32 = 17;

fn netlink_error(operation: impl Into<String>, err: &rtnetlink::Error) -> KegError {
    KegError::Netlink {
        operation: operation.into(),
        message: err.to_string(),
    }
}

fn is_exists(err: &rtnetlink::Error) -> bool {
    matches!(
        err,
        rtnetlink::Error::NetlinkError(msg) if msg.code.is_some_and(|c| c.get() == -EEXIST)
    )
}

/// Outcome of an address assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOutcome {
    /// The address was added.
    Added,
    /// The interface already carried the address.
    AlreadyPresent,
}

/// Connection to the kernel routing socket of the calling thread's
/// network namespace.
#[derive(Debug, Clone)]
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    /// Open a netlink connection and drive it on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the socket cannot be opened.
    pub fn connect() -> KegResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(|e| KegError::Netlink {
            operation: "connect".to_string(),
            message: e.to_string(),
        })?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Index of the interface called `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the link dump fails.
    pub async fn find(&self, name: &str) -> KegResult<Option<u32>> {
        let mut links = self.handle.link().get().execute();
        while let Some(msg) = links
            .try_next()
            .await
            .map_err(|e| netlink_error("link dump", &e))?
        {
            if link_name(&msg).is_some_and(|n| n == name) {
                return Ok(Some(msg.header.index));
            }
        }
        Ok(None)
    }

    /// Index of the interface called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the interface does not exist.
    pub async fn index_of(&self, name: &str) -> KegResult<u32> {
        self.find(name).await?.ok_or_else(|| KegError::Netlink {
            operation: format!("lookup {name}"),
            message: "no such interface".to_string(),
        })
    }

    /// Create a bridge device.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request.
    pub async fn add_bridge(&self, name: &str) -> KegResult<u32> {
        tracing::debug!(name, "Creating bridge");
        self.handle
            .link()
            .add(LinkBridge::new(name).build())
            .execute()
            .await
            .map_err(|e| netlink_error(format!("add bridge {name}"), &e))?;
        self.index_of(name).await
    }

    /// Create a veth pair and return the index of the `host` end.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request.
    pub async fn add_veth(&self, host: &str, peer: &str) -> KegResult<u32> {
        tracing::debug!(host, peer, "Creating veth pair");
        self.handle
            .link()
            .add(LinkVeth::new(host, peer).build())
            .execute()
            .await
            .map_err(|e| netlink_error(format!("add veth {host}"), &e))?;
        self.index_of(host).await
    }

    /// Attach the interface at `index` to the bridge at `controller`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request.
    pub async fn set_controller(&self, index: u32, controller: u32) -> KegResult<()> {
        self.set(
            LinkUnspec::new_with_index(index).controller(controller).build(),
            "set controller",
        )
        .await
    }

    /// Bring the interface at `index` up.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request.
    pub async fn set_up(&self, index: u32) -> KegResult<()> {
        self.set(LinkUnspec::new_with_index(index).up().build(), "set up")
            .await
    }

    /// Move the interface at `index` into the namespace behind `fd`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request.
    pub async fn set_netns_fd(&self, index: u32, fd: RawFd) -> KegResult<()> {
        self.set(
            LinkUnspec::new_with_index(index).setns_by_fd(fd).build(),
            "set netns",
        )
        .await
    }

    async fn set(&self, message: LinkMessage, operation: &str) -> KegResult<()> {
        self.handle
            .link()
            .set(message)
            .execute()
            .await
            .map_err(|e| netlink_error(operation, &e))
    }

    /// Assign `address` (with its prefix) to the interface at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request for
    /// any reason other than the address being present already.
    pub async fn add_address(&self, index: u32, address: Ipv4Network) -> KegResult<AddressOutcome> {
        tracing::debug!(index, %address, "Assigning address");
        match self
            .handle
            .address()
            .add(index, IpAddr::V4(address.ip()), address.prefix())
            .execute()
            .await
        {
            Ok(()) => Ok(AddressOutcome::Added),
            Err(e) if is_exists(&e) => Ok(AddressOutcome::AlreadyPresent),
            Err(e) => Err(netlink_error(format!("add address {address}"), &e)),
        }
    }

    /// Install a default route through `gateway` on the interface at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request.
    pub async fn add_default_route(&self, index: u32, gateway: Ipv4Addr) -> KegResult<()> {
        tracing::debug!(index, %gateway, "Adding default route");
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .output_interface(index)
            .gateway(gateway)
            .build();
        self.handle
            .route()
            .add(route)
            .execute()
            .await
            .map_err(|e| netlink_error("add default route", &e))
    }

    /// Delete the interface at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the kernel rejects the request.
    pub async fn delete(&self, index: u32) -> KegResult<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| netlink_error("delete link", &e))
    }

    /// Delete the interface called `name` if it exists.
    ///
    /// Returns whether a link was removed.
    ///
    /// # Errors
    ///
    /// Returns [`KegError::Netlink`] if the lookup or deletion fails.
    pub async fn delete_by_name(&self, name: &str) -> KegResult<bool> {
        match self.find(name).await? {
            Some(index) => {
                tracing::debug!(name, index, "Deleting link");
                self.delete(index).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn link_name(msg: &LinkMessage) -> Option<&str> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_is_visible() {
        let netlink = Netlink::connect().unwrap();
        assert!(netlink.find("lo").await.unwrap().is_some());
        assert!(netlink.find("keg-no-such-if").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn index_of_missing_interface_is_an_error() {
        let netlink = Netlink::connect().unwrap();
        assert!(matches!(
            netlink.index_of("keg-no-such-if").await,
            Err(KegError::Netlink { .. })
        ));
    }
}
