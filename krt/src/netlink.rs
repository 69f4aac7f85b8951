//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use capctl::caps::CapState;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use krt_utils::ip::{AddressFamily, IpAddrExt};
use krt_utils::southbound::{
    KernelRoute, KernelRouteFlags, Link, LinkAddress, LinkKind,
    RouteProtocolId,
};
use netlink_packet_route::AddressFamily as NlAddressFamily;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVrf, LinkAttribute, LinkInfo, LinkMessage,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteFlags, RouteMessage, RouteProtocol,
};
use rtnetlink::{Handle, RouteMessageBuilder, new_connection};
use tracing::error;

use crate::error::Error;

// Main routing table id as defined in the rtnetlink.h kernel header.
pub const RT_TABLE_MAIN: u32 = 254;

// Capability over the OS route and link primitives consumed by both
// engines.
//
// The production implementation wraps a route-netlink socket. Keeping the
// engines generic over this trait allows unit testing them without kernel
// privileges.
pub trait KernelProvider: Send + Sync + 'static {
    // Lists every network device. VRF devices carry their bound routing
    // table id.
    fn links(&self) -> impl Future<Output = Result<Vec<Link>, Error>> + Send;

    // Lists the addresses configured on the given device, both families.
    fn addresses(
        &self,
        ifindex: u32,
    ) -> impl Future<Output = Result<Vec<LinkAddress>, Error>> + Send;

    // Lists the routes of the given table.
    fn routes(
        &self,
        table_id: u32,
        af: AddressFamily,
    ) -> impl Future<Output = Result<Vec<KernelRoute>, Error>> + Send;

    // Returns the routes covering the given address, across all tables.
    fn routes_to(
        &self,
        nexthop: IpAddr,
    ) -> impl Future<Output = Result<Vec<KernelRoute>, Error>> + Send;

    // Adds or updates a route, matching on (table, destination).
    fn route_replace(
        &self,
        route: &KernelRoute,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    // Deletes a route. Deleting a route that is already gone is not an
    // error.
    fn route_delete(
        &self,
        route: &KernelRoute,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn link_by_name(
        &self,
        ifname: &str,
    ) -> impl Future<Output = Result<Link, Error>> + Send {
        async move {
            self.links()
                .await?
                .into_iter()
                .find(|link| link.name == ifname)
                .ok_or_else(|| Error::LinkNotFound(ifname.to_owned()))
        }
    }

    fn link_by_index(
        &self,
        ifindex: u32,
    ) -> impl Future<Output = Result<Link, Error>> + Send {
        async move {
            self.links()
                .await?
                .into_iter()
                .find(|link| link.ifindex == ifindex)
                .ok_or_else(|| Error::LinkNotFound(format!("ifindex {ifindex}")))
        }
    }
}

// Kernel provider backed by a route-netlink socket.
#[derive(Debug)]
pub struct NetlinkProvider {
    handle: Handle,
}

// ===== impl NetlinkProvider =====

impl NetlinkProvider {
    // Creates the netlink socket and serves it from a dedicated thread with
    // permanently elevated capabilities.
    pub fn new() -> Result<NetlinkProvider, Error> {
        let (conn, handle, _) = new_connection()
            .map_err(|error| Error::KernelIo(error.to_string()))?;

        std::thread::spawn(|| {
            // Raise capabilities.
            match CapState::get_current() {
                Ok(mut caps) => {
                    caps.effective = caps.permitted;
                    if let Err(error) = caps.set_current() {
                        error!(%error, "failed to update current capabilities");
                    }
                }
                Err(error) => {
                    error!(%error, "failed to read current capabilities");
                }
            }

            // Serve requests initiated by the netlink handle.
            futures::executor::block_on(conn)
        });

        Ok(NetlinkProvider { handle })
    }

    async fn route_dump(
        &self,
        af: AddressFamily,
    ) -> Result<Vec<KernelRoute>, Error> {
        let msg = match af {
            AddressFamily::Ipv4 => {
                RouteMessageBuilder::<Ipv4Addr>::new().build()
            }
            AddressFamily::Ipv6 => {
                RouteMessageBuilder::<Ipv6Addr>::new().build()
            }
        };

        let mut request = self.handle.route().get(msg).execute();
        let mut routes = Vec::new();
        while let Some(msg) =
            request.try_next().await.map_err(netlink_error)?
        {
            if let Some(route) = parse_route(msg) {
                routes.push(route);
            }
        }
        Ok(routes)
    }
}

impl KernelProvider for NetlinkProvider {
    async fn links(&self) -> Result<Vec<Link>, Error> {
        let mut request = self.handle.link().get().execute();
        let mut links = Vec::new();
        while let Some(msg) =
            request.try_next().await.map_err(netlink_error)?
        {
            if let Some(link) = parse_link(msg) {
                links.push(link);
            }
        }
        Ok(links)
    }

    async fn addresses(&self, ifindex: u32) -> Result<Vec<LinkAddress>, Error> {
        let mut request = self
            .handle
            .address()
            .get()
            .set_link_index_filter(ifindex)
            .execute();

        let mut addresses = Vec::new();
        while let Some(msg) =
            request.try_next().await.map_err(netlink_error)?
        {
            let mut addr = None;
            let mut local = None;
            for attr in msg.attributes {
                match attr {
                    AddressAttribute::Address(address) => {
                        addr = Some(address);
                    }
                    AddressAttribute::Local(address) => {
                        local = Some(address);
                    }
                    _ => (),
                }
            }

            // IPv4 addresses carry the device's own address in the Local
            // attribute; IPv6 addresses only carry Address.
            let Some(addr) = local.or(addr) else {
                continue;
            };
            let Ok(prefix) = IpNetwork::new(addr, msg.header.prefix_len)
            else {
                continue;
            };
            addresses.push(LinkAddress::new(prefix, addr));
        }
        Ok(addresses)
    }

    async fn routes(
        &self,
        table_id: u32,
        af: AddressFamily,
    ) -> Result<Vec<KernelRoute>, Error> {
        let routes = self.route_dump(af).await?;
        Ok(routes
            .into_iter()
            .filter(|route| route.table_id == table_id)
            .collect())
    }

    async fn routes_to(
        &self,
        nexthop: IpAddr,
    ) -> Result<Vec<KernelRoute>, Error> {
        let routes = self.route_dump(nexthop.address_family()).await?;
        Ok(routes
            .into_iter()
            .filter(|route| route.prefix.contains(nexthop))
            .collect())
    }

    async fn route_replace(&self, route: &KernelRoute) -> Result<(), Error> {
        let msg = route_message(route);
        self.handle
            .route()
            .add(msg)
            .replace()
            .execute()
            .await
            .map_err(netlink_error)
    }

    async fn route_delete(&self, route: &KernelRoute) -> Result<(), Error> {
        let msg = route_message(route);
        match self.handle.route().del(msg).execute().await {
            Ok(()) => Ok(()),
            Err(error) => match &error {
                // The route was already gone.
                rtnetlink::Error::NetlinkError(message)
                    if message.raw_code() == -libc::ESRCH
                        || message.raw_code() == -libc::ENOENT =>
                {
                    Ok(())
                }
                _ => Err(netlink_error(error)),
            },
        }
    }
}

// ===== helper functions =====

fn netlink_error(error: rtnetlink::Error) -> Error {
    if let rtnetlink::Error::NetlinkError(message) = &error {
        let code = message.raw_code();
        if code == -libc::EPERM || code == -libc::EACCES {
            return Error::KernelPermission(error.to_string());
        }
    }
    Error::KernelIo(error.to_string())
}

fn parse_link(msg: LinkMessage) -> Option<Link> {
    let ifindex = msg.header.index;
    let mut name = None;
    let mut kind = LinkKind::Device;
    let mut vrf_table = None;
    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(ifname) => name = Some(ifname),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(InfoKind::Vrf) => {
                            kind = LinkKind::Vrf;
                        }
                        LinkInfo::Kind(InfoKind::Dummy) => {
                            kind = LinkKind::Dummy;
                        }
                        LinkInfo::Data(InfoData::Vrf(attrs)) => {
                            for attr in attrs {
                                if let InfoVrf::TableId(table_id) = attr {
                                    vrf_table = Some(table_id);
                                }
                            }
                        }
                        _ => (),
                    }
                }
            }
            _ => (),
        }
    }
    Some(Link::new(name?, ifindex, kind, vrf_table))
}

fn parse_route(msg: RouteMessage) -> Option<KernelRoute> {
    let af = match msg.header.address_family {
        NlAddressFamily::Inet => AddressFamily::Ipv4,
        NlAddressFamily::Inet6 => AddressFamily::Ipv6,
        _ => return None,
    };

    let mut table_id = u32::from(msg.header.table);
    let protocol = RouteProtocolId(u8::from(msg.header.protocol));
    let mut dst = None;
    let mut gateway = None;
    let mut metric = 0;
    let mut ifindex = None;
    for attr in msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => {
                dst = route_address(addr);
            }
            RouteAttribute::Gateway(addr) => {
                gateway = route_address(addr);
            }
            RouteAttribute::Table(id) => table_id = id,
            RouteAttribute::Priority(priority) => metric = priority,
            RouteAttribute::Oif(idx) => ifindex = Some(idx),
            _ => (),
        }
    }

    // Default routes carry no destination attribute.
    let dst = dst.unwrap_or_else(|| IpAddr::unspecified(af));
    let prefix =
        IpNetwork::new(dst, msg.header.destination_prefix_length).ok()?;

    Some(KernelRoute::new(
        prefix,
        gateway,
        table_id,
        metric,
        protocol,
        ifindex,
        KernelRouteFlags::empty(),
    ))
}

fn route_address(addr: RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(addr) => Some(IpAddr::V4(addr)),
        RouteAddress::Inet6(addr) => Some(IpAddr::V6(addr)),
        _ => None,
    }
}

fn route_message(route: &KernelRoute) -> RouteMessage {
    let mut msg = match route.prefix {
        IpNetwork::V4(prefix) => {
            let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(prefix.ip(), prefix.prefix())
                .protocol(RouteProtocol::from(route.protocol.0))
                .table_id(route.table_id);
            if let Some(IpAddr::V4(gateway)) = route.gateway {
                builder = builder.gateway(gateway);
            }
            if let Some(ifindex) = route.ifindex {
                builder = builder.output_interface(ifindex);
            }
            builder.build()
        }
        IpNetwork::V6(prefix) => {
            let mut builder = RouteMessageBuilder::<Ipv6Addr>::new()
                .destination_prefix(prefix.ip(), prefix.prefix())
                .protocol(RouteProtocol::from(route.protocol.0))
                .table_id(route.table_id);
            if let Some(IpAddr::V6(gateway)) = route.gateway {
                builder = builder.gateway(gateway);
            }
            if let Some(ifindex) = route.ifindex {
                builder = builder.output_interface(ifindex);
            }
            builder.build()
        }
    };

    msg.attributes.push(RouteAttribute::Priority(route.metric));
    if route.flags.contains(KernelRouteFlags::ONLINK) {
        msg.header.flags.insert(RouteFlags::Onlink);
    }
    msg
}
