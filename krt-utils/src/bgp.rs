//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use derive_new::new;
use enum_as_inner::EnumAsInner;
use ipnetwork::IpNetwork;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::ip::{AddressFamily, IpAddrExt, IpNetworkExt};

// Configurable (AFI,SAFI) tuples.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum AfiSafi {
    Ipv4Unicast,
    Ipv6Unicast,
    Ipv4Vpn,
    Ipv6Vpn,
}

// BGP origin path attribute.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

// Standard community (RFC 1997), stored as a plain 32-bit value.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Comm(pub u32);

// Large community (RFC 8092): global administrator plus two local data
// parts.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct LargeComm(pub u32, pub u32, pub u32);

// Route Distinguisher (RFC 4364), namespacing VPN prefixes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum RouteDistinguisher {
    As2 { asn: u16, value: u32 },
    Ipv4 { addr: Ipv4Addr, value: u16 },
    As4 { asn: u32, value: u16 },
}

// Synthetic peer attached to locally-originated (netlink-sourced) paths.
//
// Identifies the interface the prefix was learned from, together with the
// interface's own address. The peer session layer uses it to rewrite the
// per-peer nexthop when advertising these paths.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct ConnectedPeer {
    pub ifname: String,
    pub addr: IpAddr,
}

// Network-layer reachability information of a path.
//
// VPN prefixes carry a Route Distinguisher; the plain prefix is what ends
// up in a kernel table, while the RD selects the VRF it belongs to.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum PathNlri {
    Unicast(IpNetwork),
    Vpn {
        prefix: IpNetwork,
        rd: RouteDistinguisher,
    },
}

// A BGP path as exchanged with the RIB.
//
// Only the attributes the redistribution engines consume are modeled;
// everything else stays with the RIB.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Path {
    pub nlri: PathNlri,
    pub origin: Origin,
    pub nexthop: IpAddr,
    pub withdraw: bool,
    pub med: Option<u32>,
    pub comms: BTreeSet<Comm>,
    pub large_comms: BTreeSet<LargeComm>,
    pub peer: Option<ConnectedPeer>,
}

// ===== impl AfiSafi =====

impl std::fmt::Display for AfiSafi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AfiSafi::Ipv4Unicast => write!(f, "ipv4-unicast"),
            AfiSafi::Ipv6Unicast => write!(f, "ipv6-unicast"),
            AfiSafi::Ipv4Vpn => write!(f, "ipv4-l3vpn"),
            AfiSafi::Ipv6Vpn => write!(f, "ipv6-l3vpn"),
        }
    }
}

// ===== impl Comm =====

impl std::fmt::Display for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0 >> 16, self.0 & 0xFFFF)
    }
}

impl FromStr for Comm {
    type Err = ();

    // Accepts both the "ASN:value" form and a plain 32-bit decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((asn, value)) => {
                let asn = asn.parse::<u16>().map_err(|_| ())?;
                let value = value.parse::<u16>().map_err(|_| ())?;
                Ok(Comm((u32::from(asn) << 16) | u32::from(value)))
            }
            None => s.parse::<u32>().map(Comm).map_err(|_| ()),
        }
    }
}

// ===== impl LargeComm =====

impl std::fmt::Display for LargeComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.0, self.1, self.2)
    }
}

impl FromStr for LargeComm {
    type Err = ();

    // Accepts the "asn:localdata1:localdata2" form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let asn = parts.next().ok_or(())?.parse::<u32>().map_err(|_| ())?;
        let ld1 = parts.next().ok_or(())?.parse::<u32>().map_err(|_| ())?;
        let ld2 = parts.next().ok_or(())?.parse::<u32>().map_err(|_| ())?;
        if parts.next().is_some() {
            return Err(());
        }
        Ok(LargeComm(asn, ld1, ld2))
    }
}

// ===== impl RouteDistinguisher =====

impl std::fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteDistinguisher::As2 { asn, value } => {
                write!(f, "{asn}:{value}")
            }
            RouteDistinguisher::Ipv4 { addr, value } => {
                write!(f, "{addr}:{value}")
            }
            RouteDistinguisher::As4 { asn, value } => {
                write!(f, "{asn}:{value}")
            }
        }
    }
}

impl FromStr for RouteDistinguisher {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (admin, value) = s.rsplit_once(':').ok_or(())?;
        if admin.contains('.') {
            let addr = admin.parse::<Ipv4Addr>().map_err(|_| ())?;
            let value = value.parse::<u16>().map_err(|_| ())?;
            return Ok(RouteDistinguisher::Ipv4 { addr, value });
        }
        let asn = admin.parse::<u32>().map_err(|_| ())?;
        if asn > u32::from(u16::MAX) {
            let value = value.parse::<u16>().map_err(|_| ())?;
            Ok(RouteDistinguisher::As4 { asn, value })
        } else {
            let value = value.parse::<u32>().map_err(|_| ())?;
            Ok(RouteDistinguisher::As2 {
                asn: asn as u16,
                value,
            })
        }
    }
}

// ===== impl Path =====

impl Path {
    // Creates a plain unicast path.
    pub fn unicast(prefix: IpNetwork, nexthop: IpAddr) -> Path {
        Path {
            nlri: PathNlri::Unicast(prefix),
            origin: Origin::Igp,
            nexthop,
            withdraw: false,
            med: None,
            comms: Default::default(),
            large_comms: Default::default(),
            peer: None,
        }
    }

    // Creates a VPN path carrying a Route Distinguisher.
    pub fn vpn(
        prefix: IpNetwork,
        rd: RouteDistinguisher,
        nexthop: IpAddr,
    ) -> Path {
        Path {
            nlri: PathNlri::Vpn { prefix, rd },
            origin: Origin::Igp,
            nexthop,
            withdraw: false,
            med: None,
            comms: Default::default(),
            large_comms: Default::default(),
            peer: None,
        }
    }

    // Creates a connected-route path for a prefix learned from a local
    // interface.
    //
    // The nexthop attribute is left unspecified; the peer session layer
    // rewrites it per-peer before advertising, keyed off the attached
    // synthetic peer.
    pub fn connected(
        prefix: IpNetwork,
        ifname: impl Into<String>,
        ifaddr: IpAddr,
    ) -> Path {
        let nexthop = IpAddr::unspecified(prefix.address_family());
        Path {
            nlri: PathNlri::Unicast(prefix),
            origin: Origin::Igp,
            nexthop,
            withdraw: false,
            med: None,
            comms: Default::default(),
            large_comms: Default::default(),
            peer: Some(ConnectedPeer::new(ifname.into(), ifaddr)),
        }
    }

    // Returns the plain prefix, without the Route Distinguisher for VPN
    // paths.
    pub fn prefix(&self) -> IpNetwork {
        match &self.nlri {
            PathNlri::Unicast(prefix) => *prefix,
            PathNlri::Vpn { prefix, .. } => *prefix,
        }
    }

    pub fn address_family(&self) -> AddressFamily {
        self.prefix().address_family()
    }

    pub fn afi_safi(&self) -> AfiSafi {
        match (&self.nlri, self.address_family()) {
            (PathNlri::Unicast(_), AddressFamily::Ipv4) => AfiSafi::Ipv4Unicast,
            (PathNlri::Unicast(_), AddressFamily::Ipv6) => AfiSafi::Ipv6Unicast,
            (PathNlri::Vpn { .. }, AddressFamily::Ipv4) => AfiSafi::Ipv4Vpn,
            (PathNlri::Vpn { .. }, AddressFamily::Ipv6) => AfiSafi::Ipv6Vpn,
        }
    }

    pub fn rd(&self) -> Option<RouteDistinguisher> {
        match &self.nlri {
            PathNlri::Unicast(_) => None,
            PathNlri::Vpn { rd, .. } => Some(*rd),
        }
    }

    // Whether this path was originated from a local interface scan rather
    // than learned from a peer.
    pub fn is_netlink_sourced(&self) -> bool {
        self.peer.is_some()
    }

    // Produces the withdrawal twin of this path.
    pub fn to_withdraw(&self) -> Path {
        let mut path = self.clone();
        path.withdraw = true;
        path
    }
}

// ===== unit tests =====
