//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bitflags::bitflags;
use derive_new::new;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

// Route protocol identifier, as carried in the kernel's route-protocol
// field (rtnetlink.h). Routes installed by the export engine are tagged
// with a configurable identifier so they can be told apart from routes
// owned by other daemons.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(transparent)]
pub struct RouteProtocolId(pub u8);

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct KernelRouteFlags: u8 {
        // Nexthop is reachable on the output link even without a
        // covering connected route.
        const ONLINK = 0x01;
    }
}

// Kind of a kernel network device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Vrf,
    Dummy,
    Device,
}

// A kernel network device.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct Link {
    pub name: String,
    pub ifindex: u32,
    pub kind: LinkKind,
    // Routing table bound to the device (VRF links only).
    pub vrf_table: Option<u32>,
}

// An address configured on a kernel network device.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct LinkAddress {
    // Prefix and prefix length as configured on the device.
    pub prefix: IpNetwork,
    // The device's own address within the prefix.
    pub addr: IpAddr,
}

// A route as installed in (or read from) a kernel routing table.
//
// Uniquely identified in the kernel by (table, destination); replace and
// delete requests match on that key.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct KernelRoute {
    pub prefix: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub table_id: u32,
    pub metric: u32,
    pub protocol: RouteProtocolId,
    // Output device, set when the route targets a VRF device directly.
    pub ifindex: Option<u32>,
    pub flags: KernelRouteFlags,
}

// ===== impl RouteProtocolId =====

impl RouteProtocolId {
    pub const STATIC: RouteProtocolId = RouteProtocolId(4);
    pub const BGP: RouteProtocolId = RouteProtocolId(186);
    pub const OSPF: RouteProtocolId = RouteProtocolId(188);
    pub const RIP: RouteProtocolId = RouteProtocolId(189);
}

impl std::fmt::Display for RouteProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RouteProtocolId::STATIC => write!(f, "static"),
            RouteProtocolId::BGP => write!(f, "bgp"),
            RouteProtocolId::OSPF => write!(f, "ospf"),
            RouteProtocolId::RIP => write!(f, "rip"),
            RouteProtocolId(id) => write!(f, "{id}"),
        }
    }
}

// ===== impl LinkKind =====

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Vrf => write!(f, "vrf"),
            LinkKind::Dummy => write!(f, "dummy"),
            LinkKind::Device => write!(f, "device"),
        }
    }
}

// ===== impl Link =====

impl Link {
    pub fn is_vrf(&self) -> bool {
        self.kind == LinkKind::Vrf
    }
}
