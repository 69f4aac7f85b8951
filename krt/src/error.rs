//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{error, warn};

// Redistribution errors.
#[derive(Debug)]
pub enum Error {
    // Kernel adapter
    KernelIo(String),
    KernelPermission(String),
    LinkNotFound(String),
    VrfTableNotFound(String),
    RouteProtocolInvalid(u8),
    // Route installation
    NoNexthop(IpNetwork),
    NexthopUnreachable(IpNetwork, IpAddr),
    KernelInstall(IpNetwork, String),
    // RIB adapter
    RibRequest(String),
    // Configuration
    CommunityInvalid(String),
    LargeCommunityInvalid(String),
    RouteDistinguisherInvalid(String),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::KernelIo(message) => {
                warn!(%message, "{}", self);
            }
            Error::KernelPermission(message) => {
                error!(%message, "{}", self);
            }
            Error::LinkNotFound(name) | Error::VrfTableNotFound(name) => {
                warn!(%name, "{}", self);
            }
            Error::RouteProtocolInvalid(id) => {
                error!(%id, "{}", self);
            }
            Error::NoNexthop(prefix) => {
                warn!(%prefix, "{}", self);
            }
            Error::NexthopUnreachable(prefix, nexthop) => {
                warn!(%prefix, %nexthop, "{}", self);
            }
            Error::KernelInstall(prefix, message) => {
                warn!(%prefix, %message, "{}", self);
            }
            Error::RibRequest(message) => {
                warn!(%message, "{}", self);
            }
            Error::CommunityInvalid(community)
            | Error::LargeCommunityInvalid(community) => {
                warn!(%community, "{}", self);
            }
            Error::RouteDistinguisherInvalid(rd) => {
                warn!(%rd, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::KernelIo(..) => {
                write!(f, "kernel request failed")
            }
            Error::KernelPermission(..) => {
                write!(f, "insufficient privileges for kernel request")
            }
            Error::LinkNotFound(..) => {
                write!(f, "interface not found")
            }
            Error::VrfTableNotFound(..) => {
                write!(f, "VRF device has no routing table")
            }
            Error::RouteProtocolInvalid(..) => {
                write!(f, "invalid route protocol identifier")
            }
            Error::NoNexthop(..) => {
                write!(f, "path has no usable nexthop")
            }
            Error::NexthopUnreachable(..) => {
                write!(f, "no kernel route to nexthop")
            }
            Error::KernelInstall(..) => {
                write!(f, "kernel rejected route request")
            }
            Error::RibRequest(..) => {
                write!(f, "RIB request failed")
            }
            Error::CommunityInvalid(..) => {
                write!(f, "invalid community")
            }
            Error::LargeCommunityInvalid(..) => {
                write!(f, "invalid large community")
            }
            Error::RouteDistinguisherInvalid(..) => {
                write!(f, "invalid route distinguisher")
            }
        }
    }
}

impl std::error::Error for Error {}
