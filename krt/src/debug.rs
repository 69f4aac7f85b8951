//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use tracing::debug;

// Redistribution debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    ImportScan(&'a str),
    ImportAdd(&'a str, &'a IpNetwork),
    ImportWithdraw(&'a str, &'a IpNetwork),
    ExportInstall(&'a str, &'a IpNetwork, &'a IpAddr),
    ExportUptodate(&'a IpNetwork),
    ExportRepair(&'a IpNetwork),
    ExportParamChange(&'a str, &'a IpNetwork),
    ExportWithdraw(&'a str, &'a IpNetwork),
    ExportDampened(&'a IpNetwork, Duration),
    ExportUnboundRd(&'a IpNetwork),
    Reconfigure(usize, usize),
    Flush(usize),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::ImportScan(vrf) => {
                debug!(%vrf, "{}", self);
            }
            Debug::ImportAdd(vrf, prefix)
            | Debug::ImportWithdraw(vrf, prefix) => {
                debug!(%vrf, %prefix, "{}", self);
            }
            Debug::ExportInstall(rule, prefix, nexthop) => {
                debug!(%rule, %prefix, %nexthop, "{}", self);
            }
            Debug::ExportUptodate(prefix)
            | Debug::ExportRepair(prefix)
            | Debug::ExportUnboundRd(prefix) => {
                debug!(%prefix, "{}", self);
            }
            Debug::ExportDampened(prefix, elapsed) => {
                debug!(%prefix, ?elapsed, "{}", self);
            }
            Debug::ExportParamChange(rule, prefix) => {
                debug!(%rule, %prefix, "{}", self);
            }
            Debug::ExportWithdraw(vrf, prefix) => {
                debug!(%vrf, %prefix, "{}", self);
            }
            Debug::Reconfigure(rules, bindings) => {
                debug!(%rules, %bindings, "{}", self);
            }
            Debug::Flush(count) => {
                debug!(%count, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::ImportScan(..) => {
                write!(f, "scanning interfaces")
            }
            Debug::ImportAdd(..) => {
                write!(f, "advertising connected prefix")
            }
            Debug::ImportWithdraw(..) => {
                write!(f, "withdrawing connected prefix")
            }
            Debug::ExportInstall(..) => {
                write!(f, "installing kernel route")
            }
            Debug::ExportUptodate(..) => {
                write!(f, "kernel route is up to date")
            }
            Debug::ExportRepair(..) => {
                write!(f, "kernel route disappeared, reinstalling")
            }
            Debug::ExportParamChange(..) => {
                write!(f, "route parameters changed, replacing kernel route")
            }
            Debug::ExportWithdraw(..) => {
                write!(f, "removing kernel route")
            }
            Debug::ExportDampened(..) => {
                write!(f, "update superseded pending update")
            }
            Debug::ExportUnboundRd(..) => {
                write!(f, "no VRF bound to route distinguisher")
            }
            Debug::Reconfigure(..) => {
                write!(f, "re-evaluating RIB against new rule set")
            }
            Debug::Flush(..) => {
                write!(f, "flushed exported kernel routes")
            }
        }
    }
}
