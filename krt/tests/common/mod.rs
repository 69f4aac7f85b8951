//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipnetwork::IpNetwork;
use krt::error::Error;
use krt::export::{ExportEngine, ExportRule, VrfExportBinding};
use krt::netlink::KernelProvider;
use krt::rib::RibProvider;
use krt_utils::bgp::{Comm, Path};
use krt_utils::ip::AddressFamily;
use krt_utils::southbound::{
    KernelRoute, KernelRouteFlags, Link, LinkAddress, LinkKind,
    RouteProtocolId,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

// In-memory kernel: links, addresses and routing tables behind plain
// mutexes, plus request counters.
#[derive(Debug, Default)]
pub struct MockKernel {
    pub links: Mutex<Vec<Link>>,
    pub addresses: Mutex<BTreeMap<u32, Vec<LinkAddress>>>,
    pub routes: Mutex<Vec<KernelRoute>>,
    pub replaces: AtomicUsize,
    pub deletes: AtomicUsize,
}

// In-memory RIB: records submitted paths per table and hands out a
// best-path update channel.
#[derive(Debug, Default)]
pub struct MockRib {
    pub paths: Mutex<Vec<(String, Path)>>,
    pub enumeration: Mutex<Vec<Path>>,
    pub fail_submissions: AtomicBool,
    update_tx: Mutex<Option<UnboundedSender<Path>>>,
}

// ===== impl MockKernel =====

impl MockKernel {
    pub fn new() -> Arc<MockKernel> {
        Arc::new(Default::default())
    }

    pub fn add_link(
        &self,
        name: &str,
        ifindex: u32,
        kind: LinkKind,
        vrf_table: Option<u32>,
    ) {
        self.links.lock().unwrap().push(Link::new(
            name.to_owned(),
            ifindex,
            kind,
            vrf_table,
        ));
    }

    pub fn add_address(&self, ifindex: u32, prefix: IpNetwork) {
        self.addresses
            .lock()
            .unwrap()
            .entry(ifindex)
            .or_default()
            .push(LinkAddress::new(prefix, prefix.ip()));
    }

    pub fn del_address(&self, ifindex: u32, prefix: IpNetwork) {
        if let Some(addresses) =
            self.addresses.lock().unwrap().get_mut(&ifindex)
        {
            addresses.retain(|address| address.prefix != prefix);
        }
    }

    pub fn seed_route(&self, route: KernelRoute) {
        self.routes.lock().unwrap().push(route);
    }

    // Seeds a kernel-owned route, as left behind by the kernel itself when
    // an interface address is configured.
    pub fn seed_connected(&self, prefix: IpNetwork, table_id: u32) {
        self.seed_route(KernelRoute::new(
            prefix,
            None,
            table_id,
            0,
            RouteProtocolId(2),
            None,
            KernelRouteFlags::empty(),
        ));
    }

    pub fn route_in(
        &self,
        table_id: u32,
        prefix: IpNetwork,
    ) -> Option<KernelRoute> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .find(|route| {
                route.table_id == table_id && route.prefix == prefix
            })
            .cloned()
    }

    pub fn remove_route(&self, table_id: u32, prefix: IpNetwork) {
        self.routes.lock().unwrap().retain(|route| {
            !(route.table_id == table_id && route.prefix == prefix)
        });
    }

    pub fn routes_with_protocol(
        &self,
        protocol: RouteProtocolId,
    ) -> Vec<KernelRoute> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .filter(|route| route.protocol == protocol)
            .cloned()
            .collect()
    }

    pub fn replace_count(&self) -> usize {
        self.replaces.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }
}

impl KernelProvider for MockKernel {
    async fn links(&self) -> Result<Vec<Link>, Error> {
        Ok(self.links.lock().unwrap().clone())
    }

    async fn addresses(&self, ifindex: u32) -> Result<Vec<LinkAddress>, Error> {
        Ok(self
            .addresses
            .lock()
            .unwrap()
            .get(&ifindex)
            .cloned()
            .unwrap_or_default())
    }

    async fn routes(
        &self,
        table_id: u32,
        af: AddressFamily,
    ) -> Result<Vec<KernelRoute>, Error> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|route| {
                route.table_id == table_id
                    && route.prefix.is_ipv4()
                        == matches!(af, AddressFamily::Ipv4)
            })
            .cloned()
            .collect())
    }

    async fn routes_to(
        &self,
        nexthop: IpAddr,
    ) -> Result<Vec<KernelRoute>, Error> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|route| route.prefix.contains(nexthop))
            .cloned()
            .collect())
    }

    async fn route_replace(&self, route: &KernelRoute) -> Result<(), Error> {
        self.replaces.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|other| {
            !(other.table_id == route.table_id
                && other.prefix == route.prefix)
        });
        routes.push(route.clone());
        Ok(())
    }

    async fn route_delete(&self, route: &KernelRoute) -> Result<(), Error> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.routes.lock().unwrap().retain(|other| {
            !(other.table_id == route.table_id
                && other.prefix == route.prefix)
        });
        Ok(())
    }
}

// ===== impl MockRib =====

impl MockRib {
    pub fn new() -> Arc<MockRib> {
        Arc::new(Default::default())
    }

    pub fn contains(&self, vrf: &str, prefix: IpNetwork) -> bool {
        self.paths
            .lock()
            .unwrap()
            .iter()
            .any(|(name, path)| name == vrf && path.prefix() == prefix)
    }

    pub fn path(&self, vrf: &str, prefix: IpNetwork) -> Option<Path> {
        self.paths
            .lock()
            .unwrap()
            .iter()
            .find(|(name, path)| name == vrf && path.prefix() == prefix)
            .map(|(_, path)| path.clone())
    }

    pub fn set_enumeration(&self, paths: Vec<Path>) {
        *self.enumeration.lock().unwrap() = paths;
    }

    pub fn send_update(&self, path: Path) {
        self.update_tx
            .lock()
            .unwrap()
            .as_ref()
            .expect("no subscriber")
            .send(path)
            .unwrap();
    }
}

impl RibProvider for MockRib {
    async fn add_paths(&self, vrf: &str, paths: Vec<Path>) -> Result<(), Error> {
        if self.fail_submissions.load(Ordering::Relaxed) {
            return Err(Error::RibRequest("injected failure".to_owned()));
        }

        let mut held = self.paths.lock().unwrap();
        for path in paths {
            held.retain(|(name, other)| {
                !(name == vrf && other.prefix() == path.prefix())
            });
            if !path.withdraw {
                held.push((vrf.to_owned(), path));
            }
        }
        Ok(())
    }

    async fn enumerate_paths(&self) -> Result<Vec<Path>, Error> {
        Ok(self.enumeration.lock().unwrap().clone())
    }

    fn subscribe_best_paths(&self) -> UnboundedReceiver<Path> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.update_tx.lock().unwrap() = Some(tx);
        rx
    }
}

// ===== helper functions =====

pub fn path(prefix: IpNetwork, nexthop: IpAddr) -> Path {
    Path::unicast(prefix, nexthop)
}

pub fn path_with_comms(
    prefix: IpNetwork,
    nexthop: IpAddr,
    comms: &[&str],
) -> Path {
    let mut path = Path::unicast(prefix, nexthop);
    path.comms = comms
        .iter()
        .map(|comm| comm.parse::<Comm>().unwrap())
        .collect();
    path
}

pub fn vpn_path(prefix: IpNetwork, rd: &str, nexthop: IpAddr) -> Path {
    Path::vpn(prefix, rd.parse().unwrap(), nexthop)
}

pub fn match_all_rule(name: &str, metric: u32, validate: bool) -> ExportRule {
    ExportRule {
        name: name.to_owned(),
        comms: Default::default(),
        large_comms: Default::default(),
        vrf: String::new(),
        table_id: 0,
        metric,
        validate_nexthop: validate,
    }
}

pub fn comm_rule(name: &str, comm: &str) -> ExportRule {
    ExportRule {
        comms: [comm.parse::<Comm>().unwrap()].into(),
        ..match_all_rule(name, 20, false)
    }
}

pub fn binding(
    vrf: &str,
    table_id: u32,
    metric: u32,
    validate: bool,
    rd: &str,
) -> VrfExportBinding {
    VrfExportBinding {
        vrf: vrf.to_owned(),
        linux_vrf: vrf.to_owned(),
        table_id,
        metric,
        validate_nexthop: validate,
        comms: Default::default(),
        large_comms: Default::default(),
        rd: Some(rd.parse().unwrap()),
    }
}

pub fn export_engine(
    kernel: &Arc<MockKernel>,
    rib: &Arc<MockRib>,
    dampening_ms: u64,
    rules: Vec<ExportRule>,
    bindings: BTreeMap<String, VrfExportBinding>,
) -> Arc<ExportEngine<MockKernel, MockRib>> {
    ExportEngine::new(
        kernel.clone(),
        rib.clone(),
        RouteProtocolId::BGP,
        Duration::from_millis(dampening_ms),
        rules,
        bindings,
    )
    .unwrap()
}
