//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, HashMap, hash_map};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use krt_utils::bgp::{Comm, LargeComm, Path, RouteDistinguisher};
use krt_utils::ip::AddressFamily;
use krt_utils::southbound::{KernelRoute, KernelRouteFlags, RouteProtocolId};
use krt_utils::task::TimeoutTask;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::debug::Debug;
use crate::error::Error;
use crate::netlink::{KernelProvider, RT_TABLE_MAIN};
use crate::rib::RibProvider;

// A single export rule: which paths are installed into which kernel table,
// and how.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Serialize)]
pub struct ExportRule {
    pub name: String,
    pub comms: BTreeSet<Comm>,
    pub large_comms: BTreeSet<LargeComm>,
    // Target kernel VRF device ("" = global kernel table).
    pub vrf: String,
    // 0 = main table.
    pub table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
}

// Export settings of one daemon VRF, keyed off the VRF's Route
// Distinguisher at path-processing time.
#[derive(Clone, Debug)]
#[derive(Serialize)]
pub struct VrfExportBinding {
    // Daemon VRF name.
    pub vrf: String,
    // Kernel VRF device name.
    pub linux_vrf: String,
    // 0 until looked up from the kernel VRF device.
    pub table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
    pub comms: BTreeSet<Comm>,
    pub large_comms: BTreeSet<LargeComm>,
    pub rd: Option<RouteDistinguisher>,
}

// One exported route as tracked by the engine.
#[derive(Clone, Debug)]
struct ExportedRouteRecord {
    route: KernelRoute,
    rule: String,
    installed_at: DateTime<Utc>,
}

// Management view of one exported route.
#[derive(Clone, Debug)]
#[derive(Serialize)]
pub struct ExportedRoute {
    pub prefix: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub vrf: String,
    pub table_id: u32,
    pub metric: u32,
    pub rule: String,
    pub installed_at: DateTime<Utc>,
}

// Export engine counters.
#[derive(Clone, Debug, Default)]
#[derive(Serialize)]
pub struct ExportStats {
    pub exported: u64,
    pub withdrawn: u64,
    pub errors: u64,
    pub nexthop_validations: u64,
    pub nexthop_failures: u64,
    pub dampened: u64,
    pub last_export: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_msg: Option<String>,
}

#[derive(Debug, Default)]
struct ExportState {
    rules: Vec<ExportRule>,
    bindings: BTreeMap<String, VrfExportBinding>,
    rd_map: BTreeMap<RouteDistinguisher, String>,
    // Exported routes keyed by (target VRF, prefix).
    exported: BTreeMap<String, BTreeMap<IpNetwork, ExportedRouteRecord>>,
}

#[derive(Debug)]
struct DampenEntry {
    path: Path,
    timeout: TimeoutTask,
    last_update: Instant,
}

// Installs best paths from the RIB into the kernel routing tables,
// tracking every installed route for idempotent repair and withdrawal.
pub struct ExportEngine<P, R> {
    provider: Arc<P>,
    rib: Arc<R>,
    protocol: RouteProtocolId,
    dampening: Duration,
    state: RwLock<ExportState>,
    // Updates pending dampening, keyed by prefix.
    pending: Mutex<HashMap<IpNetwork, DampenEntry>>,
    stats: RwLock<ExportStats>,
    // Serializes all mutating operations; held across kernel I/O so a
    // reconfiguration never interleaves with subscription updates.
    op_lock: AsyncMutex<()>,
}

// ===== impl ExportRule =====

impl ExportRule {
    // A rule with no community filters matches every path; otherwise any
    // standard or large community shared with the path suffices.
    pub fn matches(&self, path: &Path) -> bool {
        if self.comms.is_empty() && self.large_comms.is_empty() {
            return true;
        }
        !self.comms.is_disjoint(&path.comms)
            || !self.large_comms.is_disjoint(&path.large_comms)
    }

    // Table the rule's routes actually land in.
    fn kernel_table(&self) -> u32 {
        if self.table_id == 0 {
            RT_TABLE_MAIN
        } else {
            self.table_id
        }
    }
}

// ===== impl VrfExportBinding =====

impl VrfExportBinding {
    fn matches(&self, path: &Path) -> bool {
        if self.comms.is_empty() && self.large_comms.is_empty() {
            return true;
        }
        !self.comms.is_disjoint(&path.comms)
            || !self.large_comms.is_disjoint(&path.large_comms)
    }

    // Synthesizes the export rule equivalent of this binding.
    fn to_rule(&self) -> ExportRule {
        ExportRule {
            name: self.vrf.clone(),
            comms: self.comms.clone(),
            large_comms: self.large_comms.clone(),
            vrf: self.linux_vrf.clone(),
            table_id: self.table_id,
            metric: self.metric,
            validate_nexthop: self.validate_nexthop,
        }
    }
}

// ===== impl ExportEngine =====

impl<P, R> ExportEngine<P, R>
where
    P: KernelProvider,
    R: RibProvider,
{
    pub fn new(
        provider: Arc<P>,
        rib: Arc<R>,
        protocol: RouteProtocolId,
        dampening: Duration,
        rules: Vec<ExportRule>,
        bindings: BTreeMap<String, VrfExportBinding>,
    ) -> Result<Arc<ExportEngine<P, R>>, Error> {
        // The engine cannot tell its own routes apart without a
        // distinguishing protocol id.
        if protocol.0 == 0 {
            return Err(Error::RouteProtocolInvalid(0));
        }

        let rd_map = rd_map(&bindings);
        Ok(Arc::new(ExportEngine {
            provider,
            rib,
            protocol,
            dampening,
            state: RwLock::new(ExportState {
                rules,
                bindings,
                rd_map,
                exported: Default::default(),
            }),
            pending: Default::default(),
            stats: Default::default(),
            op_lock: AsyncMutex::new(()),
        }))
    }

    // Purges every kernel route tagged with the engine's protocol id,
    // leftovers of a previous run. Runs strictly before the first
    // subscription dispatch.
    pub async fn cleanup_stale_routes(&self) {
        let mut tables = BTreeSet::from([RT_TABLE_MAIN]);
        match self.provider.links().await {
            Ok(links) => {
                tables.extend(links.iter().filter_map(|link| link.vrf_table));
            }
            Err(error) => self.record_error(&error),
        }

        let mut purged_v4 = 0;
        let mut purged_v6 = 0;
        for table_id in tables {
            for af in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
                let routes = match self.provider.routes(table_id, af).await {
                    Ok(routes) => routes,
                    Err(error) => {
                        self.record_error(&error);
                        continue;
                    }
                };
                for route in routes
                    .into_iter()
                    .filter(|route| route.protocol == self.protocol)
                {
                    if let Err(error) =
                        self.provider.route_delete(&route).await
                    {
                        self.record_error(&error);
                        continue;
                    }
                    match af {
                        AddressFamily::Ipv4 => purged_v4 += 1,
                        AddressFamily::Ipv6 => purged_v6 += 1,
                    }
                }
            }
        }
        info!(%purged_v4, %purged_v6, "startup cleanup finished");
    }

    // Fills in auto-lookup table ids from the kernel VRF devices.
    pub async fn resolve_bindings(&self) {
        let unresolved: Vec<(String, String)> = {
            let state = self.state.read().unwrap();
            state
                .bindings
                .values()
                .filter(|binding| binding.table_id == 0)
                .map(|binding| {
                    (binding.vrf.clone(), binding.linux_vrf.clone())
                })
                .collect()
        };

        for (vrf, linux_vrf) in unresolved {
            match self.vrf_table(&linux_vrf).await {
                Ok(table_id) => {
                    let mut state = self.state.write().unwrap();
                    if let Some(binding) = state.bindings.get_mut(&vrf) {
                        binding.table_id = table_id;
                    }
                }
                Err(error) => {
                    warn!(
                        %vrf, %linux_vrf, %error,
                        "VRF table lookup failed, binding targets the main table"
                    );
                }
            }
        }
    }

    async fn vrf_table(&self, linux_vrf: &str) -> Result<u32, Error> {
        let link = self.provider.link_by_name(linux_vrf).await?;
        link.vrf_table
            .ok_or_else(|| Error::VrfTableNotFound(linux_vrf.to_owned()))
    }

    // Entry point for best-path subscription messages.
    pub async fn process_update(self: &Arc<Self>, path: Path) {
        let prefix = path.prefix();

        if path.withdraw {
            // A withdrawal supersedes any pending install for the prefix,
            // keeping per-prefix ordering intact.
            self.pending.lock().unwrap().remove(&prefix);

            let _guard = self.op_lock.lock().await;
            let vrfs: Vec<String> = {
                let state = self.state.read().unwrap();
                state
                    .exported
                    .iter()
                    .filter(|(_, routes)| routes.contains_key(&prefix))
                    .map(|(vrf, _)| vrf.clone())
                    .collect()
            };
            for vrf in vrfs {
                self.withdraw(prefix, &vrf).await;
            }
            return;
        }

        if self.dampening.is_zero() {
            let _guard = self.op_lock.lock().await;
            self.process_path(&path).await;
            return;
        }
        self.dampen(path);
    }

    // Coalesces rapid updates to one prefix into a single delayed install,
    // always keeping the newest path.
    fn dampen(self: &Arc<Self>, path: Path) {
        let prefix = path.prefix();
        let mut pending = self.pending.lock().unwrap();
        match pending.entry(prefix) {
            hash_map::Entry::Occupied(entry) => {
                let entry = entry.into_mut();
                let elapsed = entry.last_update.elapsed();
                entry.path = path;
                entry.timeout.reset(self.dampening);
                entry.last_update = Instant::now();
                self.stats.write().unwrap().dampened += 1;
                Debug::ExportDampened(&prefix, elapsed).log();
            }
            hash_map::Entry::Vacant(entry) => {
                let engine = Arc::downgrade(self);
                let timeout =
                    TimeoutTask::new(self.dampening, move || async move {
                        if let Some(engine) = Weak::upgrade(&engine) {
                            engine.process_pending(prefix).await;
                        }
                    });
                entry.insert(DampenEntry {
                    path,
                    timeout,
                    last_update: Instant::now(),
                });
            }
        }
    }

    // Dampening timer fired: process the retained path.
    async fn process_pending(self: Arc<Self>, prefix: IpNetwork) {
        let entry = self.pending.lock().unwrap().remove(&prefix);
        if let Some(entry) = entry {
            let _guard = self.op_lock.lock().await;
            self.process_path(&entry.path).await;
        }
    }

    // Installs a path under every rule derived for it. Per-path errors are
    // counted and never unwind into the subscription consumer.
    async fn process_path(&self, path: &Path) {
        for rule in self.derived_rules(path) {
            if let Err(error) = self.install(path, &rule).await {
                self.record_error(&error);
            }
        }
    }

    // Rules under which the path is exported: every matching rule of the
    // global set for unicast paths, the synthesized binding rule for VPN
    // paths. VPN paths never enter the global rule set.
    fn derived_rules(&self, path: &Path) -> Vec<ExportRule> {
        let state = self.state.read().unwrap();
        match path.rd() {
            None => state
                .rules
                .iter()
                .filter(|rule| rule.matches(path))
                .cloned()
                .collect(),
            Some(rd) => {
                let Some(binding) = state
                    .rd_map
                    .get(&rd)
                    .and_then(|vrf| state.bindings.get(vrf))
                else {
                    Debug::ExportUnboundRd(&path.prefix()).log();
                    return vec![];
                };
                if !binding.matches(path) {
                    return vec![];
                }
                vec![binding.to_rule()]
            }
        }
    }

    // Installs one path under one rule, idempotently.
    async fn install(
        &self,
        path: &Path,
        rule: &ExportRule,
    ) -> Result<(), Error> {
        let prefix = path.prefix();
        let nexthop = path.nexthop;
        if nexthop.is_unspecified() {
            return Err(Error::NoNexthop(prefix));
        }

        // Check nexthop reachability.
        if rule.validate_nexthop {
            self.stats.write().unwrap().nexthop_validations += 1;
            let routes = self.provider.routes_to(nexthop).await?;
            let reachable = if rule.table_id > 0 {
                routes.iter().any(|route| route.table_id == rule.table_id)
            } else {
                !routes.is_empty()
            };
            if !reachable {
                self.stats.write().unwrap().nexthop_failures += 1;
                return Err(Error::NexthopUnreachable(prefix, nexthop));
            }
        }

        // Idempotency check against the tracked route.
        let tracked: Option<KernelRoute> = {
            let state = self.state.read().unwrap();
            state
                .exported
                .get(&rule.vrf)
                .and_then(|routes| routes.get(&prefix))
                .map(|record| record.route.clone())
        };
        if let Some(tracked) = tracked {
            if tracked.table_id == rule.kernel_table()
                && tracked.metric == rule.metric
                && tracked.gateway == Some(nexthop)
            {
                // Parameters unchanged. Unless the kernel lost the route
                // out-of-band, there is nothing to do.
                let present = self
                    .provider
                    .routes(tracked.table_id, path.address_family())
                    .await?
                    .into_iter()
                    .any(|route| {
                        route.prefix == prefix
                            && route.protocol == self.protocol
                    });
                if present {
                    Debug::ExportUptodate(&prefix).log();
                    return Ok(());
                }
                Debug::ExportRepair(&prefix).log();
            } else {
                // Parameters changed: the superseded kernel route has a
                // different (table, metric, gateway) key and must go first.
                Debug::ExportParamChange(&rule.name, &prefix).log();
                if let Err(error) = self.provider.route_delete(&tracked).await
                {
                    error.log();
                }
                let mut state = self.state.write().unwrap();
                if let Some(routes) = state.exported.get_mut(&rule.vrf) {
                    routes.remove(&prefix);
                }
            }
        }

        // Build the kernel route.
        let mut route = KernelRoute::new(
            prefix,
            Some(nexthop),
            rule.kernel_table(),
            rule.metric,
            self.protocol,
            None,
            KernelRouteFlags::empty(),
        );
        if !rule.validate_nexthop {
            // Nexthop is accepted even without a covering kernel route.
            route.flags.insert(KernelRouteFlags::ONLINK);
            if !rule.vrf.is_empty() {
                let link = self.provider.link_by_name(&rule.vrf).await?;
                route.ifindex = Some(link.ifindex);
            }
        }

        self.provider.route_replace(&route).await.map_err(|error| {
            match error {
                Error::KernelIo(message)
                | Error::KernelPermission(message) => {
                    Error::KernelInstall(prefix, message)
                }
                error => error,
            }
        })?;

        // Commit the tracking entry.
        Debug::ExportInstall(&rule.name, &prefix, &nexthop).log();
        {
            let mut state = self.state.write().unwrap();
            state.exported.entry(rule.vrf.clone()).or_default().insert(
                prefix,
                ExportedRouteRecord {
                    route,
                    rule: rule.name.clone(),
                    installed_at: Utc::now(),
                },
            );
        }
        let mut stats = self.stats.write().unwrap();
        stats.exported += 1;
        stats.last_export = Some(Utc::now());
        Ok(())
    }

    // Removes the exported route for (prefix, vrf), if any.
    async fn withdraw(&self, prefix: IpNetwork, vrf: &str) {
        let record = {
            let state = self.state.read().unwrap();
            state
                .exported
                .get(vrf)
                .and_then(|routes| routes.get(&prefix))
                .cloned()
        };
        let Some(record) = record else {
            return;
        };

        // The tracking entry goes away even if the kernel refuses the
        // deletion; tracking must not leak.
        if let Err(error) = self.provider.route_delete(&record.route).await {
            self.record_error(&error);
        }

        Debug::ExportWithdraw(vrf, &prefix).log();
        {
            let mut state = self.state.write().unwrap();
            if let Some(routes) = state.exported.get_mut(vrf) {
                routes.remove(&prefix);
                if routes.is_empty() {
                    state.exported.remove(vrf);
                }
            }
        }
        self.stats.write().unwrap().withdrawn += 1;
    }

    // Atomically replaces the rule sets and re-evaluates the whole RIB
    // against them, installing what now matches and withdrawing what no
    // longer does.
    pub async fn reconfigure(
        &self,
        rules: Vec<ExportRule>,
        bindings: BTreeMap<String, VrfExportBinding>,
    ) {
        let _guard = self.op_lock.lock().await;
        Debug::Reconfigure(rules.len(), bindings.len()).log();

        {
            let mut state = self.state.write().unwrap();
            state.rd_map = rd_map(&bindings);
            state.rules = rules;
            state.bindings = bindings;
        }
        self.resolve_bindings().await;

        let paths = match self.rib.enumerate_paths().await {
            Ok(paths) => paths,
            Err(error) => {
                self.record_error(&error);
                return;
            }
        };

        let mut should_export = BTreeSet::new();
        for path in paths.iter().filter(|path| !path.withdraw) {
            for rule in self.derived_rules(path) {
                should_export.insert((rule.vrf.clone(), path.prefix()));
                if let Err(error) = self.install(path, &rule).await {
                    self.record_error(&error);
                }
            }
        }

        // Withdraw everything no longer covered by the new rules.
        let stale: Vec<(String, IpNetwork)> = {
            let state = self.state.read().unwrap();
            state
                .exported
                .iter()
                .flat_map(|(vrf, routes)| {
                    routes.keys().map(|prefix| (vrf.clone(), *prefix))
                })
                .filter(|entry| !should_export.contains(entry))
                .collect()
        };
        for (vrf, prefix) in stale {
            self.withdraw(prefix, &vrf).await;
        }
    }

    // Deletes every tracked route and clears the tracking map. Used for
    // operational teardown.
    pub async fn flush(&self) {
        let _guard = self.op_lock.lock().await;
        let routes: Vec<KernelRoute> = {
            let mut state = self.state.write().unwrap();
            let routes = state
                .exported
                .values()
                .flat_map(|routes| routes.values())
                .map(|record| record.route.clone())
                .collect();
            state.exported.clear();
            routes
        };

        for route in &routes {
            if let Err(error) = self.provider.route_delete(route).await {
                error.log();
            }
        }
        Debug::Flush(routes.len()).log();
    }

    // Exported routes, optionally restricted to one target VRF.
    pub fn list_exported(&self, vrf: Option<&str>) -> Vec<ExportedRoute> {
        let state = self.state.read().unwrap();
        state
            .exported
            .iter()
            .filter(|(name, _)| vrf.is_none_or(|vrf| vrf == name.as_str()))
            .flat_map(|(name, routes)| {
                routes.iter().map(|(prefix, record)| ExportedRoute {
                    prefix: *prefix,
                    gateway: record.route.gateway,
                    vrf: name.clone(),
                    table_id: record.route.table_id,
                    metric: record.route.metric,
                    rule: record.rule.clone(),
                    installed_at: record.installed_at,
                })
            })
            .collect()
    }

    pub fn rules(&self) -> Vec<ExportRule> {
        self.state.read().unwrap().rules.clone()
    }

    pub fn bindings(&self) -> Vec<VrfExportBinding> {
        self.state.read().unwrap().bindings.values().cloned().collect()
    }

    pub fn stats(&self) -> ExportStats {
        self.stats.read().unwrap().clone()
    }

    fn record_error(&self, error: &Error) {
        error.log();
        let mut stats = self.stats.write().unwrap();
        stats.errors += 1;
        stats.last_error_time = Some(Utc::now());
        stats.last_error_msg = Some(error.to_string());
    }
}

// ===== helper functions =====

fn rd_map(
    bindings: &BTreeMap<String, VrfExportBinding>,
) -> BTreeMap<RouteDistinguisher, String> {
    bindings
        .values()
        .filter_map(|binding| binding.rd.map(|rd| (rd, binding.vrf.clone())))
        .collect()
}
