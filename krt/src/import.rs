//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use derive_new::new;
use ipnetwork::IpNetwork;
use krt_utils::bgp::Path;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::debug::Debug;
use crate::error::Error;
use crate::interface;
use crate::netlink::KernelProvider;
use crate::rib::RibProvider;

// A single import rule: the set of interfaces whose connected prefixes are
// advertised into the given table ("" = global).
//
// Interface names are literal; glob selectors are expanded at the
// configuration boundary.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Serialize)]
pub struct ImportRule {
    pub vrf: String,
    pub interfaces: Vec<String>,
}

// Import engine counters.
#[derive(Clone, Debug, Default)]
#[derive(Serialize)]
pub struct ImportStats {
    pub imported: u64,
    pub withdrawn: u64,
    pub errors: u64,
    pub last_import: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_msg: Option<String>,
}

#[derive(Debug)]
struct ImportState {
    rules: Vec<ImportRule>,
    // Paths currently advertised into the RIB, per table.
    advertised: BTreeMap<String, BTreeMap<IpNetwork, Path>>,
}

// Reconciles host interface configuration into the RIB as connected-route
// paths, on a fixed cadence.
#[derive(Debug)]
pub struct ImportEngine<P, R> {
    provider: Arc<P>,
    rib: Arc<R>,
    state: Mutex<ImportState>,
    stats: RwLock<ImportStats>,
    // Serializes whole scan cycles.
    scan_lock: AsyncMutex<()>,
}

// ===== impl ImportEngine =====

impl<P, R> ImportEngine<P, R>
where
    P: KernelProvider,
    R: RibProvider,
{
    pub fn new(
        provider: Arc<P>,
        rib: Arc<R>,
        rules: Vec<ImportRule>,
    ) -> ImportEngine<P, R> {
        ImportEngine {
            provider,
            rib,
            state: Mutex::new(ImportState {
                rules,
                advertised: Default::default(),
            }),
            stats: Default::default(),
            scan_lock: AsyncMutex::new(()),
        }
    }

    // Reconciles all rules against the current interface configuration.
    //
    // Runs on every scan tick, and immediately after VRF lifecycle events
    // and rule replacements.
    pub async fn rescan(&self) {
        let _guard = self.scan_lock.lock().await;
        let rules = self.state.lock().unwrap().rules.clone();
        for rule in &rules {
            self.scan_rule(rule).await;
        }

        // Withdraw everything advertised under a scope no rule covers
        // anymore.
        let stale: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .advertised
                .keys()
                .filter(|vrf| !rules.iter().any(|rule| &rule.vrf == *vrf))
                .cloned()
                .collect()
        };
        for vrf in stale {
            self.scan_rule(&ImportRule::new(vrf, Vec::new())).await;
        }
    }

    async fn scan_rule(&self, rule: &ImportRule) {
        Debug::ImportScan(&rule.vrf).log();

        // Gather the connected prefixes over the rule's interfaces. A
        // failing interface is skipped, the rest of the scan proceeds.
        let mut current = BTreeMap::new();
        for ifname in &rule.interfaces {
            match interface::connected_prefixes(&*self.provider, ifname).await
            {
                Ok(addresses) => {
                    for address in addresses {
                        let path = Path::connected(
                            address.prefix,
                            ifname.as_str(),
                            address.addr,
                        );
                        current.insert(address.prefix, path);
                    }
                }
                Err(error) => {
                    warn!(%ifname, %error, "interface scan failed");
                }
            }
        }

        // Compute the delta against what is already advertised.
        let (adds, withdraws) = {
            let state = self.state.lock().unwrap();
            let advertised = state.advertised.get(&rule.vrf);
            let adds = current
                .iter()
                .filter(|(prefix, _)| {
                    advertised.is_none_or(|advertised| {
                        !advertised.contains_key(*prefix)
                    })
                })
                .map(|(_, path)| path.clone())
                .collect::<Vec<_>>();
            let withdraws = advertised
                .into_iter()
                .flatten()
                .filter(|(prefix, _)| !current.contains_key(*prefix))
                .map(|(_, path)| path.to_withdraw())
                .collect::<Vec<_>>();
            (adds, withdraws)
        };
        if adds.is_empty() && withdraws.is_empty() {
            return;
        }

        for path in &adds {
            Debug::ImportAdd(&rule.vrf, &path.prefix()).log();
        }
        for path in &withdraws {
            Debug::ImportWithdraw(&rule.vrf, &path.prefix()).log();
        }

        // Submit additions first, withdrawals after. On failure the
        // advertised set is left untouched so the next tick retries.
        let num_adds = adds.len() as u64;
        let num_withdraws = withdraws.len() as u64;
        if !adds.is_empty()
            && let Err(error) = self.rib.add_paths(&rule.vrf, adds).await
        {
            self.record_error(&error);
            return;
        }
        if !withdraws.is_empty()
            && let Err(error) = self.rib.add_paths(&rule.vrf, withdraws).await
        {
            self.record_error(&error);
            return;
        }

        // Commit the new advertised set.
        {
            let mut state = self.state.lock().unwrap();
            if current.is_empty() {
                state.advertised.remove(&rule.vrf);
            } else {
                state.advertised.insert(rule.vrf.clone(), current);
            }
        }

        let mut stats = self.stats.write().unwrap();
        stats.imported += num_adds;
        stats.withdrawn += num_withdraws;
        stats.last_import = Some(Utc::now());
    }

    // Replaces the rule set. The caller follows up with a rescan.
    pub fn replace_rules(&self, rules: Vec<ImportRule>) {
        self.state.lock().unwrap().rules = rules;
    }

    pub fn rules(&self) -> Vec<ImportRule> {
        self.state.lock().unwrap().rules.clone()
    }

    // Currently advertised prefixes, per table.
    pub fn advertised(&self) -> BTreeMap<String, Vec<IpNetwork>> {
        let state = self.state.lock().unwrap();
        state
            .advertised
            .iter()
            .map(|(vrf, paths)| (vrf.clone(), paths.keys().copied().collect()))
            .collect()
    }

    pub fn stats(&self) -> ImportStats {
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
