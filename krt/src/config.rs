//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use krt_utils::bgp::{Comm, LargeComm, RouteDistinguisher};
use krt_utils::southbound::Link;
use serde::Deserialize;

use crate::error::Error;
use crate::export::{ExportRule, VrfExportBinding};
use crate::import::ImportRule;
use crate::interface;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub import: ImportConfig,
    pub export: ExportConfig,
    pub vrfs: Vec<VrfConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ImportConfig {
    pub enabled: bool,
    // Table the scanned prefixes are advertised into ("" = global).
    pub vrf: String,
    pub interface_list: Vec<String>,
    // Scan cadence, in seconds.
    pub scan_interval: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ExportConfig {
    pub enabled: bool,
    // Kernel route-protocol field value for installed routes.
    pub route_protocol: u8,
    // Milliseconds; 0 disables dampening.
    pub dampening_interval: u64,
    pub rules: Vec<ExportRuleConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct ExportRuleConfig {
    pub name: String,
    pub community_list: Vec<String>,
    pub large_community_list: Vec<String>,
    // Target kernel VRF device ("" = global kernel table).
    pub vrf: String,
    // 0 = main table.
    pub table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct VrfConfig {
    pub name: String,
    pub rd: String,
    #[serde(default)]
    pub netlink_import: VrfImportConfig,
    #[serde(default)]
    pub netlink_export: VrfExportConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct VrfImportConfig {
    pub enabled: bool,
    pub interface_list: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct VrfExportConfig {
    pub enabled: bool,
    // Kernel VRF device name; defaults to the VRF name itself.
    pub linux_vrf: String,
    // 0 = look the table up from the kernel VRF device at activation.
    pub linux_table_id: u32,
    pub metric: u32,
    pub validate_nexthop: bool,
    pub community_list: Vec<String>,
    pub large_community_list: Vec<String>,
}

// ===== impl ImportConfig =====

impl Default for ImportConfig {
    fn default() -> ImportConfig {
        ImportConfig {
            enabled: false,
            vrf: String::new(),
            interface_list: Vec::new(),
            scan_interval: 5,
        }
    }
}

// ===== impl ExportConfig =====

impl Default for ExportConfig {
    fn default() -> ExportConfig {
        ExportConfig {
            enabled: false,
            route_protocol: 186,
            dampening_interval: 100,
            rules: Vec::new(),
        }
    }
}

// ===== impl ExportRuleConfig =====

impl Default for ExportRuleConfig {
    fn default() -> ExportRuleConfig {
        ExportRuleConfig {
            name: String::new(),
            community_list: Vec::new(),
            large_community_list: Vec::new(),
            vrf: String::new(),
            table_id: 0,
            metric: 20,
            validate_nexthop: true,
        }
    }
}

// ===== impl VrfExportConfig =====

impl Default for VrfExportConfig {
    fn default() -> VrfExportConfig {
        VrfExportConfig {
            enabled: false,
            linux_vrf: String::new(),
            linux_table_id: 0,
            metric: 20,
            validate_nexthop: true,
            community_list: Vec::new(),
            large_community_list: Vec::new(),
        }
    }
}

// ===== global functions =====

// Builds the import rule set, expanding glob interface selectors against
// the devices currently present in the kernel.
pub fn import_rules(config: &Config, links: &[Link]) -> Vec<ImportRule> {
    let mut rules = Vec::new();
    if config.import.enabled {
        rules.push(ImportRule::new(
            config.import.vrf.clone(),
            interface::expand_selectors(links, &config.import.interface_list),
        ));
    }
    for vrf in &config.vrfs {
        if vrf.netlink_import.enabled {
            rules.push(ImportRule::new(
                vrf.name.clone(),
                interface::expand_selectors(
                    links,
                    &vrf.netlink_import.interface_list,
                ),
            ));
        }
    }
    rules
}

// Builds the export rule set. Unparsable communities are skipped with a
// warning; the rule itself is kept.
pub fn export_rules(config: &Config) -> Vec<ExportRule> {
    config
        .export
        .rules
        .iter()
        .map(|rule| ExportRule {
            name: rule.name.clone(),
            comms: parse_communities(&rule.community_list),
            large_comms: parse_large_communities(&rule.large_community_list),
            vrf: rule.vrf.clone(),
            table_id: rule.table_id,
            metric: rule.metric,
            validate_nexthop: rule.validate_nexthop,
        })
        .collect()
}

// Builds the per-VRF export bindings, keyed by the daemon VRF name.
pub fn vrf_bindings(config: &Config) -> BTreeMap<String, VrfExportBinding> {
    let mut bindings = BTreeMap::new();
    for vrf in &config.vrfs {
        if !vrf.netlink_export.enabled {
            continue;
        }

        let rd = match vrf.rd.parse::<RouteDistinguisher>() {
            Ok(rd) => Some(rd),
            Err(_) => {
                Error::RouteDistinguisherInvalid(vrf.rd.clone()).log();
                None
            }
        };
        let linux_vrf = if vrf.netlink_export.linux_vrf.is_empty() {
            vrf.name.clone()
        } else {
            vrf.netlink_export.linux_vrf.clone()
        };

        bindings.insert(
            vrf.name.clone(),
            VrfExportBinding {
                vrf: vrf.name.clone(),
                linux_vrf,
                table_id: vrf.netlink_export.linux_table_id,
                metric: vrf.netlink_export.metric,
                validate_nexthop: vrf.netlink_export.validate_nexthop,
                comms: parse_communities(&vrf.netlink_export.community_list),
                large_comms: parse_large_communities(
                    &vrf.netlink_export.large_community_list,
                ),
                rd,
            },
        );
    }
    bindings
}

fn parse_communities(list: &[String]) -> BTreeSet<Comm> {
    let mut comms = BTreeSet::new();
    for community in list {
        match community.parse::<Comm>() {
            Ok(comm) => {
                comms.insert(comm);
            }
            Err(_) => Error::CommunityInvalid(community.clone()).log(),
        }
    }
    comms
}

fn parse_large_communities(list: &[String]) -> BTreeSet<LargeComm> {
    let mut comms = BTreeSet::new();
    for community in list {
        match community.parse::<LargeComm>() {
            Ok(comm) => {
                comms.insert(comm);
            }
            Err(_) => Error::LargeCommunityInvalid(community.clone()).log(),
        }
    }
    comms
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(!config.import.enabled);
        assert_eq!(config.import.scan_interval, 5);
        assert!(!config.export.enabled);
        assert_eq!(config.export.route_protocol, 186);
        assert_eq!(config.export.dampening_interval, 100);
    }

    #[test]
    fn export_rule_parsing() {
        let config: Config = serde_json::from_str(
            r#"{
                "export": {
                    "enabled": true,
                    "rules": [
                        {
                            "name": "edge",
                            "community-list": ["65000:100", "bogus", "200"],
                            "large-community-list": ["65000:1:2"],
                            "table-id": 100
                        }
                    ]
                }
            }"#,
        )
        .unwrap();

        let rules = export_rules(&config);
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.name, "edge");
        // The invalid community is skipped, the rest are kept.
        assert_eq!(rule.comms.len(), 2);
        assert_eq!(rule.large_comms.len(), 1);
        assert_eq!(rule.table_id, 100);
        assert_eq!(rule.metric, 20);
        assert!(rule.validate_nexthop);
    }

    #[test]
    fn vrf_binding_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "vrfs": [
                    {
                        "name": "blue",
                        "rd": "65000:1",
                        "netlink-export": {"enabled": true}
                    },
                    {
                        "name": "red",
                        "rd": "junk",
                        "netlink-export": {
                            "enabled": true,
                            "linux-vrf": "vrf-red",
                            "linux-table-id": 100
                        }
                    }
                ]
            }"#,
        )
        .unwrap();

        let bindings = vrf_bindings(&config);
        assert_eq!(bindings.len(), 2);

        let blue = &bindings["blue"];
        assert_eq!(blue.linux_vrf, "blue");
        assert_eq!(blue.table_id, 0);
        assert_eq!(
            blue.rd,
            Some(RouteDistinguisher::As2 { asn: 65000, value: 1 })
        );

        let red = &bindings["red"];
        assert_eq!(red.linux_vrf, "vrf-red");
        assert_eq!(red.table_id, 100);
        assert_eq!(red.rd, None);
    }
}
