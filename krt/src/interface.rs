//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

use itertools::Itertools;
use krt_utils::ip::{IpAddrExt, IpNetworkExt};
use krt_utils::southbound::{Link, LinkAddress};
use regex::Regex;
use tracing::warn;

use crate::error::Error;
use crate::netlink::KernelProvider;

// Returns the connected global-unicast prefixes of the given interface.
//
// Each returned entry pairs the masked prefix with the interface's own
// address, which downstream code uses as the candidate nexthop.
pub(crate) async fn connected_prefixes<P>(
    provider: &P,
    ifname: &str,
) -> Result<Vec<LinkAddress>, Error>
where
    P: KernelProvider,
{
    let link = provider.link_by_name(ifname).await?;
    let addresses = provider.addresses(link.ifindex).await?;
    Ok(addresses
        .into_iter()
        .filter(|address| address.addr.is_usable())
        .map(|address| {
            LinkAddress::new(address.prefix.apply_mask(), address.addr)
        })
        .collect())
}

// Expands glob interface selectors (e.g. "eth*") into the literal names of
// the currently present devices. Literal selectors pass through unchanged,
// present or not.
pub(crate) fn expand_selectors(
    links: &[Link],
    selectors: &[String],
) -> Vec<String> {
    selectors
        .iter()
        .flat_map(|selector| {
            if selector.contains(['*', '?']) {
                match glob_regex(selector) {
                    Ok(re) => links
                        .iter()
                        .filter(|link| re.is_match(&link.name))
                        .map(|link| link.name.clone())
                        .collect(),
                    Err(error) => {
                        warn!(%selector, %error, "invalid interface selector");
                        vec![]
                    }
                }
            } else {
                vec![selector.clone()]
            }
        })
        .unique()
        .collect()
}

fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

// ===== unit tests =====
