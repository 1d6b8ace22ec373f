//! CIDR arithmetic over host integers.
//!
//! Pools can be as large as a /8, so host enumeration is windowed into
//! 256-address pages and scans stop at the first page with capacity.
//! Every address of the network is a host here, network and broadcast
//! addresses included — small pools (a /31, a bare /32) would otherwise
//! lose usable addresses.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::{Error, Result};

/// Host addresses per enumeration page.
pub const PAGE_SIZE: u32 = 256;

const PAGE_BITS: u32 = 8;

/// Parse a CIDR, accepting a bare address as a /32.
pub fn parse_network(network: &str) -> Result<Ipv4Net> {
    let normalized = if network.contains('/') {
        network.to_owned()
    } else {
        format!("{}/32", network)
    };
    normalized
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid network '{}'", network)))
}

/// Total host count of a network.
pub fn host_count(net: &Ipv4Net) -> u64 {
    1u64 << (32 - net.prefix_len() as u32)
}

/// Number of 256-host pages.
pub fn pages(net: &Ipv4Net) -> u32 {
    let suffix = 32 - net.prefix_len() as u32;
    if suffix > PAGE_BITS {
        1 << (suffix - PAGE_BITS)
    } else {
        1
    }
}

/// Clamp a 1-based page number into range.
pub fn clamp_page(net: &Ipv4Net, page: Option<u32>) -> u32 {
    page.unwrap_or(1).clamp(1, pages(net))
}

/// The host integers of one 1-based page.
pub fn page_hosts(net: &Ipv4Net, page: u32) -> Vec<u32> {
    let page = clamp_page(net, Some(page));
    let base = u32::from(net.network());
    let total = host_count(net);
    let start = (page - 1) as u64 * PAGE_SIZE as u64;
    let end = (start + PAGE_SIZE as u64).min(total);
    (start..end).map(|offset| base + offset as u32).collect()
}

/// Free hosts of one page, given the taken (allocated ∪ blocked) set.
pub fn free_hosts_in_page(net: &Ipv4Net, page: u32, taken: &BTreeSet<u32>) -> Vec<u32> {
    page_hosts(net, page)
        .into_iter()
        .filter(|host| !taken.contains(host))
        .collect()
}

/// The first free host, walking pages until one has capacity.
pub fn first_free_host(net: &Ipv4Net, taken: &BTreeSet<u32>) -> Option<u32> {
    for page in 1..=pages(net) {
        if let Some(host) = free_hosts_in_page(net, page, taken).first() {
            return Some(*host);
        }
    }
    None
}

/// Whether the network still has any free host.
pub fn has_free_host(net: &Ipv4Net, taken: &BTreeSet<u32>) -> bool {
    first_free_host(net, taken).is_some()
}

/// Whether an address belongs to the network (network/broadcast included).
pub fn contains(net: &Ipv4Net, ip: u32) -> bool {
    let base = u32::from(net.network());
    (ip as u64) >= base as u64 && (ip as u64) < base as u64 + host_count(net)
}

/// Render a host integer in dotted form.
pub fn int_to_ip(ip: u32) -> String {
    Ipv4Addr::from(ip).to_string()
}

/// Parse a dotted address into a host integer.
pub fn ip_to_int(ip: &str) -> Result<u32> {
    ip.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| Error::Validation(format!("Invalid IP address '{}'", ip)))
}

/// Parse an autoblock expression: single IPs and `a-b` ranges, mixed and
/// comma-separated, whitespace ignored. The result is a set union, so the
/// expression is order-independent.
pub fn parse_autoblock(expression: &str) -> Result<BTreeSet<u32>> {
    let mut blocked = BTreeSet::new();
    let cleaned: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Ok(blocked);
    }
    for item in cleaned.split(',') {
        if let Ok(single) = ip_to_int(item) {
            blocked.insert(single);
            continue;
        }
        let range: Vec<&str> = item.split('-').collect();
        let parsed = match range.as_slice() {
            [first, last] => ip_to_int(first).and_then(|f| ip_to_int(last).map(|l| (f, l))),
            _ => Err(Error::Validation(String::new())),
        };
        match parsed {
            Ok((first, last)) if first <= last => {
                blocked.extend(first..=last);
            }
            _ => {
                return Err(Error::Validation(
                    "Exclude IP's are expected to be in the form of 10.0.0.1,10.0.0.4 \
                     or 10.1.0.10-10.1.1.54 or both comma-separated"
                        .to_owned(),
                ))
            }
        }
    }
    Ok(blocked)
}

/// Collapse a sorted list of host integers into inclusive `(start, end)`
/// runs, for the admin allocation report.
pub fn ip_list_by_blocks(ips: &BTreeSet<u32>) -> Vec<(u32, u32)> {
    let mut blocks = Vec::new();
    let mut iter = ips.iter().copied();
    let mut current = match iter.next() {
        Some(first) => (first, first),
        None => return blocks,
    };
    for ip in iter {
        if ip == current.1 + 1 {
            current.1 = ip;
        } else {
            blocks.push(current);
            current = (ip, ip);
        }
    }
    blocks.push(current);
    blocks
}

/// The runs of `start..=end` not covered by `blocks` (which must be sorted
/// and disjoint).
pub fn missing_intervals(blocks: &[(u32, u32)], start: u32, end: u32) -> Vec<(u32, u32)> {
    let mut missing = Vec::new();
    let mut next = start as u64;
    for &(block_start, block_end) in blocks {
        if (block_start as u64) > next {
            missing.push((next as u32, block_start - 1));
        }
        next = block_end as u64 + 1;
    }
    if (end as u64) >= next {
        missing.push((next as u32, end));
    }
    missing
}

#[cfg(test)]
mod test {
    use super::*;

    fn net(cidr: &str) -> Ipv4Net {
        parse_network(cidr).expect("valid network")
    }

    #[test]
    fn small_networks_have_one_page() {
        assert_eq!(pages(&net("192.168.1.0/24")), 1);
        assert_eq!(pages(&net("192.168.1.17/32")), 1);
        assert_eq!(host_count(&net("192.168.1.0/24")), 256);
        assert_eq!(host_count(&net("192.168.1.17/32")), 1);
    }

    #[test]
    fn large_networks_paginate_by_256() {
        let large = net("10.0.0.0/16");
        assert_eq!(pages(&large), 256);
        let first_page = page_hosts(&large, 1);
        assert_eq!(first_page.len(), 256);
        assert_eq!(first_page[0], u32::from("10.0.0.0".parse::<Ipv4Addr>().unwrap()));
        let second_page = page_hosts(&large, 2);
        assert_eq!(second_page[0], u32::from("10.0.1.0".parse::<Ipv4Addr>().unwrap()));
    }

    #[test]
    fn network_and_broadcast_count_as_hosts() {
        let hosts = page_hosts(&net("192.168.1.0/30"), 1);
        assert_eq!(hosts.len(), 4);
    }

    #[test]
    fn first_free_host_skips_full_pages() {
        let network = net("10.0.0.0/23");
        // Fill the whole first page.
        let taken: BTreeSet<u32> = page_hosts(&network, 1).into_iter().collect();
        let free = first_free_host(&network, &taken).expect("second page has room");
        assert_eq!(int_to_ip(free), "10.0.1.0");
    }

    #[test]
    fn exhausted_network_has_no_free_host() {
        let network = net("192.168.1.0/30");
        let taken: BTreeSet<u32> = page_hosts(&network, 1).into_iter().collect();
        assert_eq!(first_free_host(&network, &taken), None);
        assert!(!has_free_host(&network, &taken));
    }

    #[test]
    fn autoblock_mixes_singles_and_ranges() {
        let blocked = parse_autoblock("10.0.0.1, 10.0.0.30-10.0.0.32 ,10.0.0.4").expect("parse");
        let as_ips: Vec<String> = blocked.iter().map(|ip| int_to_ip(*ip)).collect();
        assert_eq!(
            as_ips,
            vec!["10.0.0.1", "10.0.0.4", "10.0.0.30", "10.0.0.31", "10.0.0.32"]
        );
    }

    #[test]
    fn autoblock_is_order_independent() {
        let a = parse_autoblock("10.0.0.1,10.0.0.5-10.0.0.7").expect("parse");
        let b = parse_autoblock("10.0.0.5-10.0.0.7,10.0.0.1").expect("parse");
        assert_eq!(a, b);
    }

    #[test]
    fn autoblock_rejects_garbage() {
        assert!(parse_autoblock("not-an-ip").is_err());
        assert!(parse_autoblock("10.0.0.5-10.0.0.1").is_err());
        assert!(parse_autoblock("10.0.0.1-10.0.0.2-10.0.0.3").is_err());
    }

    #[test]
    fn empty_autoblock_is_empty() {
        assert!(parse_autoblock("").expect("parse").is_empty());
        assert!(parse_autoblock("  ").expect("parse").is_empty());
    }

    #[test]
    fn interval_report_round_trip() {
        let ips: BTreeSet<u32> = [1, 2, 3, 7, 9, 10].into_iter().collect();
        let blocks = ip_list_by_blocks(&ips);
        assert_eq!(blocks, vec![(1, 3), (7, 7), (9, 10)]);
        let missing = missing_intervals(&blocks, 0, 12);
        assert_eq!(missing, vec![(0, 0), (4, 6), (8, 8), (11, 12)]);
    }

    #[test]
    fn containment_includes_edges() {
        let network = net("192.168.1.0/24");
        assert!(contains(&network, ip_to_int("192.168.1.0").unwrap()));
        assert!(contains(&network, ip_to_int("192.168.1.255").unwrap()));
        assert!(!contains(&network, ip_to_int("192.168.2.0").unwrap()));
    }
}
