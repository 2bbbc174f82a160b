//! Scrapers for the textual output of host tools
//!
//! Each function takes the literal output of one known command (`ip addr
//! show`, `iwpan dev`, `ip netns list`, `ping6`, `lsmod`) and extracts a single fact from it,
//! so they can be tested against captured strings without touching the host.

use once_cell::sync::Lazy;
use regex::Regex;

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.\d+\.\d+\.\d+)/(\d+)").expect("static regex"));

static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}").expect("static regex")
});

static PHY_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^phy#(\d+)").expect("static regex"));

static PING_SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+)( packets)? received").expect("static regex")
});

/// First dotted-quad address in `ip addr show` output, with its prefix length.
pub fn first_ipv4(text: &str) -> Option<(String, u8)> {
    IPV4_RE.captures_iter(text).find_map(|caps| {
        let len = caps[2].parse::<u8>().ok().filter(|l| *l <= 32)?;
        Some((caps[1].to_string(), len))
    })
}

/// First colon-separated six-octet hardware address.
pub fn first_mac(text: &str) -> Option<String> {
    MAC_RE.find(text).map(|m| m.as_str().to_string())
}

/// Interface names from an `iwpan dev` listing, in listing order.
pub fn wpan_interfaces(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|line| line.contains("Interface"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// PHY number owning `device` in an `iwpan dev` listing.
///
/// The listing groups interfaces under `phy#N` headers; the header in
/// force when the `Interface <device>` line appears is the answer.
pub fn phy_of(listing: &str, device: &str) -> Option<u32> {
    let mut current = None;
    for line in listing.lines() {
        let trimmed = line.trim();
        if let Some(caps) = PHY_HEADER_RE.captures(trimmed) {
            current = caps[1].parse().ok();
            continue;
        }
        let mut words = trimmed.split_whitespace();
        if words.next() == Some("Interface") && words.next() == Some(device) {
            return current;
        }
    }
    None
}

/// `(transmitted, received)` from a ping summary line.
pub fn ping_counts(output: &str) -> Option<(u32, u32)> {
    let caps = PING_SUMMARY_RE.captures(output)?;
    let sent = caps[1].parse().ok()?;
    let received = caps[2].parse().ok()?;
    Some((sent, received))
}

/// Namespace names from `ip netns list`, whose lines read `name (id: N)`.
pub fn netns_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Whether `lsmod` output lists `module`.
pub fn module_listed(lsmod: &str, module: &str) -> bool {
    lsmod
        .lines()
        .skip(1)
        .any(|line| line.split_whitespace().next() == Some(module))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ADDR_SHOW: &str = "\
5: sta1-lowpan@sta1-wpan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1280 qdisc noqueue state UNKNOWN group default qlen 1000
    link/6lowpan 0a:5e:be:1a:7f:1c:00:01 brd ff:ff:ff:ff:ff:ff:ff:ff
    inet 10.0.0.7/8 scope global sta1-lowpan
       valid_lft forever preferred_lft forever
    inet6 2001::1/64 scope global
       valid_lft forever preferred_lft forever
";

    const IWPAN_DEV: &str = "\
phy#1
\tInterface wpan1
\t\tifindex 4
\t\twpan_dev 0x100000001
phy#0
\tInterface wpan0
\t\tifindex 3
\t\twpan_dev 0x1
phy#12
\tInterface wpan12
\t\tifindex 15
";

    #[test]
    fn test_address_scraping() {
        assert_eq!(first_ipv4(IP_ADDR_SHOW), Some(("10.0.0.7".to_string(), 8)));
        assert_eq!(first_mac(IP_ADDR_SHOW).as_deref(), Some("0a:5e:be:1a:7f:1c"));
        assert_eq!(first_ipv4("inet6 fe80::1/64"), None);
        // A bare address carries no prefix and is not taken
        assert_eq!(first_ipv4("gateway 10.0.0.1"), None);
        assert_eq!(
            first_ipv4("brd 10.255.255.255 inet 192.168.1.4/24"),
            Some(("192.168.1.4".to_string(), 24))
        );
        assert_eq!(first_mac("no hardware address here"), None);
    }

    #[test]
    fn test_netns_listing() {
        assert_eq!(
            netns_names("sta2 (id: 1)\nsta1 (id: 0)\nblue\n"),
            vec!["sta2", "sta1", "blue"]
        );
        assert!(netns_names("").is_empty());
    }

    #[test]
    fn test_wpan_interface_listing() {
        assert_eq!(wpan_interfaces(IWPAN_DEV), vec!["wpan1", "wpan0", "wpan12"]);
        assert!(wpan_interfaces("").is_empty());
    }

    #[test]
    fn test_phy_resolution() {
        assert_eq!(phy_of(IWPAN_DEV, "wpan0"), Some(0));
        assert_eq!(phy_of(IWPAN_DEV, "wpan1"), Some(1));
        // Multi-digit PHY numbers are not truncated
        assert_eq!(phy_of(IWPAN_DEV, "wpan12"), Some(12));
        // Prefix of another device name must not match
        assert_eq!(phy_of(IWPAN_DEV, "wpan"), None);
    }

    #[test]
    fn test_ping_summary() {
        let out = "PING ff02::1%sta1-lowpan(ff02::1%sta1-lowpan) 56 data bytes\n\
                   64 bytes from fe80::1%sta1-lowpan: icmp_seq=1 ttl=64 time=0.05 ms\n\n\
                   --- ff02::1%sta1-lowpan ping statistics ---\n\
                   1 packets transmitted, 1 received, 0% packet loss, time 0ms\n";
        assert_eq!(ping_counts(out), Some((1, 1)));
        assert_eq!(
            ping_counts("1 packets transmitted, 0 packets received, 100% packet loss"),
            Some((1, 0))
        );
        assert_eq!(ping_counts("connect: Network is unreachable"), None);
    }

    #[test]
    fn test_lsmod_listing() {
        let lsmod = "Module                  Size  Used by\n\
                     fakelb                 16384  0\n\
                     ieee802154_6lowpan     20480  0\n\
                     ifb                    16384  0\n";
        assert!(module_listed(lsmod, "ifb"));
        assert!(module_listed(lsmod, "fakelb"));
        assert!(!module_listed(lsmod, "Module"));
        assert!(!module_listed(lsmod, "mac802154"));
    }
}
