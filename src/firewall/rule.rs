//! Address rules: a predicate on a host/address paired with partial options.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::options::PartialOptions;
use crate::{CoreError, Result};

/// Rule token matching every non-public address.
pub const PRIVATE_TOKEN: &str = "$private";

/// Extra addresses treated as private (cloud provider metadata endpoints).
const ADDITIONAL_PRIVATE: [Ipv4Addr; 1] = [Ipv4Addr::new(192, 0, 0, 192)];

/// What an [`AddressRule`] matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AddressPredicate {
    /// A hostname glob, lowercased. `*` matches any run of characters.
    Domain(String),
    /// An inclusive range of addresses, from a CIDR block or a single IP.
    HostRange { min: Vec<u8>, max: Vec<u8> },
    /// Loopback, link-local, site-local and similar ranges.
    Private,
}

impl AddressPredicate {
    fn parse(filter: &str) -> Result<Self> {
        let invalid = |reason: String| CoreError::InvalidRule {
            rule: filter.to_string(),
            reason,
        };

        if filter.is_empty() {
            return Err(invalid("host must not be empty".to_string()));
        }

        if filter.eq_ignore_ascii_case(PRIVATE_TOKEN) {
            return Ok(Self::Private);
        }

        if let Some((address, prefix)) = filter.split_once('/') {
            let prefix: u32 = prefix.parse().map_err(|_| {
                invalid(format!("cannot extract size of CIDR mask from '{prefix}'"))
            })?;
            let address: IpAddr = address
                .parse()
                .map_err(|_| invalid(format!("cannot extract IP address from '{address}'")))?;
            return Self::host_range(address, prefix).map_err(invalid);
        }

        if let Ok(address) = filter.parse::<IpAddr>() {
            let bits = if address.is_ipv4() { 32 } else { 128 };
            return Self::host_range(address, bits).map_err(invalid);
        }

        Ok(Self::Domain(filter.to_ascii_lowercase()))
    }

    fn host_range(address: IpAddr, prefix: u32) -> std::result::Result<Self, String> {
        let bytes = ip_bytes(&address);
        let bits = bytes.len() as u32 * 8;
        if prefix > bits {
            return Err(format!("prefix /{prefix} is larger than {bits} bits"));
        }

        let mut min = bytes.clone();
        let mut max = bytes;
        let mut size = prefix as i32;
        for i in 0..min.len() {
            if size <= 0 {
                min[i] = 0;
                max[i] = 0xFF;
            } else if size < 8 {
                let mask = 0xFFu8 << (8 - size);
                min[i] &= mask;
                max[i] |= !mask;
            }
            size -= 8;
        }

        Ok(Self::HostRange { min, max })
    }

    fn matches_domain(&self, domain: &str) -> bool {
        match self {
            Self::Domain(pattern) => glob_matches(pattern, &domain.to_ascii_lowercase()),
            _ => false,
        }
    }

    fn matches_address(&self, address: &IpAddr) -> bool {
        match self {
            Self::Domain(pattern) => glob_matches(pattern, &address.to_string()),
            Self::HostRange { min, max } => {
                let entry = ip_bytes(address);
                entry.len() == min.len()
                    && entry
                        .iter()
                        .zip(min.iter().zip(max.iter()))
                        .all(|(value, (lo, hi))| value >= lo && value <= hi)
            }
            Self::Private => is_private(address),
        }
    }
}

/// An ordered firewall entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRule {
    host: String,
    predicate: AddressPredicate,
    port: Option<u16>,
    options: PartialOptions,
}

impl AddressRule {
    /// Parse a rule from its host filter.
    ///
    /// The filter is `$private`, an IP address, a CIDR block such as
    /// `10.0.0.0/8`, or a hostname glob such as `*.example.com`.
    pub fn parse(host: &str, port: Option<u16>, options: PartialOptions) -> Result<Self> {
        let host = host.trim();
        Ok(Self {
            host: host.to_string(),
            predicate: AddressPredicate::parse(host)?,
            port,
            options,
        })
    }

    /// The host filter as written in the configuration.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port this rule is limited to, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The options this rule contributes when it matches.
    pub fn options(&self) -> &PartialOptions {
        &self.options
    }

    /// Whether this rule applies to a connection to `domain` resolved to `address:port`.
    pub fn matches(&self, domain: &str, address: &IpAddr, port: u16) -> bool {
        if self.port.is_some_and(|p| p != port) {
            return false;
        }

        if self.predicate.matches_domain(domain) || self.predicate.matches_address(address) {
            return true;
        }

        // IPv4 addresses hiding inside IPv6 ones.
        embedded_ipv4(address)
            .is_some_and(|v4| self.predicate.matches_address(&IpAddr::V4(v4)))
    }
}

fn ip_bytes(address: &IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Extract the IPv4 address from 6to4 (`2002::/16`) and IPv4-mapped addresses.
fn embedded_ipv4(address: &IpAddr) -> Option<Ipv4Addr> {
    let IpAddr::V6(v6) = address else {
        return None;
    };

    if let Some(mapped) = v6.to_ipv4_mapped() {
        return Some(mapped);
    }

    let segments = v6.segments();
    (segments[0] == 0x2002).then(|| {
        Ipv4Addr::new(
            (segments[1] >> 8) as u8,
            segments[1] as u8,
            (segments[2] >> 8) as u8,
            segments[2] as u8,
        )
    })
}

/// Check whether an address lies in a non-public range.
pub fn is_private(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            is_private_v6(v6) || embedded_ipv4(address).is_some_and(|v4| is_private_v4(&v4))
        }
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_private()
        || ip.is_multicast()
        || ip.is_broadcast()
        // Carrier-grade NAT: 100.64.0.0/10
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
        || ADDITIONAL_PRIVATE.contains(ip)
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // Link-local: fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // Site-local (deprecated): fec0::/10
        || (segments[0] & 0xffc0) == 0xfec0
        // Unique local: fd00::/8
        || (segments[0] & 0xff00) == 0xfd00
}

/// Match `text` against a glob where `*` matches any (possibly empty) run.
fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: &str) -> AddressRule {
        AddressRule::parse(host, None, PartialOptions::default()).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("*", ""));
        assert!(glob_matches("*", "example.com"));
        assert!(glob_matches("*.example.com", "api.example.com"));
        assert!(!glob_matches("*.example.com", "example.com"));
        assert!(glob_matches("example.*", "example.org"));
        assert!(glob_matches("a*b*c", "aXXbYYc"));
        assert!(!glob_matches("a*b*c", "aXXbYY"));
        assert!(glob_matches("example.com", "example.com"));
        assert!(!glob_matches("example.com", "example.co"));
    }

    #[test]
    fn test_domain_rule_case_insensitive() {
        let rule = rule("*.Example.COM");
        assert!(rule.matches("API.example.com", &ip("93.184.216.34"), 80));
        assert!(!rule.matches("example.org", &ip("93.184.216.34"), 80));
    }

    #[test]
    fn test_domain_rule_matches_textual_address() {
        let rule = rule("93.184.*");
        assert!(rule.matches("example.com", &ip("93.184.216.34"), 443));
    }

    #[test]
    fn test_cidr_rule() {
        let rule = rule("10.0.0.0/8");
        assert!(rule.matches("x", &ip("10.1.2.3"), 80));
        assert!(rule.matches("x", &ip("10.255.255.255"), 80));
        assert!(!rule.matches("x", &ip("11.0.0.0"), 80));
        assert!(!rule.matches("x", &ip("::1"), 80));
    }

    #[test]
    fn test_cidr_rule_partial_octet() {
        let rule = rule("172.16.0.0/12");
        assert!(rule.matches("x", &ip("172.16.0.1"), 80));
        assert!(rule.matches("x", &ip("172.31.255.255"), 80));
        assert!(!rule.matches("x", &ip("172.32.0.1"), 80));
    }

    #[test]
    fn test_single_ip_rule() {
        let rule = rule("::1");
        assert!(rule.matches("localhost", &ip("0:0:0:0:0:0:0:1"), 80));
        assert!(!rule.matches("localhost", &ip("::2"), 80));
    }

    #[test]
    fn test_cidr_matches_6to4_and_mapped() {
        let rule = rule("127.0.0.0/8");
        // 2002:7f00:0001:: embeds 127.0.0.1
        assert!(rule.matches("x", &ip("2002:7f00:1::"), 80));
        assert!(rule.matches("x", &ip("::ffff:127.0.0.1"), 80));
    }

    #[test]
    fn test_port_restriction() {
        let rule = AddressRule::parse("*", Some(8080), PartialOptions::default()).unwrap();
        assert!(rule.matches("example.com", &ip("93.184.216.34"), 8080));
        assert!(!rule.matches("example.com", &ip("93.184.216.34"), 80));
    }

    #[test]
    fn test_malformed_rules() {
        for bad in ["10.0.0.0/abc", "not-an-ip/8", "10.0.0.0/33", "::/129", ""] {
            let result = AddressRule::parse(bad, None, PartialOptions::default());
            assert!(
                matches!(result, Err(CoreError::InvalidRule { .. })),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_is_private_v4() {
        for private in [
            "127.0.0.1",
            "10.0.0.1",
            "172.16.5.4",
            "192.168.1.1",
            "169.254.1.1",
            "0.0.0.0",
            "224.0.0.1",
            "100.64.0.1",
            "100.127.255.255",
            "192.0.0.192",
        ] {
            assert!(is_private(&ip(private)), "{private} should be private");
        }

        for public in ["8.8.8.8", "1.1.1.1", "93.184.216.34", "172.32.0.1", "100.128.0.1"] {
            assert!(!is_private(&ip(public)), "{public} should be public");
        }
    }

    #[test]
    fn test_is_private_v6() {
        assert!(is_private(&ip("::1")));
        assert!(is_private(&ip("::")));
        assert!(is_private(&ip("fe80::1")));
        assert!(is_private(&ip("fd00::1")));
        assert!(is_private(&ip("ff02::1")));
        assert!(is_private(&ip("::ffff:10.0.0.1")));
        assert!(!is_private(&ip("2001:4860:4860::8888")));
    }

    #[test]
    fn test_private_token() {
        let rule = rule("$private");
        assert!(rule.matches("localhost", &ip("127.0.0.1"), 80));
        assert!(!rule.matches("example.com", &ip("93.184.216.34"), 80));
    }
}
