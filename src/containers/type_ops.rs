/*!
 * Key Types
 *
 * The lookup and ACL layers compare keys of several shapes: plain strings,
 * integers, IP networks and compiled regexes. The variants are pre-wired
 * into one sum type; matching carries the per-variant semantics (CIDR
 * containment for IPs, pattern match for regexes).
 */

use std::cmp::Ordering;
use std::net::IpAddr;
use std::str::FromStr;

use crate::core::errors::LookupError;
use crate::core::types::LookupResult;

/// An IP network key: address plus prefix length. Hosts are networks with
/// a full-length prefix.
#[derive(Debug, Clone)]
pub struct IpKey {
    addr: IpAddr,
    prefix: u8,
}

impl IpKey {
    #[must_use]
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        let prefix = prefix.min(Self::full_prefix(&addr));
        Self { addr, prefix }
    }

    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        let addr = Self::fold(addr);
        Self {
            prefix: Self::full_prefix(&addr),
            addr,
        }
    }

    fn full_prefix(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Project IPv4-mapped IPv6 addresses down to IPv4 so the two notations
    /// of one host compare equal.
    fn fold(addr: IpAddr) -> IpAddr {
        match addr {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => addr,
            },
            v4 => v4,
        }
    }

    /// True when `host` lies inside this network. Mixed-family probes are
    /// folded first; a genuinely-v6 host can never match a v4 network.
    #[must_use]
    pub fn contains(&self, host: IpAddr) -> bool {
        let net = Self::fold(self.addr);
        let host = Self::fold(host);
        match (net, host) {
            (IpAddr::V4(n), IpAddr::V4(h)) => {
                let prefix = self.prefix.min(32) as u32;
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                (u32::from(n) & mask) == (u32::from(h) & mask)
            }
            (IpAddr::V6(n), IpAddr::V6(h)) => {
                let prefix = self.prefix.min(128) as u32;
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix)
                };
                (u128::from(n) & mask) == (u128::from(h) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpKey {
    type Err = LookupError;

    /// Parse `a.b.c.d`, `a.b.c.d/m`, `x::y` or `x::y/m`.
    fn from_str(s: &str) -> LookupResult<Self> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part.parse().map_err(|_| LookupError::Parse {
            path: String::new(),
            line: 0,
            reason: format!("bad ip address {:?}", s),
        })?;
        let folded = Self::fold(addr);
        let prefix = match prefix_part {
            Some(p) => {
                let prefix = p.parse::<u8>().map_err(|_| LookupError::Parse {
                    path: String::new(),
                    line: 0,
                    reason: format!("bad prefix in {:?}", s),
                })?;
                if addr.is_ipv6() && folded.is_ipv4() {
                    // The mapped-v4 space sits in the low 32 bits, so a v6
                    // prefix translates by dropping the 96 leading bits.
                    prefix.saturating_sub(96).min(32)
                } else {
                    prefix
                }
            }
            None => Self::full_prefix(&folded),
        };
        Ok(Self::new(folded, prefix))
    }
}

impl PartialEq for IpKey {
    fn eq(&self, other: &Self) -> bool {
        // Symmetric: either side may be the network.
        self.contains(other.addr) || other.contains(self.addr)
    }
}

/// Lookup key over the pre-wired type variants.
#[derive(Debug, Clone)]
pub enum Key {
    Str(String),
    Int(i64),
    Ip(IpKey),
    Regex(regex::Regex),
}

impl Key {
    pub fn regex(pattern: &str) -> LookupResult<Self> {
        regex::Regex::new(pattern)
            .map(Key::Regex)
            .map_err(|e| LookupError::BadRegex(pattern.to_string(), e))
    }

    /// Does a probe string hit this key? Strings compare exactly, integers
    /// numerically, IPs by containment, regexes by pattern match.
    #[must_use]
    pub fn matches(&self, probe: &str) -> bool {
        match self {
            Key::Str(s) => s == probe,
            Key::Int(i) => probe.parse::<i64>().map(|p| p == *i).unwrap_or(false),
            Key::Ip(net) => probe
                .parse::<IpAddr>()
                .map(|h| net.contains(h))
                .unwrap_or(false),
            Key::Regex(re) => re.is_match(probe),
        }
    }

    /// Ordering used by sorted containers; variants order before values.
    #[must_use]
    pub fn compare(&self, other: &Key) -> Ordering {
        match (self, other) {
            (Key::Str(a), Key::Str(b)) => a.cmp(b),
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Str(_), _) => Ordering::Less,
            (_, Key::Str(_)) => Ordering::Greater,
            (Key::Int(_), _) => Ordering::Less,
            (_, Key::Int(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

/// Convenience used by tests and the ACL seam.
#[must_use]
pub fn ip_equal(network: &str, host: &str) -> bool {
    let (Ok(net), Ok(h)) = (network.parse::<IpKey>(), host.parse::<IpAddr>()) else {
        return false;
    };
    net.contains(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cidr_containment() {
        assert!(ip_equal("10.0.0.0/24", "10.0.0.200"));
        assert!(!ip_equal("10.0.0.0/24", "10.0.1.1"));
        assert!(ip_equal("10.0.0.1", "10.0.0.1"));
        assert!(!ip_equal("10.0.0.1", "10.0.0.2"));
    }

    #[test]
    fn v4_mapped_v6_folds_to_v4() {
        assert!(ip_equal("10.0.0.0/24", "::ffff:10.0.0.7"));
        assert!(ip_equal("::ffff:10.0.0.0/120", "10.0.0.7"));
        assert!(!ip_equal("::ffff:10.0.0.0/120", "10.0.1.7"));
        assert!(!ip_equal("10.0.0.0/24", "2001:db8::1"));
    }

    #[test]
    fn mapped_prefix_translates_to_v4_width() {
        // /112 in v6 space is /16 over the embedded v4 address.
        assert!(ip_equal("::ffff:10.0.0.0/112", "10.0.200.1"));
        assert!(!ip_equal("::ffff:10.0.0.0/112", "10.1.0.1"));
        // /96 covers the whole mapped-v4 space.
        assert!(ip_equal("::ffff:0.0.0.0/96", "192.0.2.1"));
    }

    #[test]
    fn v6_prefix() {
        assert!(ip_equal("2001:db8::/32", "2001:db8:1::5"));
        assert!(!ip_equal("2001:db8::/32", "2001:db9::1"));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        assert!(ip_equal("0.0.0.0/0", "192.168.1.1"));
    }

    #[test]
    fn key_matching() {
        assert!(Key::Str("alpha".into()).matches("alpha"));
        assert!(!Key::Str("alpha".into()).matches("beta"));
        assert!(Key::Int(42).matches("42"));
        assert!(Key::regex("^img/.*$").unwrap().matches("img/png"));
        assert!(Key::Ip("127.0.0.0/8".parse().unwrap()).matches("127.1.2.3"));
    }

    #[test]
    fn key_ordering() {
        assert_eq!(
            Key::Str("a".into()).compare(&Key::Str("b".into())),
            Ordering::Less
        );
        assert_eq!(Key::Int(2).compare(&Key::Int(2)), Ordering::Equal);
    }
}
