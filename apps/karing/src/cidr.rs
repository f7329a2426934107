//! IPv4 CIDR matching and normalization for allow/deny lists and trusted proxies.

use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("'{0}' is not an IPv4 address")]
    InvalidAddress(String),
    #[error("'{0}' has a prefix length outside 0..=32")]
    InvalidPrefix(String),
}

fn parse_ipv4(value: &str) -> Option<u32> {
    value.trim().parse::<Ipv4Addr>().ok().map(u32::from)
}

fn prefix_mask(bits: u32) -> u32 {
    if bits == 0 { 0 } else { u32::MAX << (32 - bits) }
}

/// Whether `ip` falls inside `cidr`. An entry without a prefix matches by equality.
pub fn cidr_matches(cidr: &str, ip: &str) -> bool {
    let Some((network, bits)) = cidr.split_once('/') else {
        return cidr.trim() == ip.trim();
    };
    let Some(bits) = bits.trim().parse::<u32>().ok().filter(|bits| *bits <= 32) else {
        return false;
    };
    let (Some(network), Some(candidate)) = (parse_ipv4(network), parse_ipv4(ip)) else {
        return false;
    };
    let mask = prefix_mask(bits);
    (candidate & mask) == (network & mask)
}

pub fn ip_in_list<S: AsRef<str>>(cidrs: &[S], ip: &str) -> bool {
    cidrs.iter().any(|cidr| cidr_matches(cidr.as_ref(), ip))
}

pub fn is_loopback(ip: &str) -> bool {
    ip == "::1" || cidr_matches("127.0.0.0/8", ip)
}

/// Rewrites `a.b.c.d/n` to its network address; a bare host becomes `/32`.
pub fn normalize_ipv4_cidr(input: &str) -> Result<String, CidrError> {
    let input = input.trim();
    let (address, bits) = match input.split_once('/') {
        Some((address, bits)) => {
            let bits = bits
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|bits| *bits <= 32)
                .ok_or_else(|| CidrError::InvalidPrefix(input.to_string()))?;
            (address, bits)
        }
        None => (input, 32),
    };
    let numeric =
        parse_ipv4(address).ok_or_else(|| CidrError::InvalidAddress(input.to_string()))?;
    let network = Ipv4Addr::from(numeric & prefix_mask(bits));
    Ok(format!("{network}/{bits}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_by_prefix() {
        assert!(cidr_matches("10.0.0.0/24", "10.0.0.5"));
        assert!(!cidr_matches("10.0.0.0/24", "10.0.1.5"));
        assert!(cidr_matches("10.0.0.5/32", "10.0.0.5"));
        assert!(cidr_matches("0.0.0.0/0", "203.0.113.9"));
        assert!(cidr_matches("192.168.0.0/16", "192.168.44.1"));
    }

    #[test]
    fn bare_entries_match_by_equality() {
        assert!(cidr_matches("10.0.0.5", "10.0.0.5"));
        assert!(!cidr_matches("10.0.0.5", "10.0.0.6"));
        assert!(cidr_matches("::1", "::1"));
    }

    #[test]
    fn malformed_entries_never_match() {
        assert!(!cidr_matches("10.0.0.0/abc", "10.0.0.1"));
        assert!(!cidr_matches("not-an-ip/8", "10.0.0.1"));
        assert!(!cidr_matches("10.0.0.0/8", "not-an-ip"));
    }

    #[test]
    fn out_of_range_prefixes_never_match() {
        assert!(!cidr_matches("10.0.0.0/-1", "8.8.8.8"));
        assert!(!cidr_matches("0.0.0.0/-32", "10.0.0.1"));
        assert!(!cidr_matches("10.0.0.1/33", "10.0.0.1"));
        assert!(!cidr_matches("10.0.0.1/99", "10.0.0.1"));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("127.9.9.9"));
        assert!(is_loopback("::1"));
        assert!(!is_loopback("10.0.0.1"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_ipv4_cidr("10.0.0.5/24").expect("normalize");
        assert_eq!(once, "10.0.0.0/24");
        assert_eq!(normalize_ipv4_cidr(&once).expect("normalize"), once);
        assert_eq!(
            normalize_ipv4_cidr("192.168.7.9").expect("normalize"),
            "192.168.7.9/32"
        );
        assert_eq!(
            normalize_ipv4_cidr("8.8.8.8/0").expect("normalize"),
            "0.0.0.0/0"
        );
    }

    #[test]
    fn normalization_rejects_garbage() {
        assert!(matches!(
            normalize_ipv4_cidr("10.0.0.1/33"),
            Err(CidrError::InvalidPrefix(_))
        ));
        assert!(matches!(
            normalize_ipv4_cidr("300.1.1.1/8"),
            Err(CidrError::InvalidAddress(_))
        ));
        assert!(matches!(
            normalize_ipv4_cidr("example.com"),
            Err(CidrError::InvalidAddress(_))
        ));
    }
}
