use std::net::IpAddr;

use axum::http::HeaderMap;

use crate::cidr::ip_in_list;

pub const HEADER_X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const HEADER_X_REAL_IP: &str = "x-real-ip";

/// Renders a peer address, unwrapping IPv4-mapped IPv6 addresses.
pub fn peer_ip_string(peer: IpAddr) -> String {
    peer.to_canonical().to_string()
}

/// Effective client address for a possibly proxied request.
///
/// With proxy trust on, the chain is every `X-Forwarded-For` hop followed by
/// the peer. The nearest hop outside the trusted CIDRs wins; when every hop is
/// trusted, or no trusted list exists, the farthest hop wins. `X-Real-IP`
/// overrides both.
pub fn resolve_client_ip(
    peer_ip: &str,
    headers: &HeaderMap,
    trust_proxy: bool,
    trusted_proxies: &[String],
) -> String {
    if !trust_proxy {
        return peer_ip.to_string();
    }

    let mut chain: Vec<String> = header_value(headers, HEADER_X_FORWARDED_FOR)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|hop| !hop.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    chain.push(peer_ip.to_string());

    let resolved = if trusted_proxies.is_empty() {
        None
    } else {
        chain
            .iter()
            .rev()
            .find(|hop| !ip_in_list(trusted_proxies, hop))
            .cloned()
    };
    let resolved = resolved
        .or_else(|| chain.first().cloned())
        .unwrap_or_else(|| peer_ip.to_string());

    match header_value(headers, HEADER_X_REAL_IP) {
        Some(real_ip) => real_ip,
        None => resolved,
    }
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (key, value) in pairs {
            map.insert(*key, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn untrusted_mode_uses_peer() {
        let map = headers(&[
            (HEADER_X_FORWARDED_FOR, "1.2.3.4"),
            (HEADER_X_REAL_IP, "5.6.7.8"),
        ]);
        assert_eq!(resolve_client_ip("10.0.0.9", &map, false, &[]), "10.0.0.9");
    }

    #[test]
    fn nearest_untrusted_hop_wins() {
        let map = headers(&[(HEADER_X_FORWARDED_FOR, "203.0.113.7, 198.51.100.2, 10.0.0.3")]);
        let trusted = vec!["10.0.0.0/8".to_string()];
        assert_eq!(
            resolve_client_ip("10.0.0.1", &map, true, &trusted),
            "198.51.100.2"
        );
    }

    #[test]
    fn all_trusted_or_no_list_falls_back_to_farthest_hop() {
        let map = headers(&[(HEADER_X_FORWARDED_FOR, "10.1.1.1, 10.2.2.2")]);
        let trusted = vec!["10.0.0.0/8".to_string()];
        assert_eq!(
            resolve_client_ip("10.0.0.1", &map, true, &trusted),
            "10.1.1.1"
        );

        let map = headers(&[(HEADER_X_FORWARDED_FOR, "203.0.113.7, 10.2.2.2")]);
        assert_eq!(resolve_client_ip("10.0.0.1", &map, true, &[]), "203.0.113.7");
        assert_eq!(
            resolve_client_ip("10.0.0.1", &HeaderMap::new(), true, &[]),
            "10.0.0.1"
        );
    }

    #[test]
    fn real_ip_header_overrides_chain() {
        let map = headers(&[
            (HEADER_X_FORWARDED_FOR, "203.0.113.7"),
            (HEADER_X_REAL_IP, " 192.0.2.55 "),
        ]);
        let trusted = vec!["10.0.0.0/8".to_string()];
        assert_eq!(
            resolve_client_ip("10.0.0.1", &map, true, &trusted),
            "192.0.2.55"
        );
    }

    #[test]
    fn mapped_peer_addresses_are_unwrapped() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 5).to_ipv6_mapped());
        assert_eq!(peer_ip_string(mapped), "10.0.0.5");
        assert_eq!(peer_ip_string(IpAddr::V6(Ipv6Addr::LOCALHOST)), "::1");
    }
}
