//! Client address resolution for captured requests.
//!
//! Proxy headers are consulted in a fixed order and the *last* one carrying a
//! valid IP wins, so a forged `X-Forwarded-For` is shadowed by a header set by
//! a more trusted hop further down the list. The header set is not
//! configurable; deployments exposed directly to the internet should treat
//! the result as advisory.

use std::net::{IpAddr, SocketAddr};

use warp::http::HeaderMap;

pub const ADDRESS_HEADERS: [&str; 3] = ["X-Forwarded-For", "X-Real-IP", "CF-Connecting-IP"];

/// First comma-separated token of the header, if it parses as an IP.
fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    value.split(',').next()?.trim().parse().ok()
}

/// Resolves the address recorded for a captured request.
///
/// Falls back to the transport peer (without port), or an empty string when
/// the peer is unknown.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    ADDRESS_HEADERS
        .iter()
        .filter_map(|name| header_ip(headers, name))
        .last()
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.0.0.1:54321".parse().unwrap())
    }

    #[test]
    fn test_falls_back_to_peer() {
        assert_eq!(client_address(&HeaderMap::new(), peer()), "10.0.0.1");
        assert_eq!(client_address(&HeaderMap::new(), None), "");
    }

    #[test]
    fn test_forwarded_for_first_token() {
        let h = headers(&[("x-forwarded-for", " 4.4.4.4 , 8.8.8.8")]);
        assert_eq!(client_address(&h, peer()), "4.4.4.4");
    }

    #[test]
    fn test_last_valid_header_wins() {
        let h = headers(&[
            ("x-forwarded-for", "1.1.1.1"),
            ("x-real-ip", "2.2.2.2"),
            ("cf-connecting-ip", "2606:4700::1111"),
        ]);
        assert_eq!(client_address(&h, peer()), "2606:4700::1111");

        let h = headers(&[("x-forwarded-for", "1.1.1.1"), ("cf-connecting-ip", "garbage")]);
        assert_eq!(client_address(&h, peer()), "1.1.1.1");
    }

    #[test]
    fn test_invalid_headers_ignored() {
        let h = headers(&[("x-forwarded-for", "unknown"), ("x-real-ip", "")]);
        assert_eq!(client_address(&h, peer()), "10.0.0.1");
    }
}
