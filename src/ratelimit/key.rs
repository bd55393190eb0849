//! Rate limit key derivation.

use std::borrow::Borrow;
use std::net::{IpAddr, SocketAddr};

/// Key used when a request carries no usable address at all.
pub const UNKNOWN_KEY: &str = "unknown";

/// A key that identifies whose token bucket a request draws from.
///
/// Usually the textual form of the client IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Create a key from an arbitrary string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Create a key from an IP address.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RateLimitKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Derive a rate limit key from proxy headers and the direct peer address.
///
/// `forwarded_for` holds every `X-Forwarded-For` value in arrival order; the
/// first entry of the first non-empty value is the original client. Only when
/// no forwarded value is present is `real_ip` consulted. A candidate that is not
/// an IP address is discarded in favour of the peer address.
pub fn derive_key<'a, I>(
    forwarded_for: I,
    real_ip: Option<&str>,
    peer_addr: Option<&str>,
) -> RateLimitKey
where
    I: IntoIterator<Item = &'a str>,
{
    let forwarded = forwarded_for
        .into_iter()
        .map(str::trim)
        .find(|value| !value.is_empty());

    let candidate = match forwarded {
        Some(list) => list.split(',').next().map(str::trim),
        None => real_ip.map(str::trim).filter(|value| !value.is_empty()),
    };

    if let Some(ip) = candidate.and_then(|c| c.parse::<IpAddr>().ok()) {
        return RateLimitKey::from_ip(ip);
    }

    peer_key(peer_addr)
}

/// Key for the direct peer, with any port stripped.
fn peer_key(peer_addr: Option<&str>) -> RateLimitKey {
    let Some(peer) = peer_addr.map(str::trim).filter(|p| !p.is_empty()) else {
        return RateLimitKey::new(UNKNOWN_KEY);
    };

    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return RateLimitKey::from_ip(addr.ip());
    }
    if let Ok(ip) = peer.parse::<IpAddr>() {
        return RateLimitKey::from_ip(ip);
    }

    RateLimitKey::new(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Option<&str> = Some("192.0.2.7:5555");

    #[test]
    fn test_first_forwarded_entry_wins() {
        let key = derive_key(["203.0.113.1, 10.0.0.1"], None, PEER);
        assert_eq!(key.as_str(), "203.0.113.1");
    }

    #[test]
    fn test_invalid_forwarded_falls_back_to_peer() {
        let key = derive_key(["not-an-ip"], Some("198.51.100.4"), PEER);
        assert_eq!(key.as_str(), "192.0.2.7");
    }

    #[test]
    fn test_no_headers_uses_peer() {
        let key = derive_key(std::iter::empty(), None, PEER);
        assert_eq!(key.as_str(), "192.0.2.7");
    }

    #[test]
    fn test_real_ip_used_without_forwarded() {
        let key = derive_key(std::iter::empty(), Some("  198.51.100.4 "), PEER);
        assert_eq!(key.as_str(), "198.51.100.4");
    }

    #[test]
    fn test_empty_forwarded_value_is_ignored() {
        let key = derive_key(["", " 2001:db8::1 ,10.0.0.1"], None, PEER);
        assert_eq!(key.as_str(), "2001:db8::1");
    }

    #[test]
    fn test_peer_without_port_and_missing_peer() {
        let bare = derive_key(std::iter::empty(), None, Some("10.1.2.3"));
        assert_eq!(bare.as_str(), "10.1.2.3");

        let v6 = derive_key(std::iter::empty(), None, Some("[::1]:80"));
        assert_eq!(v6.as_str(), "::1");

        let missing = derive_key(std::iter::empty(), None, None);
        assert_eq!(missing.as_str(), UNKNOWN_KEY);
    }

    #[test]
    fn test_key_equality_and_display() {
        let a = derive_key(["203.0.113.1"], None, PEER);
        let b = RateLimitKey::new("203.0.113.1");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "203.0.113.1");
    }
}
