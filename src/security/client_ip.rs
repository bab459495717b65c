use crate::security::{IpConfig, Result, SecurityError};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Proxy headers consulted for the client address, most trusted first
pub const CLIENT_IP_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "client-ip",
    "x-forwarded-for",
    "x-forwarded",
    "x-cluster-client-ip",
    "forwarded-for",
    "forwarded",
];

pub const UNKNOWN_CLIENT: &str = "unknown";

/// Resolved client address, stored in request extensions by the gatekeeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl ClientIp {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ClientIp>()
            .cloned()
            .unwrap_or_else(|| ClientIp(UNKNOWN_CLIENT.to_string())))
    }
}

/// Single address or CIDR range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpMatcher {
    Exact(IpAddr),
    Ipv4 { network: u32, mask: u32 },
    Ipv6 { network: u128, mask: u128 },
}

impl IpMatcher {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |detail: String| SecurityError::Configuration {
            message: format!("Invalid IP rule '{raw}': {detail}"),
        };

        let Some((addr_part, prefix_part)) = raw.split_once('/') else {
            return raw
                .parse()
                .map(IpMatcher::Exact)
                .map_err(|e| invalid(e.to_string()));
        };

        let base: IpAddr = addr_part.parse().map_err(|e| invalid(format!("{e}")))?;
        let prefix: u32 = prefix_part
            .parse()
            .map_err(|_| invalid(format!("bad prefix '{prefix_part}'")))?;

        match base {
            IpAddr::V4(base) => {
                if prefix > 32 {
                    return Err(invalid(format!("prefix {prefix} exceeds 32")));
                }
                let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
                Ok(IpMatcher::Ipv4 {
                    network: u32::from(base) & mask,
                    mask,
                })
            }
            IpAddr::V6(base) => {
                if prefix > 128 {
                    return Err(invalid(format!("prefix {prefix} exceeds 128")));
                }
                let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
                Ok(IpMatcher::Ipv6 {
                    network: u128::from(base) & mask,
                    mask,
                })
            }
        }
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (IpMatcher::Exact(expected), ip) => *expected == ip,
            (IpMatcher::Ipv4 { network, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *network,
            (IpMatcher::Ipv6 { network, mask }, IpAddr::V6(v6)) => {
                u128::from(v6) & mask == *network
            }
            _ => false,
        }
    }
}

/// Client address resolution plus the allow and deny lists
pub struct ClientIpResolver {
    check_proxy_headers: bool,
    allow: Vec<IpMatcher>,
    deny: Vec<IpMatcher>,
}

impl ClientIpResolver {
    pub fn new(config: &IpConfig) -> Result<Self> {
        Ok(Self {
            check_proxy_headers: config.check_proxy_headers,
            allow: parse_rules(&config.whitelist)?,
            deny: parse_rules(&config.blacklist)?,
        })
    }

    /// First public address found in the proxy headers, else the socket address
    pub fn resolve(&self, headers: &HeaderMap, remote: Option<IpAddr>) -> String {
        if self.check_proxy_headers {
            for name in CLIENT_IP_HEADERS {
                let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) else {
                    continue;
                };
                let first = value.split(',').next().unwrap_or_default();
                if let Some(ip) = parse_header_ip(first) {
                    if is_public(ip) {
                        return ip.to_string();
                    }
                    debug!("Ignoring non-public address in {} header", name);
                }
            }
        }

        remote
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    /// Deny-list first, then the allow-list (empty allows everyone)
    pub fn is_allowed(&self, ip: &str) -> bool {
        let parsed = ip.parse::<IpAddr>().ok();

        if let Some(addr) = parsed {
            if self.deny.iter().any(|rule| rule.matches(addr)) {
                return false;
            }
        }
        if self.allow.is_empty() {
            return true;
        }
        parsed.is_some_and(|addr| self.allow.iter().any(|rule| rule.matches(addr)))
    }
}

fn parse_rules(raw: &[String]) -> Result<Vec<IpMatcher>> {
    let mut rules = Vec::new();
    for entry in raw.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
        let rule = IpMatcher::parse(entry)?;
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    Ok(rules)
}

/// Accepts bare addresses and the `for=` element of `Forwarded`
fn parse_header_ip(raw: &str) -> Option<IpAddr> {
    let mut value = raw.trim();
    if let Some(pair) = value
        .split(';')
        .find(|part| part.trim().to_ascii_lowercase().starts_with("for="))
    {
        value = pair.trim()[4..].trim_matches('"');
    }
    let value = value.trim_start_matches('[');
    let value = value.split(']').next().unwrap_or(value);
    value.parse().ok()
}

/// Not private, loopback, link-local, unspecified or otherwise reserved
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => is_public_v6(v6),
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, ..] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || a == 0
        || a >= 240)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(v4);
    }
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local
        || (first & 0xffc0) == 0xfe80) // link local
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn resolver(whitelist: &[&str], blacklist: &[&str]) -> ClientIpResolver {
        ClientIpResolver::new(&IpConfig {
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            check_proxy_headers: true,
        })
        .unwrap()
    }

    #[test]
    fn test_cidr_matching() {
        let v4 = IpMatcher::parse("192.0.2.0/24").unwrap();
        assert!(v4.matches("192.0.2.77".parse().unwrap()));
        assert!(!v4.matches("192.0.3.1".parse().unwrap()));

        let v6 = IpMatcher::parse("2001:db8::/32").unwrap();
        assert!(v6.matches("2001:db8:1::5".parse().unwrap()));
        assert!(!v6.matches("192.0.2.77".parse().unwrap()));

        let all = IpMatcher::parse("0.0.0.0/0").unwrap();
        assert!(all.matches("8.8.8.8".parse().unwrap()));

        assert!(IpMatcher::parse("10.0.0.0/33").is_err());
        assert!(IpMatcher::parse("not-an-ip").is_err());
    }

    #[test]
    fn test_resolution_prefers_public_proxy_address() {
        let r = resolver(&[], &[]);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("client-ip", HeaderValue::from_static("10.1.1.1"));

        let remote = Some("10.0.0.254".parse().unwrap());
        assert_eq!(r.resolve(&headers, remote), "203.0.113.9");

        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(r.resolve(&headers, remote), "198.51.100.4");

        let mut forwarded = HeaderMap::new();
        forwarded.insert("forwarded", HeaderValue::from_static("for=\"[2001:db8::7]\";proto=https"));
        assert_eq!(r.resolve(&forwarded, None), "2001:db8::7");
    }

    #[test]
    fn test_resolution_falls_back_to_socket() {
        let r = resolver(&[], &[]);
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("127.0.0.1"));

        assert_eq!(r.resolve(&headers, Some("10.0.0.3".parse().unwrap())), "10.0.0.3");
        assert_eq!(r.resolve(&headers, None), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_allow_and_deny_lists() {
        let open = resolver(&[], &["203.0.113.0/24"]);
        assert!(open.is_allowed("198.51.100.1"));
        assert!(open.is_allowed(UNKNOWN_CLIENT));
        assert!(!open.is_allowed("203.0.113.50"));

        let closed = resolver(&["198.51.100.0/24", "192.0.2.10"], &[]);
        assert!(closed.is_allowed("198.51.100.200"));
        assert!(closed.is_allowed("192.0.2.10"));
        assert!(!closed.is_allowed("192.0.2.11"));
        assert!(!closed.is_allowed(UNKNOWN_CLIENT));
    }

    #[test]
    fn test_public_ranges() {
        for ip in ["10.1.2.3", "172.20.0.1", "192.168.1.1", "127.0.0.1", "169.254.1.1", "0.1.2.3", "250.0.0.1", "::1", "fd00::1", "fe80::1"] {
            assert!(!is_public(ip.parse().unwrap()), "{ip} should not be public");
        }
        for ip in ["8.8.8.8", "203.0.113.9", "2001:db8::7"] {
            assert!(is_public(ip.parse().unwrap()), "{ip} should be public");
        }
    }
}
