use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Why a URL was rejected by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardError {
    /// Not parseable as a URL.
    Invalid,
    /// Scheme other than http/https.
    Scheme,
    /// Host is, or resolves to, a private/internal address.
    Private,
    /// Hostname did not resolve to any address.
    Unresolvable,
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Invalid => write!(f, "URL is not valid"),
            GuardError::Scheme => write!(f, "URL scheme must be http or https"),
            GuardError::Private => {
                write!(f, "URL targets a private or internal address: not allowed")
            }
            GuardError::Unresolvable => write!(f, "URL hostname did not resolve"),
        }
    }
}

impl std::error::Error for GuardError {}

/// Hostnames rejected outright, before any resolution.
const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "metadata.google.internal"];

/// Validate a user-supplied URL against SSRF.
///
/// IP-literal hosts are classified directly. Hostname hosts are resolved
/// (v4 and v6) and rejected if **any** returned address falls in a blocked
/// range. Call this for every URL the gateway will itself dereference —
/// at registration time only; proxied calls reuse the pinned base URL.
pub async fn validate(raw: &str) -> Result<(), GuardError> {
    let parsed = Url::parse(raw).map_err(|_| GuardError::Invalid)?;

    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(GuardError::Scheme),
    }

    let host = parsed.host().ok_or(GuardError::Invalid)?;

    match host {
        Host::Ipv4(ip) => {
            if ipv4_is_blocked(ip) {
                return Err(GuardError::Private);
            }
            Ok(())
        }
        Host::Ipv6(ip) => {
            if ipv6_is_blocked(ip) {
                return Err(GuardError::Private);
            }
            Ok(())
        }
        Host::Domain(name) => {
            let lowered = name.to_ascii_lowercase();
            if BLOCKED_HOSTNAMES.contains(&lowered.as_str()) {
                return Err(GuardError::Private);
            }

            let port = parsed.port_or_known_default().unwrap_or(443);
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((lowered.as_str(), port))
                .await
                .map_err(|e| {
                    tracing::debug!("guard: resolution failed, host={}, error={}", lowered, e);
                    GuardError::Unresolvable
                })?
                .map(|sa| sa.ip())
                .collect();

            if addrs.is_empty() {
                return Err(GuardError::Unresolvable);
            }
            if addrs.iter().any(ip_is_blocked) {
                tracing::debug!("guard: host resolves into a blocked range, host={}", lowered);
                return Err(GuardError::Private);
            }
            Ok(())
        }
    }
}

fn ip_is_blocked(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ipv4_is_blocked(*v4),
        IpAddr::V6(v6) => ipv6_is_blocked(*v6),
    }
}

/// Blocked IPv4 ranges: 10/8, 127/8, 172.16/12, 192.168/16, 169.254/16, 0/8.
fn ipv4_is_blocked(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || o[0] == 0
}

/// Blocked IPv6: ::1, ::, fc00::/7, fe80::/10. IPv4-mapped addresses
/// (both the dotted and hex textual forms parse to the same address) are
/// unwrapped and re-checked against the IPv4 rules.
fn ipv6_is_blocked(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return ipv4_is_blocked(mapped);
    }

    let seg = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        || (seg[0] & 0xfe00) == 0xfc00
        || (seg[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn kind(raw: &str) -> Option<GuardError> {
        validate(raw).await.err()
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert_eq!(kind("not a url").await, Some(GuardError::Invalid));
        assert_eq!(kind("").await, Some(GuardError::Invalid));
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        assert_eq!(kind("ftp://example.com/").await, Some(GuardError::Scheme));
        assert_eq!(kind("file:///etc/passwd").await, Some(GuardError::Scheme));
        assert_eq!(
            kind("gopher://example.com/").await,
            Some(GuardError::Scheme)
        );
    }

    #[tokio::test]
    async fn rejects_private_ipv4_literals() {
        for u in [
            "http://10.0.0.1/",
            "http://10.255.255.255/api",
            "http://127.0.0.1:8080/",
            "http://172.16.0.1/",
            "http://172.31.255.254/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data/",
            "http://0.0.0.0/",
            "http://0.1.2.3/",
        ] {
            assert_eq!(kind(u).await, Some(GuardError::Private), "url: {}", u);
        }
    }

    #[tokio::test]
    async fn accepts_public_ipv4_literals() {
        assert!(validate("http://93.184.216.34/").await.is_ok());
        assert!(validate("https://8.8.8.8/dns").await.is_ok());
        // 172.32.0.0 is just past the 172.16/12 block.
        assert!(validate("http://172.32.0.1/").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_blocked_ipv6_literals() {
        for u in [
            "http://[::1]/",
            "http://[::]/",
            "http://[fc00::1]/",
            "http://[fdff::1]/",
            "http://[fe80::1]/",
        ] {
            assert_eq!(kind(u).await, Some(GuardError::Private), "url: {}", u);
        }
    }

    #[tokio::test]
    async fn rejects_ipv4_mapped_ipv6_in_both_forms() {
        // Dotted form.
        assert_eq!(
            kind("http://[::ffff:169.254.169.254]/").await,
            Some(GuardError::Private)
        );
        // 16-bit hex form: a9fe:a9fe == 169.254.169.254.
        assert_eq!(
            kind("http://[::ffff:a9fe:a9fe]/").await,
            Some(GuardError::Private)
        );
        assert_eq!(
            kind("http://[::ffff:7f00:1]/").await,
            Some(GuardError::Private)
        );
    }

    #[tokio::test]
    async fn accepts_public_ipv6_literal() {
        assert!(validate("http://[2606:2800:220:1:248:1893:25c8:1946]/").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_blocked_hostnames_without_resolving() {
        assert_eq!(kind("http://localhost:3000/").await, Some(GuardError::Private));
        assert_eq!(kind("http://LOCALHOST/").await, Some(GuardError::Private));
        assert_eq!(
            kind("http://metadata.google.internal/computeMetadata/v1/").await,
            Some(GuardError::Private)
        );
    }

    #[tokio::test]
    async fn unresolvable_hostname() {
        // RFC 2606 reserves .invalid; resolution always fails.
        assert_eq!(
            kind("http://agent-door.invalid/").await,
            Some(GuardError::Unresolvable)
        );
    }
}
