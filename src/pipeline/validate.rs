//! Request-time URL validation.
//!
//! Archivers fetch whatever they are pointed at, so the pipeline refuses
//! anything that could reach internal infrastructure: non-http(s) schemes,
//! literal private/loopback/link-local/multicast addresses (v4 and v6), and
//! hostnames that resolve only to such addresses.

use std::net::IpAddr;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid URL: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("unsupported scheme {0:?} (only http and https are archived)")]
    Scheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("address {0} is not publicly routable")]
    ForbiddenAddress(IpAddr),
    #[error("host {0:?} did not resolve")]
    Unresolvable(String),
}

/// Validates and canonicalizes a URL for archiving.
pub async fn validate_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::Scheme(other.to_string())),
    }

    match url.host() {
        None => return Err(ValidationError::MissingHost),
        Some(url::Host::Ipv4(addr)) => {
            let addr = IpAddr::V4(addr);
            if is_forbidden(addr) {
                return Err(ValidationError::ForbiddenAddress(addr));
            }
        }
        Some(url::Host::Ipv6(addr)) => {
            let addr = IpAddr::V6(addr);
            if is_forbidden(addr) {
                return Err(ValidationError::ForbiddenAddress(addr));
            }
        }
        Some(url::Host::Domain(domain)) => {
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|_| ValidationError::Unresolvable(domain.to_string()))?
                .map(|sa| sa.ip())
                .collect();
            if addrs.is_empty() {
                return Err(ValidationError::Unresolvable(domain.to_string()));
            }
            if addrs.iter().all(|addr| is_forbidden(*addr)) {
                // All answers are internal; a public name would have at
                // least one routable address.
                return Err(ValidationError::ForbiddenAddress(addrs[0]));
            }
        }
    }

    Ok(url)
}

/// True for addresses the archiver must never fetch.
pub fn is_forbidden(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80
                // v4-mapped addresses inherit the v4 rules
                || v6.to_ipv4_mapped().map(|v4| is_forbidden(IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_and_private_literals_are_rejected() {
        for url in [
            "http://127.0.0.1:8080/",
            "http://10.0.0.5/",
            "http://192.168.1.1/admin",
            "http://172.16.0.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[fe80::1]/",
            "http://[fc00::1]/",
        ] {
            assert!(
                validate_url(url).await.is_err(),
                "{url} must be rejected"
            );
        }
    }

    #[tokio::test]
    async fn non_http_schemes_are_rejected() {
        for url in ["ftp://example.com/", "file:///etc/passwd", "gopher://x/"] {
            match validate_url(url).await {
                Err(ValidationError::Scheme(_)) => {}
                other => panic!("expected scheme rejection for {url}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn garbage_is_invalid() {
        assert!(validate_url("not a url").await.is_err());
        assert!(validate_url("http://").await.is_err());
    }

    #[test]
    fn forbidden_address_table() {
        assert!(is_forbidden("127.0.0.1".parse().unwrap()));
        assert!(is_forbidden("10.1.2.3".parse().unwrap()));
        assert!(is_forbidden("224.0.0.1".parse().unwrap()));
        assert!(is_forbidden("::1".parse().unwrap()));
        assert!(is_forbidden("::ffff:192.168.0.1".parse().unwrap()));
        assert!(!is_forbidden("93.184.215.14".parse().unwrap()));
        assert!(!is_forbidden("2606:2800:21f:cb07:6820:80da:af6b:8b2c".parse().unwrap()));
    }
}
