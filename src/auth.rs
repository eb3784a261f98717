use hyper::header::PROXY_AUTHORIZATION;
use hyper::HeaderMap;
use std::collections::HashSet;
use std::net::IpAddr;

/// Immutable credential store built once from configuration.
///
/// Holds full `Basic <base64>` header values; shared read-only by all
/// sessions, so no locking is needed.
#[derive(Debug, Default)]
pub struct CredentialStore {
    credentials: HashSet<String>,
}

impl CredentialStore {
    pub fn new(credentials: HashSet<String>) -> Self {
        Self { credentials }
    }

    pub fn is_valid(&self, header_value: &str) -> bool {
        self.credentials.contains(header_value)
    }
}

/// True for addresses the admission gate always trusts: loopback and
/// RFC 1918 / link-local ranges (plus IPv6 unique-local).
pub fn is_private_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn has_bypass_marker(headers: &HeaderMap, bypass_header: Option<&str>) -> bool {
    bypass_header.is_some_and(|name| headers.contains_key(name))
}

/// Admission gate for tunnel and forward requests.
///
/// Admits when the client is private/loopback, authentication is disabled,
/// the request carries the bypass marker header, or the credential header
/// matches the store. Everything else is a rejection.
pub fn admit_proxy(
    peer: IpAddr,
    headers: &HeaderMap,
    require_auth: bool,
    bypass_header: Option<&str>,
    store: &CredentialStore,
) -> bool {
    if is_private_addr(peer) || !require_auth || has_bypass_marker(headers, bypass_header) {
        return true;
    }
    headers
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| store.is_valid(v))
}

/// Admission gate for local (administrative/static) requests.
///
/// Independent of the proxy credential policy: private/loopback sources and
/// bypass-marker requests are always admitted, and so is everyone when
/// authentication is disabled.
pub fn admit_local(
    peer: IpAddr,
    headers: &HeaderMap,
    require_auth: bool,
    bypass_header: Option<&str>,
) -> bool {
    is_private_addr(peer) || !require_auth || has_bypass_marker(headers, bypass_header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn store_with(value: &str) -> CredentialStore {
        let mut set = HashSet::new();
        set.insert(value.to_string());
        CredentialStore::new(set)
    }

    fn public_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn private_address_detection() {
        assert!(is_private_addr(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_private_addr(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(is_private_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
        assert!(is_private_addr(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_private_addr(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_private_addr(public_ip()));
        assert!(!is_private_addr(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn loopback_is_admitted_without_credentials() {
        let store = CredentialStore::default();
        let headers = HeaderMap::new();
        assert!(admit_proxy(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &headers,
            true,
            None,
            &store
        ));
    }

    #[test]
    fn public_client_without_credential_is_rejected() {
        let store = store_with("Basic abc");
        let headers = HeaderMap::new();
        assert!(!admit_proxy(public_ip(), &headers, true, None, &store));
    }

    #[test]
    fn valid_credential_is_admitted() {
        let store = store_with("Basic dXNlcjpwYXNz");
        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(admit_proxy(public_ip(), &headers, true, None, &store));
    }

    #[test]
    fn wrong_credential_is_rejected() {
        let store = store_with("Basic dXNlcjpwYXNz");
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic nope"));
        assert!(!admit_proxy(public_ip(), &headers, true, None, &store));
    }

    #[test]
    fn bypass_marker_short_circuits_the_gate() {
        let store = CredentialStore::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-knock", HeaderValue::from_static("1"));
        assert!(admit_proxy(
            public_ip(),
            &headers,
            true,
            Some("x-knock"),
            &store
        ));
        assert!(admit_local(public_ip(), &headers, true, Some("x-knock")));
    }

    #[test]
    fn auth_disabled_admits_everyone() {
        let store = CredentialStore::default();
        let headers = HeaderMap::new();
        assert!(admit_proxy(public_ip(), &headers, false, None, &store));
        assert!(admit_local(public_ip(), &headers, false, None));
    }

    #[test]
    fn local_gate_ignores_credentials() {
        let headers = HeaderMap::new();
        assert!(!admit_local(public_ip(), &headers, true, None));
        assert!(admit_local(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            &headers,
            true,
            None
        ));
    }
}
