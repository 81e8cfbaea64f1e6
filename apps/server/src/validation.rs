//! Request validation helpers for the authorization endpoint.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::storage::Client;

/// Check a requested `redirect_uri` against the client registration.
///
/// Confidential clients get exact-match semantics against the registered
/// list, checked before any redirect is issued. Public clients additionally
/// get the native-app loopback carve-out: any `http://127.0.0.1:PORT/...`,
/// `http://[::1]:PORT/...`, or `http://localhost:PORT/...` is accepted with
/// the port wildcarded, since the listener port of a CLI is chosen at
/// runtime.
pub fn validate_redirect_uri(client: &Client, redirect_uri: &str) -> bool {
    if client.redirect_uris.iter().any(|u| u == redirect_uri) {
        return true;
    }
    if !client.public {
        return false;
    }
    let Ok(url) = Url::parse(redirect_uri) else {
        return false;
    };
    if url.scheme() != "http" {
        return false;
    }
    match url.host() {
        Some(Host::Ipv4(ip)) => ip == Ipv4Addr::LOCALHOST,
        Some(Host::Ipv6(ip)) => ip == Ipv6Addr::LOCALHOST,
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(public: bool, redirect_uris: &[&str]) -> Client {
        Client {
            id: "client-a".into(),
            secret: "secret".into(),
            redirect_uris: redirect_uris.iter().map(|s| s.to_string()).collect(),
            trusted_peers: vec![],
            public,
            name: "Test".into(),
            logo_url: String::new(),
        }
    }

    #[test]
    fn registered_uri_matches_exactly() {
        let c = client(false, &["https://rp.example/cb"]);
        assert!(validate_redirect_uri(&c, "https://rp.example/cb"));
    }

    #[test]
    fn near_misses_are_rejected_for_confidential_clients() {
        let c = client(false, &["https://rp.example/cb"]);
        assert!(!validate_redirect_uri(&c, "https://rp.example/cb/"));
        assert!(!validate_redirect_uri(&c, "https://rp.example/cb?x=1"));
        assert!(!validate_redirect_uri(&c, "https://rp.example.evil/cb"));
        assert!(!validate_redirect_uri(&c, "http://rp.example/cb"));
    }

    #[test]
    fn confidential_clients_get_no_loopback_carveout() {
        let c = client(false, &["https://rp.example/cb"]);
        assert!(!validate_redirect_uri(&c, "http://127.0.0.1:8000/cb"));
    }

    #[test]
    fn public_clients_accept_any_loopback_port() {
        let c = client(true, &[]);
        assert!(validate_redirect_uri(&c, "http://127.0.0.1:8000/cb"));
        assert!(validate_redirect_uri(&c, "http://127.0.0.1:51234/anything"));
        assert!(validate_redirect_uri(&c, "http://[::1]:9000/cb"));
        assert!(validate_redirect_uri(&c, "http://localhost:8000/cb"));
        assert!(validate_redirect_uri(&c, "http://LOCALHOST:8000/cb"));
    }

    #[test]
    fn public_clients_still_reject_non_loopback_hosts() {
        let c = client(true, &[]);
        assert!(!validate_redirect_uri(&c, "http://localhost.evil:8000/cb"));
        assert!(!validate_redirect_uri(&c, "http://evil.localhost:8000/cb"));
        assert!(!validate_redirect_uri(&c, "http://10.0.0.5:8000/cb"));
        // https loopback is not part of the carve-out
        assert!(!validate_redirect_uri(&c, "https://127.0.0.1:8000/cb"));
        assert!(!validate_redirect_uri(&c, "https://localhost:8000/cb"));
    }

    #[test]
    fn public_clients_also_match_registered_uris() {
        let c = client(true, &["https://rp.example/cb"]);
        assert!(validate_redirect_uri(&c, "https://rp.example/cb"));
        assert!(!validate_redirect_uri(&c, "https://rp.example/other"));
    }

    #[test]
    fn garbage_uris_are_rejected() {
        let c = client(true, &[]);
        assert!(!validate_redirect_uri(&c, "not a url"));
        assert!(!validate_redirect_uri(&c, ""));
    }
}
