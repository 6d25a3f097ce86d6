//! URL validation and firewall-checked address resolution.

use std::net::{IpAddr, SocketAddr};

use url::{Host, Url};

use crate::firewall::{Firewall, Options};

pub const DOMAIN_NOT_PERMITTED: &str = "Domain not permitted";
pub const UNKNOWN_HOST: &str = "Unknown host";
pub const URL_MALFORMED: &str = "URL malformed";
pub const MUST_SPECIFY_SCHEME: &str = "Must specify http or https";
pub const MUST_SPECIFY_WS_SCHEME: &str = "Must specify ws or wss";

/// Which kind of connection a URL is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Http,
    Websocket,
}

impl UrlKind {
    fn schemes(self) -> [&'static str; 2] {
        match self {
            UrlKind::Http => ["http", "https"],
            UrlKind::Websocket => ["ws", "wss"],
        }
    }

    fn missing_scheme(self) -> &'static str {
        match self {
            UrlKind::Http => MUST_SPECIFY_SCHEME,
            UrlKind::Websocket => MUST_SPECIFY_WS_SCHEME,
        }
    }
}

/// Parse and validate a URL without touching the network.
///
/// Errors are messages suitable for showing to the script.
pub fn check_uri(address: &str, kind: UrlKind) -> Result<Url, String> {
    let url = Url::parse(address).map_err(|e| match e {
        url::ParseError::RelativeUrlWithoutBase => kind.missing_scheme().to_string(),
        _ => URL_MALFORMED.to_string(),
    })?;

    if !kind.schemes().contains(&url.scheme()) {
        return Err(format!("Invalid protocol '{}'", url.scheme()));
    }

    match url.host() {
        None => Err(URL_MALFORMED.to_string()),
        Some(Host::Domain(domain)) if domain.is_empty() => Err(URL_MALFORMED.to_string()),
        Some(_) => Ok(url),
    }
}

/// A host resolved to the exact address the firewall approved.
#[derive(Debug, Clone)]
pub struct ResolvedAddress {
    /// Host name as written in the URL, without IPv6 brackets.
    pub host: String,
    pub address: SocketAddr,
    pub options: Options,
}

/// Resolve a URL's host and check it against the firewall.
pub async fn resolve(firewall: &Firewall, url: &Url) -> Result<ResolvedAddress, String> {
    let port = url
        .port_or_known_default()
        .ok_or_else(|| URL_MALFORMED.to_string())?;

    let (host, ip) = match url.host() {
        Some(Host::Ipv4(ip)) => (ip.to_string(), IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => (ip.to_string(), IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => {
            let ip = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|_| UNKNOWN_HOST.to_string())?
                .next()
                .ok_or_else(|| UNKNOWN_HOST.to_string())?
                .ip();
            (domain.to_string(), ip)
        }
        None => return Err(URL_MALFORMED.to_string()),
    };

    let options = firewall.decide(&host, ip, port);
    if !options.is_allowed() {
        return Err(DOMAIN_NOT_PERMITTED.to_string());
    }

    Ok(ResolvedAddress {
        host,
        address: SocketAddr::new(ip, port),
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Action, AddressRule, PartialOptions, RuleSet};

    fn firewall() -> Firewall {
        Firewall::new(RuleSet::new(vec![
            AddressRule::parse("$private", None, PartialOptions::action(Action::Deny)).unwrap(),
            AddressRule::parse("*", None, PartialOptions::action(Action::Allow)).unwrap(),
        ]))
    }

    #[test]
    fn test_check_uri_accepts_http() {
        let url = check_uri("https://example.com/path?q=1", UrlKind::Http).unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_check_uri_errors() {
        assert_eq!(
            check_uri("example.com/path", UrlKind::Http).unwrap_err(),
            MUST_SPECIFY_SCHEME
        );
        assert_eq!(
            check_uri("ftp://example.com", UrlKind::Http).unwrap_err(),
            "Invalid protocol 'ftp'"
        );
        assert_eq!(
            check_uri("ws://example.com", UrlKind::Http).unwrap_err(),
            "Invalid protocol 'ws'"
        );
        assert_eq!(check_uri("http://", UrlKind::Http).unwrap_err(), URL_MALFORMED);
        assert_eq!(
            check_uri("http://[::1", UrlKind::Http).unwrap_err(),
            URL_MALFORMED
        );
    }

    #[test]
    fn test_check_uri_websocket() {
        assert!(check_uri("wss://example.com/socket", UrlKind::Websocket).is_ok());
        assert_eq!(
            check_uri("http://example.com", UrlKind::Websocket).unwrap_err(),
            "Invalid protocol 'http'"
        );
        assert_eq!(
            check_uri("example.com", UrlKind::Websocket).unwrap_err(),
            MUST_SPECIFY_WS_SCHEME
        );
    }

    #[tokio::test]
    async fn test_resolve_denies_loopback() {
        let url = check_uri("http://127.0.0.1:8080/", UrlKind::Http).unwrap();
        let err = resolve(&firewall(), &url).await.unwrap_err();
        assert_eq!(err, DOMAIN_NOT_PERMITTED);

        let url = check_uri("http://[::1]/", UrlKind::Http).unwrap();
        assert_eq!(resolve(&firewall(), &url).await.unwrap_err(), DOMAIN_NOT_PERMITTED);
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_allowed() {
        let url = check_uri("http://93.184.216.34/", UrlKind::Http).unwrap();
        let resolved = resolve(&firewall(), &url).await.unwrap();
        assert_eq!(resolved.address, "93.184.216.34:80".parse().unwrap());
        assert_eq!(resolved.host, "93.184.216.34");
        assert!(resolved.options.is_allowed());
    }

    #[tokio::test]
    async fn test_resolve_localhost_by_name_denied() {
        let url = check_uri("http://localhost:9/", UrlKind::Http).unwrap();
        let err = resolve(&firewall(), &url).await.unwrap_err();
        // Either the name resolves to loopback and is denied, or it does not resolve.
        assert!(err == DOMAIN_NOT_PERMITTED || err == UNKNOWN_HOST);
    }
}
