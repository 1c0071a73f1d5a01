//! Registry host configuration
//!
//! A namespace maps to an ordered chain of endpoints; earlier entries are
//! preferred and later ones are fallbacks. Each endpoint declares which
//! operations it supports, and may carry its own headers, repository
//! rewrites, authorizer and HTTP client.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use bitflags::bitflags;
use reqwest::header::HeaderMap;

use crate::auth::Authorizer;
use crate::errors::Result;
use crate::reference::default_host;
use crate::transport::HttpFallback;

bitflags! {
    /// Capabilities advertised by a registry host
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCapabilities: u8 {
        /// Pull content by digest
        const PULL = 1 << 0;
        /// Resolve tags to digests
        const RESOLVE = 1 << 1;
        /// Push content
        const PUSH = 1 << 2;
    }
}

/// Configuration for a single registry endpoint
#[derive(Clone)]
pub struct RegistryHost {
    /// Authority, e.g. `registry-1.docker.io` or `localhost:5000`
    pub host: String,
    /// `https` or `http`
    pub scheme: String,
    /// URL prefix for the distribution API, typically `/v2`
    pub path: String,
    /// Operations this endpoint supports
    pub capabilities: HostCapabilities,
    /// Headers added to every request against this endpoint
    pub header: HeaderMap,
    /// Ordered `(pattern, replacement)` regex pairs applied to the
    /// repository before building request paths
    pub rewrites: Vec<(String, String)>,
    /// Authorizer answering 401 challenges from this endpoint
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// HTTP client override; the resolver's shared client is used when unset
    pub client: Option<HttpFallback>,
}

impl RegistryHost {
    /// A host serving the distribution API over https at `/v2` with pull
    /// and resolve capabilities
    pub fn new(host: impl Into<String>) -> Self {
        RegistryHost {
            host: host.into(),
            scheme: "https".to_string(),
            path: "/v2".to_string(),
            capabilities: HostCapabilities::PULL | HostCapabilities::RESOLVE,
            header: HeaderMap::new(),
            rewrites: Vec::new(),
            authorizer: None,
            client: None,
        }
    }

    /// True when this host serves content on behalf of a foreign namespace
    /// and requests must carry the `ns=` query parameter
    pub(crate) fn is_proxy(&self, refhost: &str) -> bool {
        if refhost != self.host {
            return !(refhost == "docker.io" && self.host == "registry-1.docker.io");
        }
        false
    }
}

impl fmt::Debug for RegistryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHost")
            .field("host", &self.host)
            .field("scheme", &self.scheme)
            .field("path", &self.path)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Maps a namespace to its ordered endpoint chain. Implemented for plain
/// closures, so a host function can be passed directly.
pub trait RegistryHosts: Send + Sync {
    /// Returns the ordered endpoint chain for a namespace
    fn hosts(&self, namespace: &str) -> Result<Vec<RegistryHost>>;
}

impl<F> RegistryHosts for F
where
    F: Fn(&str) -> Result<Vec<RegistryHost>> + Send + Sync,
{
    fn hosts(&self, namespace: &str) -> Result<Vec<RegistryHost>> {
        self(namespace)
    }
}

/// Returns a host function serving each namespace from its own default
/// endpoint with full capabilities. `docker.io` routes through
/// `registry-1.docker.io`; loopback hosts are served over plain http when
/// `localhost_http` is set.
pub fn default_registry_hosts(
    authorizer: Option<Arc<dyn Authorizer>>,
    localhost_http: bool,
) -> impl RegistryHosts {
    move |namespace: &str| {
        let host = default_host(namespace);
        let mut config = RegistryHost::new(host);
        config.capabilities |= HostCapabilities::PUSH;
        if localhost_http && is_localhost(host) {
            config.scheme = "http".to_string();
        }
        config.authorizer = authorizer.clone();
        Ok(vec![config])
    }
}

/// Checks if the registry host is local
pub fn is_localhost(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    // bare IPv6 addresses contain colons but no port
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    };
    let name = name.trim_start_matches('[').trim_end_matches(']');

    if name == "localhost" {
        return true;
    }

    name.parse::<IpAddr>().map_or(false, |ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_detection() {
        let host = RegistryHost::new("mirror.example.com");
        assert!(host.is_proxy("docker.io"));
        assert!(!host.is_proxy("mirror.example.com"));

        // the docker.io default endpoint is not a proxy for docker.io
        let host = RegistryHost::new("registry-1.docker.io");
        assert!(!host.is_proxy("docker.io"));
        assert!(host.is_proxy("quay.io"));
    }

    #[test]
    fn capability_subsets() {
        let caps = HostCapabilities::PULL | HostCapabilities::RESOLVE;
        assert!(caps.contains(HostCapabilities::PULL));
        assert!(!caps.contains(HostCapabilities::PULL | HostCapabilities::PUSH));
    }

    #[test]
    fn localhost_detection() {
        assert!(is_localhost("localhost"));
        assert!(is_localhost("localhost:5000"));
        assert!(is_localhost("127.0.0.1:5000"));
        assert!(is_localhost("::1"));
        assert!(!is_localhost("example.com"));
        assert!(!is_localhost("10.0.0.1"));
    }

    #[test]
    fn default_hosts_translate_docker_io() {
        let hosts = default_registry_hosts(None, true);
        let chain = hosts.hosts("docker.io").unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].host, "registry-1.docker.io");
        assert_eq!(chain[0].scheme, "https");

        let chain = hosts.hosts("localhost:5000").unwrap();
        assert_eq!(chain[0].scheme, "http");
    }
}
