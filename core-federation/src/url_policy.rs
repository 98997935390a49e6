//! Directory URL validation and classification
//!
//! Two URLs are considered the same directory when they differ only in
//! surrounding whitespace, host case, a trailing dot on the host, a default
//! port, a trailing slash or a fragment. Every comparison in the engine goes through [`canonical_url`].

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::{FederationError, Result};

/// Canonical string form of an absolute http(s) URL, or `None` if it is not one
pub fn canonical_url(raw: &str) -> Option<String> {
    let url = parse_http_url(raw).ok()?;
    Some(canonical_from(&url))
}

/// Lower-cased host without the trailing dot of a fully-qualified name
fn host_key(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn canonical_from(url: &Url) -> String {
    let mut out = format!("{}://{}", url.scheme(), host_key(url));
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Whether two strings denote the same directory
pub fn same_url(a: &str, b: &str) -> bool {
    match (canonical_url(a), canonical_url(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}

fn parse_http_url(raw: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(url)
}

/// The identity of this instance, used to refuse self-sync
#[derive(Debug, Clone)]
pub struct OwnInstance {
    base: Url,
    directory: String,
}

impl OwnInstance {
    pub fn new(base_url: &str, directory_url: &str) -> Result<Self> {
        let base = parse_http_url(base_url).map_err(|reason| {
            FederationError::Config(format!("Invalid base URL '{}': {}", base_url, reason))
        })?;
        let directory = canonical_url(directory_url).ok_or_else(|| {
            FederationError::Config(format!("Invalid directory URL '{}'", directory_url))
        })?;
        Ok(Self { base, directory })
    }

    /// Whether `url` points at this instance: its directory, its base URL, or
    /// anything below the base URL on the same origin
    pub fn is_self(&self, url: &Url) -> bool {
        if canonical_from(url) == self.directory {
            return true;
        }

        let same_origin = url.scheme() == self.base.scheme()
            && host_key(url) == host_key(&self.base)
            && url.port_or_known_default() == self.base.port_or_known_default();
        if !same_origin {
            return false;
        }

        let base_path = self.base.path().trim_end_matches('/');
        let path = url.path().trim_end_matches('/');
        base_path.is_empty() || path == base_path || path.starts_with(&format!("{}/", base_path))
    }

    pub fn is_self_str(&self, raw: &str) -> bool {
        parse_http_url(raw).map_or(false, |url| self.is_self(&url))
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }
}

/// Validate a directory URL a caller asked us to sync with
///
/// # Errors
///
/// - `InvalidDirectoryUrl` for empty, relative, non-http(s) or hostless URLs
/// - `SelfReference` when the URL resolves to this instance
pub fn validate_directory_url(raw: &str, own: &OwnInstance) -> Result<Url> {
    if raw.trim().is_empty() {
        return Err(FederationError::InvalidDirectoryUrl {
            url: raw.to_string(),
            reason: "directory URL is empty".to_string(),
        });
    }

    let url = parse_http_url(raw).map_err(|reason| FederationError::InvalidDirectoryUrl {
        url: raw.to_string(),
        reason,
    })?;

    if own.is_self(&url) {
        return Err(FederationError::SelfReference(raw.trim().to_string()));
    }

    Ok(url)
}

/// Whether a URL targets a host that peers on the internet cannot reach
///
/// Covers `localhost`, `.local`/`.localhost` names, loopback, private,
/// link-local, unspecified and IPv6 unique-local addresses. Strings that are
/// not absolute http(s) URLs are treated as local.
pub fn is_local_url(raw: &str) -> bool {
    let Ok(url) = parse_http_url(raw) else {
        return true;
    };

    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
        }
        Some(Host::Ipv4(ip)) => is_local_ipv4(ip),
        Some(Host::Ipv6(ip)) => is_local_ipv6(ip),
        None => true,
    }
}

fn is_local_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_local_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_local_ipv4(mapped);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}
