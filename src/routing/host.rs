//! Host to tunnel id resolution.
//!
//! # Responsibilities
//! - Strip the port and normalize case
//! - Strip a configured base domain, leaving the tunnel id
//! - Without a matching base domain, take the labels left of the last two
//!
//! # Design Decisions
//! - IP literals and single or two label hosts never carry a tunnel id
//! - Empty prefix means the request is for the control plane

use std::net::IpAddr;

/// Resolves tunnel ids from request hosts.
#[derive(Debug, Clone, Default)]
pub struct SubdomainResolver {
    domains: Vec<String>,
}

impl SubdomainResolver {
    /// Create a resolver for the given base domains (e.g. `example.com`).
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// The tunnel id addressed by `host`, if any.
    pub fn client_id(&self, host: &str) -> Option<String> {
        let hostname = strip_port(host.trim())?.trim_end_matches('.').to_ascii_lowercase();
        if hostname.is_empty() || hostname.parse::<IpAddr>().is_ok() {
            return None;
        }

        for domain in &self.domains {
            if hostname == *domain {
                return None;
            }
            if let Some(prefix) = hostname.strip_suffix(domain.as_str()).and_then(|p| p.strip_suffix('.')) {
                return (!prefix.is_empty()).then(|| prefix.to_string());
            }
        }

        let labels: Vec<&str> = hostname.split('.').collect();
        if labels.len() <= 2 || labels.iter().any(|label| label.is_empty()) {
            return None;
        }
        Some(labels[..labels.len() - 2].join("."))
    }
}

/// Host without its port. `None` for bracketed IPv6 literals.
fn strip_port(host: &str) -> Option<&str> {
    if host.starts_with('[') {
        return None;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => Some(name),
        Some(_) => None,
        None => Some(host),
    }
}
