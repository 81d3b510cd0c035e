//! Per-host policy learned from responses: HSTS and HTTP credentials.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HstsPolicy {
    expires: i64,
    include_subdomains: bool,
}

/// HSTS policies and stored credentials.
#[derive(Debug, Default)]
pub struct UrlDb {
    hsts: HashMap<String, HstsPolicy>,
    auth: HashMap<(String, String), String>,
}

impl UrlDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the policy from a `Strict-Transport-Security` header seen on `url`.
    ///
    /// `max-age=0` removes the policy. IP-literal hosts are ignored.
    pub fn set_hsts_policy(&mut self, url: &Url, header: &str, now: i64) {
        let Some(Host::Domain(host)) = url.host() else {
            return;
        };
        let host = host.to_ascii_lowercase();

        let mut max_age = None;
        let mut include_subdomains = false;
        for directive in header.split(';') {
            let directive = directive.trim();
            if directive.eq_ignore_ascii_case("includeSubDomains") {
                include_subdomains = true;
            } else if let Some((name, value)) = directive.split_once('=')
                && name.trim().eq_ignore_ascii_case("max-age")
            {
                max_age = value.trim().trim_matches('"').parse::<i64>().ok();
            }
        }

        let Some(max_age) = max_age else {
            tracing::debug!(host = %host, header, "ignoring HSTS header without max-age");
            return;
        };

        if max_age == 0 {
            self.hsts.remove(&host);
        } else {
            self.hsts.insert(host, HstsPolicy { expires: now.saturating_add(max_age), include_subdomains });
        }
    }

    /// Whether `url`'s host is under an unexpired HSTS policy.
    pub fn hsts_enabled(&self, url: &Url, now: i64) -> bool {
        let Some(Host::Domain(host)) = url.host() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        if let Some(policy) = self.hsts.get(&host)
            && policy.expires > now
        {
            return true;
        }

        let mut rest = host.as_str();
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(policy) = self.hsts.get(parent)
                && policy.include_subdomains
                && policy.expires > now
            {
                return true;
            }
            rest = parent;
        }
        false
    }

    /// Upgrade an `http:` URL to `https:` if its host is under policy.
    ///
    /// Returns the URL to fetch and whether HSTS forced it.
    pub fn transform(&self, url: &Url, now: i64) -> (Url, bool) {
        if url.scheme() != "http" || !self.hsts_enabled(url, now) {
            return (url.clone(), false);
        }
        let mut upgraded = url.clone();
        if upgraded.set_scheme("https").is_err() {
            return (url.clone(), false);
        }
        if upgraded.port() == Some(80) {
            let _ = upgraded.set_port(None);
        }
        (upgraded, true)
    }

    /// Store `user:password` credentials for a realm on `url`'s host.
    pub fn set_auth(&mut self, url: &Url, realm: &str, credentials: &str) {
        self.auth.insert((host_key(url), realm.to_string()), credentials.to_string());
    }

    /// Credentials for a realm on `url`'s host.
    pub fn auth(&self, url: &Url, realm: &str) -> Option<&str> {
        self.auth.get(&(host_key(url), realm.to_string())).map(String::as_str)
    }

    /// `Authorization` header line for a realm, if credentials are stored.
    pub fn authorization_header(&self, url: &Url, realm: &str) -> Option<String> {
        self.auth(url, realm).map(|creds| format!("Authorization: Basic {}", STANDARD.encode(creds)))
    }
}

fn host_key(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    }
}
