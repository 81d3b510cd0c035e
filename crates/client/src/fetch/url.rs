//! Normalisation of user-typed addresses before they reach the cache.

use url::Url;

/// Error type for address normalisation failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<UrlError> for rescache_core::Error {
    fn from(err: UrlError) -> Self {
        rescache_core::Error::InvalidUrl(err.to_string())
    }
}

/// Schemes the bundled transports can fetch.
const FETCHABLE_SCHEMES: &[&str] = &["http", "https", "data"];

/// Turn a typed address into a URL the cache can retrieve.
///
/// 1. Trim leading/trailing whitespace
/// 2. Default the scheme to `https://` when none is given
/// 3. Lowercase the host
/// 4. Drop the fragment, which never reaches a transport
///
/// `data:` URLs are accepted as typed.
pub fn canonicalize(input: &str) -> Result<Url, UrlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let has_scheme = trimmed.contains("://") || trimmed.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("data:"));
    let url_str = if has_scheme { trimmed.to_string() } else { format!("https://{trimmed}") };

    let mut parsed = Url::parse(&url_str).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    if !FETCHABLE_SCHEMES.contains(&parsed.scheme()) {
        return Err(UrlError::UnsupportedScheme(parsed.scheme().to_string()));
    }
    if parsed.scheme() == "data" {
        return Ok(parsed);
    }

    if let Some(host) = parsed.host_str().map(str::to_lowercase) {
        parsed.set_host(Some(&host)).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    }
    parsed.set_fragment(None);

    Ok(parsed)
}
