//! URL canonicalization for consistent cache keys and origin checks.

use url::Url;

/// Error type for URL canonicalization failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Canonicalize an absolute URL string.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Reject anything but http/https
/// 3. Lowercase the host
/// 4. Remove fragment (#...)
/// 5. Keep query string intact (do not reorder)
pub fn canonicalize(input: &str) -> Result<Url, UrlError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let parsed = Url::parse(trimmed).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    normalize(parsed)
}

/// Resolve a manifest entry or page-relative path against the app origin.
///
/// Absolute URLs are accepted as-is (after canonicalization), so the manifest
/// may list cross-origin resources.
pub fn resolve(origin: &Url, input: &str) -> Result<Url, UrlError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let joined = origin.join(trimmed).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    normalize(joined)
}

/// Whether two URLs share scheme, host and port.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

fn normalize(mut parsed: Url) -> Result<Url, UrlError> {
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    if let Some(host) = parsed.host_str() {
        let host = host.to_lowercase();
        parsed
            .set_host(Some(&host))
            .map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    }

    parsed.set_fragment(None);

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://taxi.example.com").unwrap()
    }

    #[test]
    fn test_canonicalize_lowercase_host() {
        let url = canonicalize("https://TAXI.example.com/oblicz").unwrap();
        assert_eq!(url.host_str(), Some("taxi.example.com"));
    }

    #[test]
    fn test_canonicalize_remove_fragment_keep_query() {
        let url = canonicalize("https://taxi.example.com/cele?dzien=1#top").unwrap();
        assert_eq!(url.fragment(), None);
        assert_eq!(url.query(), Some("dzien=1"));
    }

    #[test]
    fn test_canonicalize_trim_whitespace() {
        let url = canonicalize("  https://taxi.example.com  ").unwrap();
        assert_eq!(url.as_str(), "https://taxi.example.com/");
    }

    #[test]
    fn test_canonicalize_unsupported_scheme() {
        let result = canonicalize("file:///etc/passwd");
        assert!(matches!(result, Err(UrlError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_canonicalize_empty() {
        assert!(matches!(canonicalize("   "), Err(UrlError::Empty)));
    }

    #[test]
    fn test_resolve_relative() {
        let url = resolve(&origin(), "/static/style.css").unwrap();
        assert_eq!(url.as_str(), "https://taxi.example.com/static/style.css");
    }

    #[test]
    fn test_resolve_absolute_cross_origin() {
        let url = resolve(&origin(), "https://fonts.googleapis.com/css?family=Roboto").unwrap();
        assert_eq!(url.host_str(), Some("fonts.googleapis.com"));
    }

    #[test]
    fn test_same_origin() {
        let page = resolve(&origin(), "/oblicz").unwrap();
        let font = canonicalize("https://fonts.gstatic.com/s/roboto.woff2").unwrap();
        let other_port = canonicalize("https://taxi.example.com:8443/").unwrap();
        assert!(same_origin(&origin(), &page));
        assert!(!same_origin(&origin(), &font));
        assert!(!same_origin(&origin(), &other_port));
    }
}
