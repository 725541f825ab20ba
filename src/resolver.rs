//! Resolve resource references against the page or stylesheet they were
//! found in, and classify them by kind.

use crate::error::PreserveError;
use crate::models::ResourceKind;
use url::Url;

/// Schemes whose references point at nothing worth fetching.
const INLINE_SCHEMES: [&str; 4] = ["data:", "blob:", "javascript:", "about:"];

/// Resolve `reference` against `base` into an absolute http(s) URL.
///
/// Relative references follow standard URL-combination rules: scheme and
/// host come from `base`, the path is resolved against the base path.
///
/// # Errors
///
/// [`PreserveError::InvalidReference`] when the reference is empty or does
/// not resolve to an http(s) URL against `base`.
pub fn resolve_reference(base: &str, reference: &str) -> Result<String, PreserveError> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(PreserveError::invalid_reference(reference, "empty reference"));
    }
    let base = Url::parse(base)
        .map_err(|e| PreserveError::invalid_reference(base, format!("invalid base URL: {e}")))?;
    let resolved = base
        .join(reference)
        .map_err(|e| PreserveError::invalid_reference(reference, e.to_string()))?;
    match resolved.scheme() {
        "http" | "https" => Ok(resolved.to_string()),
        other => Err(PreserveError::invalid_reference(
            reference,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

/// References that are skipped without being treated as errors: inline
/// payloads and fragment-only links (`url(#gradient)` in SVG-in-CSS).
pub fn is_skippable(reference: &str) -> bool {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') {
        return true;
    }
    let lower = reference.to_ascii_lowercase();
    INLINE_SCHEMES.iter().any(|scheme| lower.starts_with(scheme))
}

/// Infer a resource kind from the extension of the URL path.
pub fn classify_by_extension(url: &str) -> ResourceKind {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "woff" | "woff2" | "ttf" | "otf" | "eot" => ResourceKind::Font,
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "avif" | "ico" | "bmp" => {
            ResourceKind::Image
        }
        "css" => ResourceKind::Style,
        _ => ResourceKind::Other,
    }
}

/// Infer a resource kind from a declared content type, if it says anything useful.
pub fn classify_by_content_type(content_type: &str) -> Option<ResourceKind> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime == "text/css" {
        Some(ResourceKind::Style)
    } else if mime.starts_with("image/") {
        Some(ResourceKind::Image)
    } else if mime.starts_with("font/") || mime.contains("font-") {
        Some(ResourceKind::Font)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_references() {
        let base = "https://news.example.com/2017/11/story.html";
        assert_eq!(
            resolve_reference(base, "img/a.png").unwrap(),
            "https://news.example.com/2017/11/img/a.png"
        );
        assert_eq!(
            resolve_reference(base, "/static/site.css").unwrap(),
            "https://news.example.com/static/site.css"
        );
        assert_eq!(
            resolve_reference(base, "//cdn.example.com/f.woff2").unwrap(),
            "https://cdn.example.com/f.woff2"
        );
        assert_eq!(
            resolve_reference(base, "../fonts/x.ttf?v=2").unwrap(),
            "https://news.example.com/2017/fonts/x.ttf?v=2"
        );
    }

    #[test]
    fn test_resolve_absolute_reference_is_kept() {
        assert_eq!(
            resolve_reference("https://a.com/", "http://b.com/x.png").unwrap(),
            "http://b.com/x.png"
        );
    }

    #[test]
    fn test_invalid_references() {
        let base = "https://a.com/page";
        assert!(matches!(
            resolve_reference(base, "   "),
            Err(PreserveError::InvalidReference { .. })
        ));
        assert!(matches!(
            resolve_reference(base, "http://[::1"),
            Err(PreserveError::InvalidReference { .. })
        ));
        assert!(matches!(
            resolve_reference(base, "mailto:someone@a.com"),
            Err(PreserveError::InvalidReference { .. })
        ));
    }

    #[test]
    fn test_skippable_references() {
        assert!(is_skippable("data:image/png;base64,AAAA"));
        assert!(is_skippable("#grad"));
        assert!(is_skippable("JavaScript:void(0)"));
        assert!(!is_skippable("/a.png"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify_by_extension("https://a.com/f/x.WOFF2?v=1"), ResourceKind::Font);
        assert_eq!(classify_by_extension("https://a.com/logo.svg#icon"), ResourceKind::Image);
        assert_eq!(classify_by_extension("https://a.com/site.css"), ResourceKind::Style);
        assert_eq!(classify_by_extension("https://a.com/track"), ResourceKind::Other);
        assert_eq!(classify_by_content_type("text/css; charset=utf-8"), Some(ResourceKind::Style));
        assert_eq!(classify_by_content_type("font/woff2"), Some(ResourceKind::Font));
        assert_eq!(classify_by_content_type("text/html"), None);
    }
}
