//! Produce the "hosted" version of a text document.
//!
//! Every occurrence of a mapped URL is replaced by its hosted URL in a
//! single pass over the text. Replacement output is never rescanned, and
//! content the map does not address is left byte for byte.

use crate::error::PreserveError;
use crate::models::{DiscoveredResource, StoredResource};
use regex::{Captures, RegexBuilder};
use std::collections::HashMap;
use tracing::debug;

/// Compiled pattern size limit; a page can reference a few thousand URLs.
const PATTERN_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Replace every mapped URL in `content` with its hosted counterpart.
///
/// All keys are combined into one alternation ordered longest first, so
/// when one key is a prefix of another the longer one wins at a given
/// position (`http://x.com/a/b` is never turned into `<hosted a>/b`).
///
/// Absolute `http(s)://` keys are replaced wherever they occur. Any other
/// key (a relative spelling such as `logo.png` or `../fonts/a.woff`) is
/// only replaced where it is a whole reference: preceded by the start of
/// the text, a quote, `(`, `=`, `,` or whitespace, and followed by the end
/// of the text, a quote, `)`, `>`, `,` or whitespace. `logo.png` inside
/// `https://other.org/press/logo.png` is left alone.
///
/// # Arguments
///
/// * `content` - Page or stylesheet text
/// * `mapping` - Original spelling to hosted URL
///
/// # Returns
///
/// The rewritten text; `content` unchanged when the mapping is empty or
/// nothing matches.
///
/// # Errors
///
/// [`PreserveError::RewriteError`] when the combined pattern cannot be
/// compiled.
pub fn rewrite(content: &str, mapping: &HashMap<String, String>) -> Result<String, PreserveError> {
    let mut keys: Vec<&str> = mapping
        .keys()
        .map(String::as_str)
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        return Ok(content.to_string());
    }
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let pattern = keys
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    let rx = RegexBuilder::new(&pattern)
        .size_limit(PATTERN_SIZE_LIMIT)
        .dfa_size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map_err(|e| PreserveError::RewriteError(e.to_string()))?;

    let mut replaced = 0usize;
    let mut skipped = 0usize;
    let out = rx.replace_all(content, |caps: &Captures<'_>| {
        // Group 0 is always present.
        let Some(m) = caps.get(0) else {
            return String::new();
        };
        let key = m.as_str();
        match mapping.get(key) {
            Some(hosted) if is_absolute(key) || is_whole_reference(content, m.start(), m.end()) => {
                replaced += 1;
                hosted.clone()
            }
            _ => {
                skipped += 1;
                key.to_string()
            }
        }
    });
    debug!(keys = keys.len(), replaced, skipped, "Rewrote content");
    Ok(out.into_owned())
}

fn is_absolute(key: &str) -> bool {
    let lower = key.get(..8).unwrap_or(key).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Whether `content[start..end]` is delimited like a complete reference.
fn is_whole_reference(content: &str, start: usize, end: usize) -> bool {
    let before = content[..start].chars().next_back();
    let after = content[end..].chars().next();
    let opens = before.is_none_or(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '(' | '=' | ','));
    let closes = after.is_none_or(|c| c.is_whitespace() || matches!(c, '"' | '\'' | ')' | '>' | ','));
    opens && closes
}

/// Byte-level wrapper: UTF-8 content is rewritten, anything else is
/// returned untouched rather than mangled by a lossy decode.
pub fn rewrite_bytes(content: &[u8], mapping: &HashMap<String, String>) -> Result<Vec<u8>, PreserveError> {
    match std::str::from_utf8(content) {
        Ok(text) => Ok(rewrite(text, mapping)?.into_bytes()),
        Err(_) => Ok(content.to_vec()),
    }
}

/// Map each way a stored resource may be spelled in a document to its
/// hosted URL: the absolute URL, every literal reference and, for spellings
/// carrying a query, the `&amp;`-escaped form found in HTML attributes.
pub fn hosted_mapping<'a>(
    entries: impl IntoIterator<Item = (&'a DiscoveredResource, &'a StoredResource)>,
) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for (found, stored) in entries {
        let spellings = std::iter::once(found.url.as_str()).chain(found.references.iter().map(String::as_str));
        for key in spellings {
            if key.is_empty() {
                continue;
            }
            mapping.insert(key.to_string(), stored.hosted_url.clone());
            if key.contains('&') {
                mapping.insert(key.replace('&', "&amp;"), stored.hosted_url.clone());
            }
        }
    }
    mapping
}
