//! Entry key normalization.
//!
//! Assets may be referred to by a relative path, an absolute path, or a
//! fully-qualified URL. All three resolve to one key: the path plus query of
//! the URL resolved against the origin base. Cross-origin URLs have no key.

use reqwest::Url;

/// Resolves `raw` against `base` and returns its entry key.
///
/// Returns `None` for unparsable input or a different origin.
#[must_use]
pub fn entry_key(base: &Url, raw: &str) -> Option<String> {
    let url = base.join(raw).ok()?;
    (url.origin() == base.origin()).then(|| key_of(&url))
}

/// Path plus query of a URL, without the fragment.
#[must_use]
pub fn key_of(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

/// Strips the query from a key.
#[must_use]
pub fn path_only(key: &str) -> &str {
    key.split_once('?').map_or(key, |(path, _)| path)
}
