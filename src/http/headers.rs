//! HTTP header map with case-insensitive name lookup.
//!
//! Field names are case-insensitive per [RFC 9110 §5.1]. Setting a field that
//! already exists replaces it, except for fields whose values form a
//! comma-separated list; those accumulate every value received.
//!
//! [RFC 9110 §5.1]: https://www.rfc-editor.org/rfc/rfc9110#section-5.1

use std::fmt;

/// Fields that may legitimately appear several times and are combined rather
/// than replaced.
const COMBINABLE: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "allow",
    "cache-control",
    "connection",
    "cookie",
    "pragma",
    "set-cookie",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "vary",
    "via",
    "warning",
];

/// Returns `true` if repeated `name` fields accumulate instead of replacing.
pub fn is_combinable(name: &str) -> bool {
    COMBINABLE.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// A case-insensitive HTTP header map.
///
/// Iteration order is unspecified for consumers; the wire order produced by
/// [`Display`](fmt::Display) is insertion order.
///
/// # Examples
///
/// ```
/// use keel::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html");
/// headers.insert("content-type", "text/plain");
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
/// assert_eq!(headers.len(), 1);
///
/// headers.append("Accept-Encoding", "gzip");
/// headers.append("Accept-Encoding", "br");
/// let all: Vec<_> = headers.get_all("accept-encoding").collect();
/// assert_eq!(all, vec!["gzip", "br"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Sets a header, replacing every existing value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Adds a value without touching existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Records a field as received on the wire: combinable fields accumulate,
    /// anything else keeps the last value.
    pub fn add_received(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if is_combinable(&name) {
            self.append(name, value);
        } else {
            self.insert(name, value);
        }
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterates the comma-separated list elements of every `name` field.
    pub fn list<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Returns `true` if any element of the `name` list equals `token`
    /// (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.list(name).any(|v| v.eq_ignore_ascii_case(token))
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn insert_replaces() {
        let mut h = Headers::new();
        h.insert("Host", "a");
        h.insert("HOST", "b");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("host"), Some("b"));
    }

    #[test]
    fn received_fields_follow_combinability() {
        let mut h = Headers::new();
        h.add_received("Content-Length", "1");
        h.add_received("content-length", "2");
        h.add_received("Accept-Encoding", "gzip");
        h.add_received("accept-encoding", "br, zstd");
        assert_eq!(h.get("content-length"), Some("2"));
        let list: Vec<_> = h.list("accept-encoding").collect();
        assert_eq!(list, vec!["gzip", "br", "zstd"]);
    }

    #[test]
    fn tokens() {
        let mut h = Headers::new();
        h.insert("Connection", "keep-alive, Upgrade");
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.append("X-Foo", "bar");
        h.append("X-Foo", "baz");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }
}
