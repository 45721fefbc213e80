//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP headers are order-preserving and case-insensitive per [RFC 9110 §5].

use std::fmt;

/// Separator used when a multi-value header is collapsed onto a single line.
const VALUE_SEPARATOR: &str = ", ";

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order and allows multiple values per header name.
/// [`append`](Self::append) adds another value to a name, [`set`](Self::set)
/// replaces every value held by the name, and
/// [`remove_value`](Self::remove_value) drops a single value from a list.
///
/// # Examples
///
/// ```
/// use routeway::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.set("Content-Type", "text/html; charset=utf-8");
/// headers.append("Vary", "Origin");
/// headers.append("vary", "Accept");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// assert_eq!(headers.joined("VARY").as_deref(), Some("Origin, Accept"));
///
/// headers.set("Vary", "Cookie");
/// let all: Vec<_> = headers.get_all("vary").collect();
/// assert_eq!(all, vec!["Cookie"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
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

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values of `name` joined onto one line, or `None` if absent.
    pub fn joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(VALUE_SEPARATOR))
        }
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Removes the first entry of `name` whose value equals `value`.
    ///
    /// The name disappears from the map once its last value is removed.
    pub fn remove_value(&mut self, name: &str, value: &str) -> bool {
        match self
            .inner
            .iter()
            .position(|(k, v)| k.eq_ignore_ascii_case(name) && v == value)
        {
            Some(index) => {
                self.inner.remove(index);
                true
            }
            None => false,
        }
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

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns each distinct name once, spelled as first inserted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (k, _) in &self.inner {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(k)) {
                names.push(k);
            }
        }
        names
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
        h.append("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn set_replaces_every_value() {
        let mut h = Headers::new();
        h.append("X-Foo", "a");
        h.append("x-foo", "b");
        h.set("X-FOO", "c");
        assert_eq!(h.get_all("x-foo").collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn remove_single_value_from_list() {
        let mut h = Headers::new();
        h.append("Allow", "GET");
        h.append("Allow", "POST");
        assert!(h.remove_value("allow", "GET"));
        assert_eq!(h.joined("allow").as_deref(), Some("POST"));
        assert!(h.remove_value("allow", "POST"));
        assert!(!h.contains("allow"));
        assert!(!h.remove_value("allow", "POST"));
    }

    #[test]
    fn remove_whole_name() {
        let mut h = Headers::new();
        h.append("X-Foo", "bar");
        h.append("X-Foo", "baz");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }

    #[test]
    fn names_are_unique_and_ordered() {
        let mut h = Headers::new();
        h.append("B", "1");
        h.append("A", "2");
        h.append("b", "3");
        assert_eq!(h.names(), vec!["B", "A"]);
    }
}
