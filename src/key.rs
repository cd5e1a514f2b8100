//! Cache keys.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

/// An opaque, cheaply clonable byte-string key (a normalized request URI).
///
/// Hashing and equality go through the byte slice, so maps keyed by `Key`
/// can be queried with a plain `&[u8]`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Key(Bytes);

impl Key {
    /// Creates a key from anything convertible into [`Bytes`].
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Key(bytes.into())
    }

    /// Creates a key from a static string without copying.
    pub const fn from_static(s: &'static str) -> Self {
        Key(Bytes::from_static(s.as_bytes()))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the remainder of the key after `prefix`, if it starts with it.
    pub fn strip_prefix(&self, prefix: &[u8]) -> Option<&[u8]> {
        self.0.strip_prefix(prefix)
    }

    /// Lossy UTF-8 view, for logs and reports.
    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl Borrow<[u8]> for Key {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(Bytes::from(s))
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key(Bytes::from(b))
    }
}

impl From<Bytes> for Key {
    fn from(b: Bytes) -> Self {
        Key(b)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.to_str_lossy())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.to_str_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    #[test]
    fn test_lookup_by_slice() {
        let mut map = HashMap::new();
        map.insert(Key::from("/static/a.png"), 1);
        assert_eq!(map.get(b"/static/a.png".as_slice()), Some(&1));
        assert_eq!(map.get(b"/static/b.png".as_slice()), None);
    }

    #[test]
    fn test_strip_prefix() {
        let key = Key::from_static("/zoom/cat.jpg?w=10");
        assert_eq!(key.strip_prefix(b"/zoom/"), Some(&b"cat.jpg?w=10"[..]));
        assert_eq!(key.strip_prefix(b"/static/"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Key::from("/status").to_string(), "/status");
        assert_eq!(format!("{:?}", Key::from("/x")), "Key(\"/x\")");
    }
}
