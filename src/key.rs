use std::{
    fmt,
    ops::{Bound, RangeBounds},
};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Stamp ordering competing writes. Larger is newer.
pub type VersionId = u32;

/// Position of a decided value in the replicated log.
pub type Position = u64;

#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, From, Serialize, Deserialize,
)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Key {
    fn from(value: [u8; N]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?
        }
        write!(f, ")")
    }
}

/// A contiguous interval of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Bound<Key>,
    pub end: Bound<Key>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self {
            begin: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// `[begin, end)`
    pub fn closed_open(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: Bound::Included(begin.into()),
            end: Bound::Excluded(end.into()),
        }
    }

    /// `(begin, end)`
    pub fn open(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: Bound::Excluded(begin.into()),
            end: Bound::Excluded(end.into()),
        }
    }

    /// `[begin, end]`
    pub fn closed(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: Bound::Included(begin.into()),
            end: Bound::Included(end.into()),
        }
    }

    /// The key iteration starts from. Unbounded ranges start at the empty key,
    /// which orders before every other key.
    pub fn begin_key(&self) -> Key {
        match &self.begin {
            Bound::Included(key) | Bound::Excluded(key) => key.clone(),
            Bound::Unbounded => Key::default(),
        }
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        RangeBounds::contains(self, key)
    }

    /// Whether `key` lies after the upper bound, i.e. no later key can be in
    /// range either.
    pub fn is_past_end(&self, key: &Key) -> bool {
        match &self.end {
            Bound::Included(end) => key > end,
            Bound::Excluded(end) => key >= end,
            Bound::Unbounded => false,
        }
    }
}

impl RangeBounds<Key> for KeyRange {
    fn start_bound(&self) -> Bound<&Key> {
        self.begin.as_ref()
    }

    fn end_bound(&self) -> Bound<&Key> {
        self.end.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        let range = KeyRange::closed_open([0x00u8], [0xffu8]);
        assert!(range.contains_key(&Key::from([0x00u8])));
        assert!(range.contains_key(&Key::from([0x10u8])));
        assert!(!range.contains_key(&Key::from([0xffu8])));
        assert!(range.is_past_end(&Key::from([0xffu8])));

        let range = KeyRange::open("a", "c");
        assert!(!range.contains_key(&"a".into()));
        assert!(range.contains_key(&"b".into()));
        assert!(!range.is_past_end(&"a".into()));
        assert_eq!(range.begin_key(), Key::from("a"));

        let range = KeyRange::full();
        assert!(range.contains_key(&Key::default()));
        assert!(!range.is_past_end(&Key::from([0xffu8; 8])));
    }
}
