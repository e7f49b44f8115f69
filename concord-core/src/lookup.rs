//!
//!
//! Lookup filters understood by the view store
//!
//!

use std::collections::BTreeSet;

use crate::key::Key;

/// A filter over the keys of a single view
///
/// Every lookup resolves to entries in key order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Exactly this key
    Eq(Key),

    /// Any key in the set
    In(BTreeSet<Key>),

    /// Every key within the inclusive bounds
    Between(Key, Key),

    /// Every key starting with the given elements
    Prefix(Key),

    /// The whole view
    All,
}

impl Lookup {
    pub fn eq(key: impl Into<Key>) -> Self {
        Lookup::Eq(key.into())
    }

    pub fn any_of(keys: impl IntoIterator<Item = Key>) -> Self {
        Lookup::In(keys.into_iter().collect())
    }

    pub fn between(low: impl Into<Key>, high: impl Into<Key>) -> Self {
        Lookup::Between(low.into(), high.into())
    }

    pub fn prefix(prefix: impl Into<Key>) -> Self {
        Lookup::Prefix(prefix.into())
    }

    pub fn matches(&self, key: &Key) -> bool {
        match self {
            Lookup::Eq(k) => k == key,
            Lookup::In(keys) => keys.contains(key),
            Lookup::Between(low, high) => low <= key && key <= high,
            Lookup::Prefix(prefix) => key.starts_with(prefix),
            Lookup::All => true,
        }
    }

    /// True when no key could ever match, e.g. an empty `In` set or
    /// inverted bounds
    pub fn is_empty(&self) -> bool {
        match self {
            Lookup::In(keys) => keys.is_empty(),
            Lookup::Between(low, high) => low > high,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;

    #[test]
    fn between_is_inclusive() {
        let lookup = Lookup::between(key![1], key![3]);
        assert!(lookup.matches(&key![1]));
        assert!(lookup.matches(&key![3]));
        assert!(!lookup.matches(&key![4]));

        // [3, "x"] sorts after [3]
        assert!(!lookup.matches(&key![3, "x"]));
    }

    #[test]
    fn empty_lookups() {
        assert!(Lookup::any_of(Vec::new()).is_empty());
        assert!(Lookup::between(key![5], key![1]).is_empty());
        assert!(!Lookup::prefix(key!["a"]).is_empty());
    }

    #[test]
    fn prefix_matches_extensions() {
        let lookup = Lookup::prefix(key!["by-email"]);
        assert!(lookup.matches(&key!["by-email", "b@x.com"]));
        assert!(!lookup.matches(&key!["by-name", "bob"]));
    }
}
