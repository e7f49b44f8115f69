//! Key extraction helpers for writing definitions

use std::collections::BTreeMap;

use concord_core::{Key, Scalar, Snapshot};
use itertools::Itertools;
use serde_json::Value;

use crate::definition::{Entry, Upsert};

/// How string values are normalised before they become key elements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Normalize {
    #[default]
    None,
    Trim,
    /// Trimmed and lowercased
    CaseFold,
}

impl Normalize {
    pub fn apply(self, value: &str) -> String {
        match self {
            Normalize::None => value.to_string(),
            Normalize::Trim => value.trim().to_string(),
            Normalize::CaseFold => value.trim().to_lowercase(),
        }
    }
}

fn scalar(value: &Value, normalize: Normalize) -> Option<Scalar> {
    match value {
        Value::String(s) => {
            let s = normalize.apply(s);
            (!s.is_empty()).then_some(Scalar::Str(s))
        }
        Value::Number(n) => n.as_i64().map(Scalar::Int),
        Value::Bool(b) => Some(Scalar::Bool(*b)),
        _ => None,
    }
}

/// The usable values of one field. Arrays contribute each of their elements;
/// empty strings and non-scalar values are dropped
pub fn values(snapshot: &Snapshot, field: &str, normalize: Normalize) -> Vec<Scalar> {
    match snapshot.field(field) {
        Some(Value::Array(items)) => items.iter().filter_map(|v| scalar(v, normalize)).unique().collect(),
        Some(value) => scalar(value, normalize).into_iter().collect(),
        None => Vec::new(),
    }
}

/// One single element key per distinct value across `fields`
pub fn fields(snapshot: &Snapshot, fields: &[&str], normalize: Normalize) -> Vec<Key> {
    fields
        .iter()
        .flat_map(|field| values(snapshot, field, normalize))
        .unique()
        .map(Key::single)
        .collect()
}

/// Multi element keys, one element per field group, covering every
/// combination of the groups' values. Empty when any group has no value
pub fn compound(snapshot: &Snapshot, groups: &[&[&str]], normalize: Normalize) -> Vec<Key> {
    if groups.is_empty() {
        return Vec::new();
    }

    groups
        .iter()
        .map(|group| {
            group
                .iter()
                .flat_map(|field| values(snapshot, field, normalize))
                .unique()
                .collect::<Vec<_>>()
        })
        .multi_cartesian_product()
        .map(Key::new)
        .collect()
}

/// The writes which turn `old_entries` into exactly `keys`, each mapped to
/// `value`. Keys already holding `value` are left alone
pub fn reconcile<V>(old_entries: Vec<Entry<V>>, keys: impl IntoIterator<Item = Key>, value: V) -> Vec<Upsert<V>>
where
    V: Clone + PartialEq,
{
    let mut old: BTreeMap<Key, V> = old_entries.into_iter().map(|e| (e.key, e.value)).collect();

    let mut writes: Vec<Upsert<V>> = keys
        .into_iter()
        .unique()
        .filter_map(|key| match old.remove(&key) {
            Some(current) if current == value => None,
            _ => Some(Upsert::put(key, value.clone())),
        })
        .collect();

    writes.extend(old.into_keys().map(Upsert::delete));
    writes
}
