//! View Store
//!
//! Ordered key/value tables, one per view, each behind its own lock. A table
//! lock is held for a whole (lookup, reconcile, write) cycle, so writes to one
//! view are serialized while different views proceed independently

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use concord_core::{ComponentName, EntityRef, Key, Lookup, Snapshot, ViewName};
use dashmap::{DashMap, DashSet};

use crate::definition::{Entry, Upsert, ViewValue};
use crate::error::{DefinitionError, StoreError};
use crate::journal::{Journal, JournalRecord};
use crate::primary::PrimaryStore;

pub(crate) type Entries<V> = BTreeMap<Key, V>;

/// Writes staged by one maintenance batch, `None` marks a deletion
pub(crate) type Staged<V> = BTreeMap<Key, Option<V>>;

/// Resolves `lookup` against `entries`, in key order
pub(crate) fn select<V: Clone>(entries: &Entries<V>, lookup: &Lookup) -> Vec<Entry<V>> {
    if lookup.is_empty() {
        return Vec::new();
    }

    let entry = |(k, v): (&Key, &V)| Entry::new(k.clone(), v.clone());
    match lookup {
        Lookup::Eq(key) => entries.get_key_value(key).map(entry).into_iter().collect(),
        Lookup::In(keys) => keys.iter().filter_map(|k| entries.get_key_value(k)).map(entry).collect(),
        Lookup::Between(low, high) => entries.range(low..=high).map(entry).collect(),
        Lookup::Prefix(prefix) => entries
            .range((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(entry)
            .collect(),
        Lookup::All => entries.iter().map(entry).collect(),
    }
}

/// The typed table backing one view
pub struct Table<V> {
    name: ViewName,
    entries: Mutex<Entries<V>>,
    journal: Arc<dyn Journal>,
}

impl<V: ViewValue> Table<V> {
    fn open(name: ViewName, journal: Arc<dyn Journal>) -> Result<Self, StoreError> {
        let mut entries = Entries::new();
        let batches = journal.restore(&name)?;
        let replayed = batches.len();
        for batch in batches {
            for record in batch {
                match record.value {
                    Some(value) => {
                        let value: V = serde_json::from_value(value).map_err(|err| StoreError::Codec {
                            view: name.clone(),
                            reason: err.to_string(),
                        })?;
                        entries.insert(record.key, value);
                    }
                    None => {
                        entries.remove(&record.key);
                    }
                }
            }
        }

        if !entries.is_empty() {
            tracing::info!(view = %name, entries = entries.len(), batches = replayed, "restored view from journal");
        }

        let table = Table {
            name,
            entries: Mutex::new(entries),
            journal,
        };

        // restart cost stays proportional to the view, not to its history
        if replayed > 1 {
            let snapshot = {
                let entries = table.lock()?;
                table.records(entries.iter().map(|(key, value)| (key, Some(value))))?
            };
            table.journal.compact(&table.name, &snapshot)?;
        }
        Ok(table)
    }

    fn records<'v>(&self, writes: impl Iterator<Item = (&'v Key, Option<&'v V>)>) -> Result<Vec<JournalRecord>, StoreError> {
        writes
            .map(|(key, value)| {
                let value = value.map(serde_json::to_value).transpose().map_err(|err| StoreError::Codec {
                    view: self.name.clone(),
                    reason: err.to_string(),
                })?;
                Ok(JournalRecord { key: key.clone(), value })
            })
            .collect()
    }

    pub fn name(&self) -> &ViewName {
        &self.name
    }

    /// Enters the view's critical section
    ///
    /// Entries only change once a batch has been staged and journaled, so a
    /// panic raised while the lock was held never leaves them half written
    /// and a poisoned lock is taken over as is
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Entries<V>>, StoreError> {
        Ok(self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(view = %self.name, "recovering view lock poisoned by a panic");
            poisoned.into_inner()
        }))
    }

    pub fn find(&self, lookup: &Lookup) -> Result<Vec<Entry<V>>, StoreError> {
        Ok(select(&*self.lock()?, lookup))
    }

    pub fn get(&self, key: &Key) -> Result<Option<V>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    /// Applies upserts directly, as one journaled batch
    pub fn update(&self, writes: Vec<Upsert<V>>) -> Result<usize, StoreError> {
        let staged: Staged<V> = writes.into_iter().map(|w| (w.key, w.value)).collect();
        let mut guard = self.lock()?;
        self.commit(&mut guard, staged)
    }

    /// Journals `staged` and then applies it to `entries`. Nothing is applied
    /// when the journal rejects the batch
    pub(crate) fn commit(&self, entries: &mut Entries<V>, staged: Staged<V>) -> Result<usize, StoreError> {
        if staged.is_empty() {
            return Ok(0);
        }

        let records = self.records(staged.iter().map(|(key, value)| (key, value.as_ref())))?;

        self.journal.append(&self.name, &records)?;

        let written = staged.len();
        for (key, value) in staged {
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(written)
    }
}

/// The untyped face of a [Table]
pub(crate) trait AnyTable: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn value_type(&self) -> &'static str;
    fn len(&self) -> Result<usize, StoreError>;
    fn reset(&self) -> Result<(), StoreError>;
}

impl<V: ViewValue> AnyTable for Table<V> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn value_type(&self) -> &'static str {
        type_name::<V>()
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        self.journal.truncate(&self.name)?;
        guard.clear();
        Ok(())
    }
}

/// Every view table, plus the entities each view has fallen behind on
pub struct ViewStore {
    tables: DashMap<ViewName, Arc<dyn AnyTable>>,
    stale: DashMap<ViewName, DashSet<EntityRef>>,
    journal: Arc<dyn Journal>,
}

impl ViewStore {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        ViewStore {
            tables: DashMap::new(),
            stale: DashMap::new(),
            journal,
        }
    }

    /// Creates the table for `name`, restoring whatever the journal holds.
    /// Creating a table that already exists is a no-op
    pub(crate) fn create<V: ViewValue>(&self, name: &ViewName) -> Result<(), StoreError> {
        if self.tables.contains_key(name) {
            return Ok(());
        }
        let table: Arc<dyn AnyTable> = Arc::new(Table::<V>::open(name.clone(), self.journal.clone())?);
        self.tables.insert(name.clone(), table);
        Ok(())
    }

    fn any_table(&self, name: &ViewName) -> Result<Arc<dyn AnyTable>, StoreError> {
        self.tables
            .get(name)
            .map(|table| table.value().clone())
            .ok_or_else(|| StoreError::UnknownView(name.clone()))
    }

    pub fn table<V: ViewValue>(&self, name: &ViewName) -> Result<Arc<Table<V>>, StoreError> {
        let table = self.any_table(name)?;
        let expected = table.value_type();
        table.into_any().downcast::<Table<V>>().map_err(|_| StoreError::TypeMismatch {
            view: name.clone(),
            expected,
            requested: type_name::<V>(),
        })
    }

    pub fn find<V: ViewValue>(&self, name: &ViewName, lookup: &Lookup) -> Result<Vec<Entry<V>>, StoreError> {
        self.table::<V>(name)?.find(lookup)
    }

    pub fn get<V: ViewValue>(&self, name: &ViewName, key: &Key) -> Result<Option<V>, StoreError> {
        self.table::<V>(name)?.get(key)
    }

    pub fn len(&self, name: &ViewName) -> Result<usize, StoreError> {
        self.any_table(name)?.len()
    }

    pub fn views(&self) -> Vec<ViewName> {
        let mut views: Vec<ViewName> = self.tables.iter().map(|t| t.key().clone()).collect();
        views.sort();
        views
    }

    /// Empties a view and its journal, and forgets its stale entities
    pub(crate) fn reset(&self, name: &ViewName) -> Result<(), StoreError> {
        self.any_table(name)?.reset()?;
        self.stale.remove(name);
        Ok(())
    }

    pub(crate) fn mark_stale(&self, name: &ViewName, entity: &EntityRef) {
        self.stale.entry(name.clone()).or_default().insert(entity.clone());
    }

    pub fn stale(&self, name: &ViewName) -> Vec<EntityRef> {
        let mut stale: Vec<EntityRef> = self
            .stale
            .get(name)
            .map(|set| set.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default();
        stale.sort();
        stale
    }

    pub fn is_stale(&self, name: &ViewName) -> bool {
        self.stale.get(name).is_some_and(|set| !set.is_empty())
    }
}

/// A definition's window onto its target view for one maintenance batch
///
/// Reads see the committed entries overlaid with whatever the batch has
/// staged so far. Writes are staged only; the engine commits them once the
/// definition returns successfully, or drops them if it doesn't
pub struct ViewHandle<'a, V> {
    view: &'a ViewName,
    committed: &'a Entries<V>,
    staged: Staged<V>,
    primary: Option<&'a dyn PrimaryStore>,
}

impl<'a, V: ViewValue> ViewHandle<'a, V> {
    pub(crate) fn new(view: &'a ViewName, committed: &'a Entries<V>, primary: Option<&'a dyn PrimaryStore>) -> Self {
        ViewHandle {
            view,
            committed,
            staged: Staged::new(),
            primary,
        }
    }

    pub fn name(&self) -> &ViewName {
        self.view
    }

    pub fn find(&self, lookup: &Lookup) -> Vec<Entry<V>> {
        if self.staged.is_empty() {
            return select(self.committed, lookup);
        }

        let mut merged: Entries<V> = select(self.committed, lookup)
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect();
        for (key, value) in self.staged.iter().filter(|(k, _)| lookup.matches(k)) {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().map(|(k, v)| Entry::new(k, v)).collect()
    }

    pub fn get(&self, key: &Key) -> Option<V> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.committed.get(key).cloned(),
        }
    }

    pub fn put(&mut self, key: Key, value: V) {
        self.staged.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Key) {
        self.staged.insert(key, None);
    }

    pub fn apply(&mut self, write: Upsert<V>) {
        self.staged.insert(write.key, write.value);
    }

    pub fn primary(&self) -> Option<&'a dyn PrimaryStore> {
        self.primary
    }

    /// Reads another component from primary storage
    pub fn component(&self, entity: &EntityRef, component: &ComponentName) -> Result<Option<Snapshot>, DefinitionError> {
        let primary = self
            .primary
            .ok_or_else(|| StoreError::Unavailable("no primary store attached".to_string()))?;
        Ok(primary.component(entity, component)?)
    }

    pub(crate) fn into_staged(self) -> Staged<V> {
        self.staged
    }
}
