//! Definitions
//!
//! A definition describes how one derived view follows one watched component.
//! It is driven in two steps for every change event:
//!
//! - `prev` runs first, against the old snapshot only, and names the entries
//!   which currently represent the entity in the view. It may also ask for
//!   the event to be skipped entirely
//! - `update` receives those entries with both snapshots, and returns the
//!   key/value writes which reconcile the view with the new snapshot
//!
//! Splitting the two lets a definition derive its old keys from fields which
//! no longer exist after the change, without diffing whole key lists

use std::fmt::Debug;
use std::marker::PhantomData;

use concord_core::{ComponentName, EntityRef, EntityType, Key, KeyShape, Lookup, Scalar, Snapshot, ViewName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;
use crate::store::ViewHandle;

/// Anything which can be stored as the value of a view entry
pub trait ViewValue: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> ViewValue for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A single view entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<V> {
    pub key: Key,
    pub value: V,
}

impl<V> Entry<V> {
    pub fn new(key: Key, value: V) -> Self {
        Entry { key, value }
    }
}

/// A write produced by `update`. A missing value deletes the key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert<V> {
    pub key: Key,
    pub value: Option<V>,
}

impl<V> Upsert<V> {
    pub fn put(key: Key, value: V) -> Self {
        Upsert { key, value: Some(value) }
    }

    pub fn delete(key: Key) -> Self {
        Upsert { key, value: None }
    }
}

impl<V> From<Entry<V>> for Upsert<V> {
    fn from(entry: Entry<V>) -> Self {
        Upsert::put(entry.key, entry.value)
    }
}

/// The result of a definition's `prev` step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prev<V> {
    /// Leave the view untouched for this event
    Skip,

    /// Resolve these keys against the view, then run `update` with the result
    Lookup(Lookup),

    /// Run `update` with exactly these entries, without touching the store
    Resolved(Vec<Entry<V>>),
}

impl<V> Prev<V> {
    /// No prior entries: straight to `update`
    pub fn none() -> Self {
        Prev::Resolved(Vec::new())
    }
}

/// A view definition
///
/// Definitions must be deterministic: given identical old entries and
/// snapshots, `update` must return identical writes. That is what makes
/// rebuilding a stale view by replay safe
pub trait Definition: Send + Sync + 'static {
    type Value: ViewValue;

    /// The component this definition follows
    fn watches(&self) -> &ComponentName;

    /// Restrict the definition to one entity type. `None` follows the
    /// watched component on every entity type
    fn entity_type(&self) -> Option<&EntityType> {
        None
    }

    fn prev(
        &self,
        view: &ViewHandle<'_, Self::Value>,
        entity: &EntityRef,
        old: Option<&Snapshot>,
    ) -> Result<Prev<Self::Value>, DefinitionError>;

    fn update(
        &self,
        view: &mut ViewHandle<'_, Self::Value>,
        old_entries: Vec<Entry<Self::Value>>,
        entity: &EntityRef,
        old: Option<&Snapshot>,
        new: Option<&Snapshot>,
    ) -> Result<Vec<Upsert<Self::Value>>, DefinitionError>;
}

/// A [Definition] assembled from a pair of closures
pub struct ViewSpec<V, P, U> {
    watches: ComponentName,
    entity_type: Option<EntityType>,
    prev: P,
    update: U,
    _value: PhantomData<fn() -> V>,
}

/// Builds a closure backed definition watching `component`
pub fn view<V, P, U>(component: impl Into<ComponentName>, prev: P, update: U) -> ViewSpec<V, P, U>
where
    V: ViewValue,
    P: Fn(&ViewHandle<'_, V>, &EntityRef, Option<&Snapshot>) -> Result<Prev<V>, DefinitionError> + Send + Sync + 'static,
    U: Fn(
            &mut ViewHandle<'_, V>,
            Vec<Entry<V>>,
            &EntityRef,
            Option<&Snapshot>,
            Option<&Snapshot>,
        ) -> Result<Vec<Upsert<V>>, DefinitionError>
        + Send
        + Sync
        + 'static,
{
    ViewSpec {
        watches: component.into(),
        entity_type: None,
        prev,
        update,
        _value: PhantomData,
    }
}

impl<V, P, U> ViewSpec<V, P, U> {
    pub fn for_entity_type(mut self, entity_type: impl Into<EntityType>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }
}

impl<V, P, U> Definition for ViewSpec<V, P, U>
where
    V: ViewValue,
    P: Fn(&ViewHandle<'_, V>, &EntityRef, Option<&Snapshot>) -> Result<Prev<V>, DefinitionError> + Send + Sync + 'static,
    U: Fn(
            &mut ViewHandle<'_, V>,
            Vec<Entry<V>>,
            &EntityRef,
            Option<&Snapshot>,
            Option<&Snapshot>,
        ) -> Result<Vec<Upsert<V>>, DefinitionError>
        + Send
        + Sync
        + 'static,
{
    type Value = V;

    fn watches(&self) -> &ComponentName {
        &self.watches
    }

    fn entity_type(&self) -> Option<&EntityType> {
        self.entity_type.as_ref()
    }

    fn prev(&self, view: &ViewHandle<'_, V>, entity: &EntityRef, old: Option<&Snapshot>) -> Result<Prev<V>, DefinitionError> {
        (self.prev)(view, entity, old)
    }

    fn update(
        &self,
        view: &mut ViewHandle<'_, V>,
        old_entries: Vec<Entry<V>>,
        entity: &EntityRef,
        old: Option<&Snapshot>,
        new: Option<&Snapshot>,
    ) -> Result<Vec<Upsert<V>>, DefinitionError> {
        (self.update)(view, old_entries, entity, old, new)
    }
}

/// Registration options for a definition
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    /// The view written to. Defaults to a view named after the definition
    pub target: Option<ViewName>,

    /// Required when several definitions share a target. Every key the
    /// definition writes must begin with this scalar
    pub partition: Option<Scalar>,

    /// When set, every key the definition writes must have this shape
    pub shape: Option<KeyShape>,
}

impl ViewOptions {
    /// Write into the shared view `target` under `partition`
    pub fn shared(target: impl Into<ViewName>, partition: impl Into<Scalar>) -> Self {
        ViewOptions {
            target: Some(target.into()),
            partition: Some(partition.into()),
            shape: None,
        }
    }

    pub fn with_shape(mut self, shape: KeyShape) -> Self {
        self.shape = Some(shape);
        self
    }
}
