//! Primary storage
//!
//! Definitions occasionally need components other than the one they watch.
//! They read them through [PrimaryStore], which the engine hands to every
//! maintenance batch when one is attached

use concord_core::{ChangeEvent, ComponentName, EntityRef, Snapshot, StreamKey};
use dashmap::DashMap;

use crate::error::StoreError;

pub trait PrimaryStore: Send + Sync {
    /// The current snapshot of `component` on `entity`, if it has one
    fn component(&self, entity: &EntityRef, component: &ComponentName) -> Result<Option<Snapshot>, StoreError>;
}

/// An in memory primary store which also mints change events
///
/// Each (entity, component) stream numbers its events from 1, and keeps
/// counting across a delete and re-create
#[derive(Debug, Default)]
pub struct MemoryPrimary {
    snapshots: DashMap<StreamKey, (u64, Option<Snapshot>)>,
}

impl MemoryPrimary {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_of(snapshot: &Snapshot) -> StreamKey {
        StreamKey {
            entity: snapshot.entity.clone(),
            component: snapshot.component.clone(),
        }
    }

    /// Stores `snapshot`, returning the create or update event describing it
    pub fn put(&self, snapshot: Snapshot) -> ChangeEvent {
        let mut slot = self.snapshots.entry(Self::stream_of(&snapshot)).or_insert((0, None));
        let (seq, current) = slot.value_mut();
        *seq += 1;

        match current.replace(snapshot.clone()) {
            Some(old) => ChangeEvent::updated(*seq, old, snapshot),
            None => ChangeEvent::created(*seq, snapshot),
        }
    }

    /// Drops the component, returning the delete event if it existed
    pub fn remove(&self, entity: &EntityRef, component: &ComponentName) -> Option<ChangeEvent> {
        let stream = StreamKey {
            entity: entity.clone(),
            component: component.clone(),
        };
        let mut slot = self.snapshots.get_mut(&stream)?;
        let (seq, current) = slot.value_mut();
        let old = current.take()?;
        *seq += 1;
        Some(ChangeEvent::deleted(*seq, old))
    }

    pub fn len(&self) -> usize {
        self.snapshots.iter().filter(|slot| slot.value().1.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PrimaryStore for MemoryPrimary {
    fn component(&self, entity: &EntityRef, component: &ComponentName) -> Result<Option<Snapshot>, StoreError> {
        let stream = StreamKey {
            entity: entity.clone(),
            component: component.clone(),
        };
        Ok(self.snapshots.get(&stream).and_then(|slot| slot.value().1.clone()))
    }
}
