//!
//!
//! Component snapshots and the change events which carry them
//!
//!

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::id::{ComponentName, EntityRef};

/// The full value of one component of one entity at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity: EntityRef,
    pub component: ComponentName,
    pub data: Value,
}

impl Snapshot {
    pub fn new(entity: EntityRef, component: impl Into<ComponentName>, data: Value) -> Self {
        Snapshot {
            entity,
            component: component.into(),
            data,
        }
    }

    /// Looks up a field by name, or by JSON pointer when `name` starts with '/'
    pub fn field(&self, name: &str) -> Option<&Value> {
        if name.starts_with('/') {
            self.data.pointer(name)
        } else {
            self.data.get(name)
        }
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    pub fn int_field(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(Value::as_i64)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.field(name).and_then(Value::as_bool)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("change event for {0} carries neither an old nor a new snapshot")]
    NoSnapshots(StreamKey),
    #[error("{which} snapshot of change event for {stream} belongs to {found}")]
    SnapshotMismatch {
        stream: StreamKey,
        which: &'static str,
        found: String,
    },
}

/// The ordered stream a change event belongs to. Events within one stream
/// must be applied in commit order, streams are independent of each other
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub entity: EntityRef,
    pub component: ComponentName,
}

impl Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.component)
    }
}

/// An immutable fact: an entity's component was created, updated or deleted
///
/// `seq` is the commit sequence number of the mutation within its
/// [StreamKey], assigned by primary storage and strictly increasing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub component: ComponentName,
    pub entity: EntityRef,
    pub seq: u64,
    pub old: Option<Snapshot>,
    pub new: Option<Snapshot>,
}

impl ChangeEvent {
    pub fn created(seq: u64, new: Snapshot) -> Self {
        ChangeEvent {
            component: new.component.clone(),
            entity: new.entity.clone(),
            seq,
            old: None,
            new: Some(new),
        }
    }

    pub fn updated(seq: u64, old: Snapshot, new: Snapshot) -> Self {
        ChangeEvent {
            component: new.component.clone(),
            entity: new.entity.clone(),
            seq,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn deleted(seq: u64, old: Snapshot) -> Self {
        ChangeEvent {
            component: old.component.clone(),
            entity: old.entity.clone(),
            seq,
            old: Some(old),
            new: None,
        }
    }

    pub fn stream(&self) -> StreamKey {
        StreamKey {
            entity: self.entity.clone(),
            component: self.component.clone(),
        }
    }

    /// Checks the event is well formed and derives what kind of change it is
    pub fn validate(&self) -> Result<ChangeKind, EventError> {
        for (which, snapshot) in [("old", &self.old), ("new", &self.new)] {
            if let Some(snapshot) = snapshot {
                if snapshot.entity != self.entity || snapshot.component != self.component {
                    return Err(EventError::SnapshotMismatch {
                        stream: self.stream(),
                        which,
                        found: format!("{}#{}", snapshot.entity, snapshot.component),
                    });
                }
            }
        }

        match (&self.old, &self.new) {
            (None, Some(_)) => Ok(ChangeKind::Create),
            (Some(_), Some(_)) => Ok(ChangeKind::Update),
            (Some(_), None) => Ok(ChangeKind::Delete),
            (None, None) => Err(EventError::NoSnapshots(self.stream())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::EntityId;
    use serde_json::json;

    fn login(id: u128, name: &str) -> Snapshot {
        let entity = EntityRef::new("user", EntityId::from_u128(id));
        Snapshot::new(entity, "login", json!({ "username": name, "profile": { "age": 30 } }))
    }

    #[test]
    fn kinds() {
        let a = login(1, "bob");
        let b = login(1, "robert");
        assert_eq!(ChangeEvent::created(1, a.clone()).validate(), Ok(ChangeKind::Create));
        assert_eq!(ChangeEvent::updated(2, a.clone(), b).validate(), Ok(ChangeKind::Update));
        assert_eq!(ChangeEvent::deleted(3, a).validate(), Ok(ChangeKind::Delete));
    }

    #[test]
    fn rejects_empty_and_mismatched_events() {
        let a = login(1, "bob");
        let mut empty = ChangeEvent::deleted(1, a.clone());
        empty.old = None;
        assert!(matches!(empty.validate(), Err(EventError::NoSnapshots(_))));

        let other = login(2, "alice");
        let mismatched = ChangeEvent::updated(2, a, other);
        assert!(matches!(
            mismatched.validate(),
            Err(EventError::SnapshotMismatch { which: "old", .. })
        ));
    }

    #[test]
    fn field_access() {
        let s = login(1, "bob");
        assert_eq!(s.str_field("username"), Some("bob"));
        assert_eq!(s.int_field("/profile/age"), Some(30));
        assert_eq!(s.int_field("username"), None);
    }
}
