//!
//!
//! Concord Core Lib
//!
//! Identifiers, keys, lookups, snapshots and change events shared by the
//! view maintenance engine and the storage layers that feed it
//!

pub mod component;
pub mod id;
pub mod key;
pub mod lookup;

mod prelude {
    pub use crate::component::{ChangeEvent, ChangeKind, EventError, Snapshot, StreamKey};
    pub use crate::id::{ComponentName, DefinitionName, EntityId, EntityRef, EntityType, StableName, ViewName};
    pub use crate::key::{GeoPoint, Key, KeyShape, Scalar, ScalarKind};
    pub use crate::lookup::Lookup;
}

pub use prelude::*;
