//!
//! Concord keeps derived views of an entity-component store up to date as
//! components change
//!
//! Views are declared up front against a [SchemaBuilder]. Each definition
//! watches one component and is driven through a two step prev/update
//! protocol for every change to it, with the results written to an ordered
//! key/value [store](ViewStore) under a per-view lock
//!

pub mod aggregate;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod extract;
pub mod journal;
pub mod log;
pub mod primary;
pub mod registry;
pub mod store;

pub use concord_core::{
    key, ChangeEvent, ChangeKind, ComponentName, DefinitionName, EntityId, EntityRef, EntityType, EventError, GeoPoint,
    Key, KeyShape, Lookup, Scalar, ScalarKind, Snapshot, StreamKey, ViewName,
};

pub use aggregate::{Accumulator, AggregateView, Count, Sum, Tally};
pub use config::EngineConfig;
pub use definition::{view, Definition, Entry, Prev, Upsert, ViewOptions, ViewSpec, ViewValue};
pub use engine::{Applied, BatchReport, ChangeListener, Engine, EngineBuilder};
pub use error::{DefinitionError, EngineError, FailureKind, MaintenanceError, SchemaError, StoreError};
pub use extract::Normalize;
pub use journal::{FileJournal, Journal, JournalRecord, MemoryJournal};
pub use primary::{MemoryPrimary, PrimaryStore};
pub use registry::{Schema, SchemaBuilder};
pub use store::{Table, ViewHandle, ViewStore};
