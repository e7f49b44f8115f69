use std::fmt::{self, Display};
use std::sync::{Arc, PoisonError};

use concord_core::{ChangeEvent, ComponentName, DefinitionName, EntityRef, EntityType, EventError, StreamKey, ViewName};
use thiserror::Error;

/// Raised while declaring the schema. Fatal: an engine is never built from a
/// schema that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("definition {0} is already registered")]
    DuplicateDefinition(DefinitionName),
    #[error("component {0} is declared twice")]
    DuplicateComponent(ComponentName),
    #[error("entity type {0} is declared twice")]
    DuplicateEntityType(EntityType),
    #[error("definition {definition} watches undeclared component {component}")]
    UndeclaredComponent {
        definition: DefinitionName,
        component: ComponentName,
    },
    #[error("definition {definition} filters on undeclared entity type {entity_type}")]
    UndeclaredEntityType {
        definition: DefinitionName,
        entity_type: EntityType,
    },
    #[error("definitions {first} and {second} both write view {view} without distinct partitions")]
    KeyCollision {
        view: ViewName,
        first: DefinitionName,
        second: DefinitionName,
    },
    #[error("view {view} holds {expected} but definition {definition} writes {found}")]
    ValueTypeMismatch {
        view: ViewName,
        definition: DefinitionName,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid configuration value for {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },
}

/// Raised by the view store or the primary store when a read or write is
/// rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("view {0} doesn't exist")]
    UnknownView(ViewName),
    #[error("view {view} holds {expected}, not {requested}")]
    TypeMismatch {
        view: ViewName,
        expected: &'static str,
        requested: &'static str,
    },
    #[error("failed to acquire poisoned lock for {0}")]
    Poisoned(String),
    #[error("journal for view {view} rejected the batch: {reason}")]
    Journal { view: ViewName, reason: String },
    #[error("value in view {view} failed to (de)serialize: {reason}")]
    Codec { view: ViewName, reason: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(err: PoisonError<T>) -> Self {
        StoreError::Poisoned(err.to_string())
    }
}

/// Returned by a definition's `prev` or `update` step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("{0}")]
    Failed(String),
    #[error("snapshot is missing field {0:?}")]
    MissingField(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DefinitionError {
    pub fn msg(message: impl Display) -> Self {
        DefinitionError::Failed(message.to_string())
    }
}

/// What went wrong inside one maintenance batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// `prev` returned an error
    Prev,
    /// `update` returned an error
    Update,
    /// `prev` or `update` panicked
    Panicked,
    /// `update` produced keys outside the definition's declared shape or partition
    MalformedOutput,
    /// the view store rejected the read or the write
    Store,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Prev => write!(f, "prev"),
            FailureKind::Update => write!(f, "update"),
            FailureKind::Panicked => write!(f, "panic"),
            FailureKind::MalformedOutput => write!(f, "malformed output"),
            FailureKind::Store => write!(f, "store"),
        }
    }
}

/// A failed (definition, event) maintenance batch, with full context
///
/// The batch was abandoned: nothing it staged reached the view, and the
/// entity has been marked stale in the target view
#[derive(Debug, Clone, Error)]
#[error("{kind} failure in {definition} maintaining {view} for {entity} (seq {seq}): {reason}", seq = .event.seq)]
pub struct MaintenanceError {
    pub kind: FailureKind,
    pub definition: DefinitionName,
    pub view: ViewName,
    pub entity: EntityRef,
    pub event: Arc<ChangeEvent>,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Malformed(#[from] EventError),
    #[error("event for {stream} arrived out of commit order: seq {seq} after {last}")]
    OutOfOrder { stream: StreamKey, seq: u64, last: u64 },
    #[error("{} maintenance batch(es) failed, first: {}", .0.len(), first_failure(.0))]
    Maintenance(Vec<MaintenanceError>),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rebuilding {0} requires a retained event log")]
    NoEventLog(ViewName),
    #[error("the event log no longer holds every event {0} depends on, rebuild it from an external log")]
    EventLogEvicted(ViewName),
    #[error("view {0} is not written by any definition")]
    UnknownView(ViewName),
    #[error("a maintenance worker panicked: {0}")]
    WorkerPanicked(String),
}

fn first_failure(failures: &[MaintenanceError]) -> String {
    failures.first().map(|f| f.to_string()).unwrap_or_default()
}

impl EngineError {
    /// The maintenance failures carried by this error, if any
    pub fn failures(&self) -> &[MaintenanceError] {
        match self {
            EngineError::Maintenance(failures) => failures,
            _ => &[],
        }
    }
}
