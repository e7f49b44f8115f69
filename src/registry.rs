//! Definition Registry
//!
//! Definitions are declared once, validated as they're declared, and then
//! sealed into an immutable dispatch index. The registry has two lives with
//! different data and different methods, so the state is carried in the type.
//! A [SchemaBuilder] accepts registrations and a [Schema] only answers "who
//! watches this component"

use std::any::{type_name, TypeId};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use concord_core::{ChangeEvent, ComponentName, DefinitionName, EntityRef, EntityType, Key, Scalar, ViewName};

use crate::aggregate::{Accumulator, AggregateView};
use crate::config::EngineConfig;
use crate::definition::{Definition, Prev, ViewOptions};
use crate::engine::Engine;
use crate::error::{DefinitionError, EngineError, FailureKind, SchemaError, StoreError};
use crate::primary::PrimaryStore;
use crate::store::{Entries, Staged, ViewStore};

/// Everything one maintenance batch needs besides the definition itself
pub(crate) struct Context<'a> {
    pub store: &'a ViewStore,
    pub event: &'a ChangeEvent,
    pub primary: Option<&'a dyn PrimaryStore>,
    pub catch_panics: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Skipped,
    Written(usize),
}

/// Why a maintenance batch was abandoned
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    fn new(kind: FailureKind, reason: impl ToString) -> Self {
        Failure {
            kind,
            reason: reason.to_string(),
        }
    }

    fn store(err: StoreError) -> Self {
        Failure::new(FailureKind::Store, err)
    }

    fn definition(kind: FailureKind, err: DefinitionError) -> Self {
        match err {
            DefinitionError::Store(err) => Failure::store(err),
            err => Failure::new(kind, err),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A registered definition with its value type erased, as the engine sees it
pub(crate) trait Maintainer: Send + Sync {
    fn name(&self) -> &DefinitionName;
    fn target(&self) -> &ViewName;
    fn watches(&self) -> &ComponentName;
    fn entity_type(&self) -> Option<&EntityType>;
    fn partition(&self) -> Option<&Scalar>;
    fn value_type(&self) -> (TypeId, &'static str);

    fn accepts(&self, entity: &EntityRef) -> bool {
        self.entity_type().map_or(true, |t| *t == entity.entity_type)
    }

    fn create_table(&self, store: &ViewStore) -> Result<(), StoreError>;

    /// Runs one (definition, event) maintenance batch to completion or abandons it
    fn maintain(&self, cx: &Context<'_>) -> Result<Outcome, Failure>;
}

struct Registered<D: Definition> {
    name: DefinitionName,
    target: ViewName,
    options: ViewOptions,
    definition: D,
}

impl<D: Definition> Registered<D> {
    /// The prev/update protocol against committed entries, yielding the staged
    /// writes, or `None` when `prev` skipped the event
    fn run(&self, committed: &Entries<D::Value>, cx: &Context<'_>) -> Result<Option<Staged<D::Value>>, Failure> {
        let event = cx.event;
        let mut view = crate::store::ViewHandle::new(&self.target, committed, cx.primary);

        let old_entries = match self
            .definition
            .prev(&view, &event.entity, event.old.as_ref())
            .map_err(|err| Failure::definition(FailureKind::Prev, err))?
        {
            Prev::Skip => return Ok(None),
            Prev::Lookup(lookup) => view.find(&lookup),
            Prev::Resolved(entries) => entries,
        };

        let writes = self
            .definition
            .update(&mut view, old_entries, &event.entity, event.old.as_ref(), event.new.as_ref())
            .map_err(|err| Failure::definition(FailureKind::Update, err))?;

        // returned writes land after anything written through the handle
        for write in writes {
            view.apply(write);
        }
        Ok(Some(view.into_staged()))
    }

    fn check_key(&self, key: &Key) -> Result<(), Failure> {
        if let Some(partition) = &self.options.partition {
            if key.first() != Some(partition) {
                return Err(Failure::new(
                    FailureKind::MalformedOutput,
                    format!("key {} is outside partition {}", key, partition),
                ));
            }
        }
        if let Some(shape) = &self.options.shape {
            if !shape.matches(key) {
                return Err(Failure::new(
                    FailureKind::MalformedOutput,
                    format!("key {} doesn't match the declared shape {:?}", key, shape.kinds()),
                ));
            }
        }
        Ok(())
    }
}

impl<D: Definition> Maintainer for Registered<D> {
    fn name(&self) -> &DefinitionName {
        &self.name
    }

    fn target(&self) -> &ViewName {
        &self.target
    }

    fn watches(&self) -> &ComponentName {
        self.definition.watches()
    }

    fn entity_type(&self) -> Option<&EntityType> {
        self.definition.entity_type()
    }

    fn partition(&self) -> Option<&Scalar> {
        self.options.partition.as_ref()
    }

    fn value_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<D::Value>(), type_name::<D::Value>())
    }

    fn create_table(&self, store: &ViewStore) -> Result<(), StoreError> {
        store.create::<D::Value>(&self.target)
    }

    fn maintain(&self, cx: &Context<'_>) -> Result<Outcome, Failure> {
        let table = cx.store.table::<D::Value>(&self.target).map_err(Failure::store)?;

        // the view's critical section spans lookup, reconcile and write
        let mut entries = table.lock().map_err(Failure::store)?;

        let staged = if cx.catch_panics {
            catch_unwind(AssertUnwindSafe(|| self.run(&entries, cx)))
                .map_err(|payload| Failure::new(FailureKind::Panicked, panic_message(&*payload)))??
        } else {
            self.run(&entries, cx)?
        };

        let Some(staged) = staged else {
            return Ok(Outcome::Skipped);
        };

        for key in staged.keys() {
            self.check_key(key)?;
        }

        let written = table.commit(&mut entries, staged).map_err(Failure::store)?;
        Ok(Outcome::Written(written))
    }
}

pub trait RegistryState {}

/// Registrations being collected
#[derive(Default)]
pub struct Open {
    entity_types: HashSet<EntityType>,
    components: HashSet<ComponentName>,
    definitions: Vec<Arc<dyn Maintainer>>,
}

/// The immutable dispatch index
pub struct Sealed {
    definitions: Vec<Arc<dyn Maintainer>>,
    dispatch: HashMap<ComponentName, Vec<Arc<dyn Maintainer>>>,
    writers: HashMap<ViewName, Vec<Arc<dyn Maintainer>>>,
}

impl RegistryState for Open {}
impl RegistryState for Sealed {}

pub struct Registry<S: RegistryState = Open> {
    state: S,
}

pub type SchemaBuilder = Registry<Open>;
pub type Schema = Registry<Sealed>;

impl Default for Registry<Open> {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry<Open> {
    pub fn new() -> Self {
        Registry { state: Open::default() }
    }

    pub fn entity_type(&mut self, name: impl Into<EntityType>) -> Result<&mut Self, SchemaError> {
        let name = name.into();
        if !self.state.entity_types.insert(name.clone()) {
            return Err(SchemaError::DuplicateEntityType(name));
        }
        Ok(self)
    }

    pub fn component(&mut self, name: impl Into<ComponentName>) -> Result<&mut Self, SchemaError> {
        let name = name.into();
        if !self.state.components.insert(name.clone()) {
            return Err(SchemaError::DuplicateComponent(name));
        }
        Ok(self)
    }

    /// Registers `definition` as the view named `name`
    pub fn new_view<D: Definition>(&mut self, name: impl Into<DefinitionName>, definition: D) -> Result<&mut Self, SchemaError> {
        self.new_view_with(name, definition, ViewOptions::default())
    }

    pub fn new_view_with<D: Definition>(
        &mut self,
        name: impl Into<DefinitionName>,
        definition: D,
        options: ViewOptions,
    ) -> Result<&mut Self, SchemaError> {
        let name = name.into();
        let target = options.target.clone().unwrap_or_else(|| ViewName::new(name.as_str()));
        let registered = Registered {
            name,
            target,
            options,
            definition,
        };
        self.validate(&registered)?;

        tracing::debug!(
            definition = %registered.name,
            view = %registered.target,
            watches = %registered.watches(),
            "registered definition"
        );
        self.state.definitions.push(Arc::new(registered));
        Ok(self)
    }

    /// Registers the aggregate `accumulator` as the view named `name`
    pub fn new_aggr<A: Accumulator>(&mut self, name: impl Into<DefinitionName>, accumulator: A) -> Result<&mut Self, SchemaError> {
        self.new_view(name, AggregateView(accumulator))
    }

    pub fn new_aggr_with<A: Accumulator>(
        &mut self,
        name: impl Into<DefinitionName>,
        accumulator: A,
        options: ViewOptions,
    ) -> Result<&mut Self, SchemaError> {
        self.new_view_with(name, AggregateView(accumulator), options)
    }

    fn validate(&self, candidate: &dyn Maintainer) -> Result<(), SchemaError> {
        let name = candidate.name();
        if self.state.definitions.iter().any(|d| d.name() == name) {
            return Err(SchemaError::DuplicateDefinition(name.clone()));
        }

        if !self.state.components.contains(candidate.watches()) {
            return Err(SchemaError::UndeclaredComponent {
                definition: name.clone(),
                component: candidate.watches().clone(),
            });
        }

        if let Some(entity_type) = candidate.entity_type() {
            if !self.state.entity_types.contains(entity_type) {
                return Err(SchemaError::UndeclaredEntityType {
                    definition: name.clone(),
                    entity_type: entity_type.clone(),
                });
            }
        }

        let view = candidate.target();
        let (type_id, found) = candidate.value_type();
        for existing in self.state.definitions.iter().filter(|d| d.target() == view) {
            let (existing_id, expected) = existing.value_type();
            if existing_id != type_id {
                return Err(SchemaError::ValueTypeMismatch {
                    view: view.clone(),
                    definition: name.clone(),
                    expected,
                    found,
                });
            }

            let distinct = matches!(
                (existing.partition(), candidate.partition()),
                (Some(a), Some(b)) if a != b
            );
            if !distinct {
                return Err(SchemaError::KeyCollision {
                    view: view.clone(),
                    first: existing.name().clone(),
                    second: name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Freezes the registry into its dispatch index
    pub fn seal(self) -> Schema {
        let definitions = self.state.definitions;
        let mut dispatch: HashMap<ComponentName, Vec<Arc<dyn Maintainer>>> = HashMap::new();
        let mut writers: HashMap<ViewName, Vec<Arc<dyn Maintainer>>> = HashMap::new();

        for definition in definitions.iter() {
            dispatch
                .entry(definition.watches().clone())
                .or_default()
                .push(definition.clone());
            writers
                .entry(definition.target().clone())
                .or_default()
                .push(definition.clone());
        }

        tracing::info!(
            definitions = definitions.len(),
            views = writers.len(),
            components = dispatch.len(),
            "sealed schema"
        );

        Registry {
            state: Sealed {
                definitions,
                dispatch,
                writers,
            },
        }
    }

    /// Seals the registry and opens an in memory engine over it
    pub fn build(self, config: EngineConfig) -> Result<Engine, EngineError> {
        Engine::builder(self.seal()).config(config).open()
    }
}

impl Registry<Sealed> {
    /// Definitions watching `component`, in registration order
    pub(crate) fn watching(&self, component: &ComponentName) -> &[Arc<dyn Maintainer>] {
        self.state.dispatch.get(component).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Definitions writing `view`, in registration order
    pub(crate) fn writers(&self, view: &ViewName) -> Option<&[Arc<dyn Maintainer>]> {
        self.state.writers.get(view).map(Vec::as_slice)
    }

    pub(crate) fn definitions(&self) -> &[Arc<dyn Maintainer>] {
        &self.state.definitions
    }

    /// Names of the definitions watching `component`, in the order they run
    pub fn watchers(&self, component: &ComponentName) -> Vec<&DefinitionName> {
        self.watching(component).iter().map(|d| d.name()).collect()
    }

    pub fn views(&self) -> Vec<&ViewName> {
        let mut views: Vec<&ViewName> = self.state.writers.keys().collect();
        views.sort();
        views
    }
}
