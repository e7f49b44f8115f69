//! Maintenance Engine
//!
//! Receives change events, finds every definition watching the changed
//! component, and drives one maintenance batch per (definition, event) in
//! registration order. A failed batch never fails the primary mutation that
//! produced the event: it is logged, recorded, and leaves the entity stale in
//! the view until the view is rebuilt

use std::collections::VecDeque;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use concord_core::{ChangeEvent, ComponentName, EntityRef, Key, Lookup, StreamKey, ViewName};
use dashmap::DashMap;
use itertools::Itertools;

use crate::config::EngineConfig;
use crate::definition::{Entry, ViewValue};
use crate::error::{EngineError, MaintenanceError};
use crate::journal::{Journal, MemoryJournal};
use crate::log::EventLog;
use crate::primary::PrimaryStore;
use crate::registry::{panic_message, Context, Maintainer, Outcome, Schema};
use crate::store::ViewStore;

/// The subscription seam primary storage delivers committed changes through
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// What one event, or a batch of them, did to the views
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// Maintenance batches which ran to completion
    pub maintained: usize,
    /// Maintenance batches `prev` asked to skip
    pub skipped: usize,
    /// Entries written, deletions included
    pub written: usize,
}

impl AddAssign for Applied {
    fn add_assign(&mut self, rhs: Self) {
        self.maintained += rhs.maintained;
        self.skipped += rhs.skipped;
        self.written += rhs.written;
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Applied,
    pub errors: Vec<EngineError>,
}

impl BatchReport {
    fn record(&mut self, result: Result<Applied, EngineError>) {
        match result {
            Ok(applied) => self.applied += applied,
            Err(err) => self.errors.push(err),
        }
    }

    fn merge(&mut self, other: BatchReport) {
        self.applied += other.applied;
        self.errors.extend(other.errors);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct EngineBuilder {
    schema: Schema,
    config: EngineConfig,
    journal: Arc<dyn Journal>,
    primary: Option<Arc<dyn PrimaryStore>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn primary(mut self, primary: Arc<dyn PrimaryStore>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Creates every view, restoring each from the journal
    pub fn open(self) -> Result<Engine, EngineError> {
        let store = ViewStore::new(self.journal);
        for definition in self.schema.definitions() {
            definition.create_table(&store)?;
        }

        tracing::info!(
            views = store.views().len(),
            event_log = self.config.retain_event_log,
            parallelism = self.config.parallelism,
            "opened engine"
        );

        Ok(Engine {
            log: self.config
                .retain_event_log
                .then(|| EventLog::new(self.config.event_log_capacity)),
            schema: self.schema,
            store,
            primary: self.primary,
            streams: DashMap::new(),
            gate: RwLock::new(()),
            failures: Mutex::new(VecDeque::new()),
            config: self.config,
        })
    }
}

pub struct Engine {
    schema: Schema,
    store: ViewStore,
    primary: Option<Arc<dyn PrimaryStore>>,
    /// Last applied sequence number per stream. The lock is held while the
    /// stream's event is maintained, so one stream never runs concurrently
    streams: DashMap<StreamKey, Arc<Mutex<Option<u64>>>>,
    /// Applying holds the read side from logging an event until it has been
    /// dispatched. Rebuilding holds the write side, so a replay never races a
    /// live event into or out of the view
    gate: RwLock<()>,
    log: Option<EventLog>,
    failures: Mutex<VecDeque<MaintenanceError>>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(schema: Schema) -> EngineBuilder {
        EngineBuilder {
            schema,
            config: EngineConfig::default(),
            journal: Arc::new(MemoryJournal::new()),
            primary: None,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ViewStore {
        &self.store
    }

    /// Maintains every view watching the event's component
    ///
    /// Events of one (entity, component) stream must arrive in commit order;
    /// an event whose sequence number doesn't advance its stream is rejected
    /// before any definition runs
    pub fn apply(&self, event: &ChangeEvent) -> Result<Applied, EngineError> {
        let kind = event.validate()?;
        let stream = event.stream();

        let span = tracing::debug_span!("apply", stream = %stream, seq = event.seq, kind = %kind);
        let _enter = span.enter();

        // neither lock guards data a panic could leave half written
        let _admitted = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let slot = self.streams.entry(stream.clone()).or_default().clone();
        let mut last = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = *last {
            if event.seq <= last {
                return Err(EngineError::OutOfOrder {
                    stream,
                    seq: event.seq,
                    last,
                });
            }
        }

        let event = Arc::new(event.clone());
        let watching = self.schema.watching(&event.component);
        if let Some(log) = self.log.as_ref().filter(|_| !watching.is_empty()) {
            log.append(event.clone())?;
        }
        *last = Some(event.seq);

        let (applied, failures) = self.dispatch(&event, watching);
        tracing::debug!(
            maintained = applied.maintained,
            skipped = applied.skipped,
            written = applied.written,
            "applied change"
        );

        if failures.is_empty() {
            Ok(applied)
        } else {
            Err(EngineError::Maintenance(failures))
        }
    }

    /// Applies a batch of events, running distinct streams in parallel
    ///
    /// Events are grouped by stream with their relative order kept. Streams
    /// are spread over at most `parallelism` scoped worker threads
    pub fn apply_batch(&self, events: &[ChangeEvent]) -> BatchReport {
        let lanes: Vec<Vec<&ChangeEvent>> = events.iter().into_group_map_by(|event| event.stream()).into_values().collect();

        let workers = self.config.parallelism.max(1).min(lanes.len());
        if workers <= 1 {
            let mut report = BatchReport::default();
            for event in lanes.into_iter().flatten() {
                report.record(self.apply(event));
            }
            return report;
        }

        let mut shares: Vec<Vec<Vec<&ChangeEvent>>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, lane) in lanes.into_iter().enumerate() {
            shares[i % workers].push(lane);
        }

        tracing::debug!(events = events.len(), workers, "applying batch");

        let mut report = BatchReport::default();
        thread::scope(|scope| {
            let handles: Vec<_> = shares
                .into_iter()
                .map(|share| {
                    scope.spawn(move || {
                        let mut report = BatchReport::default();
                        for event in share.into_iter().flatten() {
                            report.record(self.apply(event));
                        }
                        report
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(share) => report.merge(share),
                    Err(payload) => report.errors.push(EngineError::WorkerPanicked(panic_message(&*payload))),
                }
            }
        });
        report
    }

    fn dispatch(&self, event: &Arc<ChangeEvent>, definitions: &[Arc<dyn Maintainer>]) -> (Applied, Vec<MaintenanceError>) {
        let cx = Context {
            store: &self.store,
            event: &**event,
            primary: self.primary.as_deref(),
            catch_panics: self.config.catch_panics,
        };

        let mut applied = Applied::default();
        let mut failures = Vec::new();
        for definition in definitions.iter().filter(|d| d.accepts(&event.entity)) {
            match definition.maintain(&cx) {
                Ok(Outcome::Skipped) => applied.skipped += 1,
                Ok(Outcome::Written(written)) => {
                    applied.maintained += 1;
                    applied.written += written;
                }
                Err(failure) => {
                    let error = MaintenanceError {
                        kind: failure.kind,
                        definition: definition.name().clone(),
                        view: definition.target().clone(),
                        entity: event.entity.clone(),
                        event: event.clone(),
                        reason: failure.reason,
                    };
                    tracing::warn!(
                        definition = %error.definition,
                        view = %error.view,
                        entity = %error.entity,
                        seq = event.seq,
                        kind = %error.kind,
                        reason = %error.reason,
                        "maintenance failed, view is stale for entity"
                    );
                    self.store.mark_stale(&error.view, &error.entity);
                    self.remember(error.clone());
                    failures.push(error);
                }
            }
        }
        (applied, failures)
    }

    fn remember(&self, failure: MaintenanceError) {
        if self.config.failure_history == 0 {
            return;
        }
        // a poisoned history only loses diagnostics
        if let Ok(mut failures) = self.failures.lock() {
            while failures.len() >= self.config.failure_history {
                failures.pop_front();
            }
            failures.push_back(failure);
        }
    }

    /// The most recent maintenance failures, oldest first
    pub fn failures(&self) -> Vec<MaintenanceError> {
        self.failures
            .lock()
            .map(|failures| failures.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entities whose latest maintenance in `view` failed
    pub fn stale(&self, view: &ViewName) -> Vec<EntityRef> {
        self.store.stale(view)
    }

    /// Rebuilds `view` from scratch by replaying the retained event log
    ///
    /// Live events wait until the rebuild is done. Once the log has evicted
    /// events the view depends on, use [Engine::rebuild_from] with a complete
    /// external log instead
    pub fn rebuild(&self, view: &ViewName) -> Result<Applied, EngineError> {
        let log = self.log.as_ref().ok_or_else(|| EngineError::NoEventLog(view.clone()))?;
        let writers = self.writers(view)?;
        let components: Vec<ComponentName> = writers.iter().map(|w| w.watches().clone()).unique().collect();

        let _exclusive = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        if log.is_evicted(&components)? {
            return Err(EngineError::EventLogEvicted(view.clone()));
        }
        let events = log.events_for(&components)?;
        self.replay(view, writers, events.iter().map(|event| &**event))
    }

    /// Rebuilds `view` from scratch by replaying `events`, which must be in
    /// commit order per stream. Live events wait until the rebuild is done
    pub fn rebuild_from<'e>(&self, view: &ViewName, events: impl IntoIterator<Item = &'e ChangeEvent>) -> Result<Applied, EngineError> {
        let writers = self.writers(view)?;
        let _exclusive = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.replay(view, writers, events)
    }

    fn writers(&self, view: &ViewName) -> Result<&[Arc<dyn Maintainer>], EngineError> {
        self.schema.writers(view).ok_or_else(|| EngineError::UnknownView(view.clone()))
    }

    fn replay<'e>(
        &self,
        view: &ViewName,
        writers: &[Arc<dyn Maintainer>],
        events: impl IntoIterator<Item = &'e ChangeEvent>,
    ) -> Result<Applied, EngineError> {
        let span = tracing::info_span!("rebuild", view = %view);
        let _enter = span.enter();

        self.store.reset(view)?;

        let mut applied = Applied::default();
        let mut failures = Vec::new();
        let mut replayed = 0usize;
        for event in events {
            event.validate()?;
            let definitions: Vec<Arc<dyn Maintainer>> =
                writers.iter().filter(|w| *w.watches() == event.component).cloned().collect();
            if definitions.is_empty() {
                continue;
            }

            let (done, failed) = self.dispatch(&Arc::new(event.clone()), &definitions);
            applied += done;
            failures.extend(failed);
            replayed += 1;
        }

        tracing::info!(
            events = replayed,
            written = applied.written,
            failures = failures.len(),
            "rebuilt view"
        );

        if failures.is_empty() {
            Ok(applied)
        } else {
            Err(EngineError::Maintenance(failures))
        }
    }

    pub fn find<V: ViewValue>(&self, view: &ViewName, lookup: &Lookup) -> Result<Vec<Entry<V>>, EngineError> {
        Ok(self.store.find(view, lookup)?)
    }

    pub fn get<V: ViewValue>(&self, view: &ViewName, key: &Key) -> Result<Option<V>, EngineError> {
        Ok(self.store.get(view, key)?)
    }

    pub fn len(&self, view: &ViewName) -> Result<usize, EngineError> {
        Ok(self.store.len(view)?)
    }

    pub fn is_empty(&self, view: &ViewName) -> Result<bool, EngineError> {
        Ok(self.len(view)? == 0)
    }
}

impl ChangeListener for Engine {
    fn on_change(&self, event: &ChangeEvent) {
        match self.apply(event) {
            Ok(_) => {}
            // already logged and recorded per batch
            Err(EngineError::Maintenance(_)) => {}
            Err(err) => tracing::error!(stream = %event.stream(), seq = event.seq, error = %err, "change rejected"),
        }
    }
}
