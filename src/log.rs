use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use concord_core::{ChangeEvent, ComponentName};

use crate::error::StoreError;

/// The most recent admitted events, in admission order, up to `capacity`
///
/// Replaying the log through a view's definitions reproduces the view, which
/// is how stale views are rebuilt. Once events of a component have been
/// evicted the log can no longer reproduce views over that component, and
/// those views have to be rebuilt from an external log instead
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    inner: RwLock<Retained>,
}

#[derive(Debug, Default)]
struct Retained {
    events: VecDeque<Arc<ChangeEvent>>,
    evicted: HashSet<ComponentName>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        EventLog {
            capacity,
            inner: RwLock::new(Retained::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, event: Arc<ChangeEvent>) -> Result<(), StoreError> {
        let mut inner = self.inner.write()?;
        inner.events.push_back(event);
        while inner.events.len() > self.capacity {
            if let Some(oldest) = inner.events.pop_front() {
                if !inner.evicted.contains(&oldest.component) {
                    tracing::debug!(component = %oldest.component, capacity = self.capacity, "event log evicting");
                    inner.evicted.insert(oldest.component.clone());
                }
            }
        }
        Ok(())
    }

    /// Events touching any of `components`, oldest first
    pub fn events_for(&self, components: &[ComponentName]) -> Result<Vec<Arc<ChangeEvent>>, StoreError> {
        Ok(self
            .inner
            .read()?
            .events
            .iter()
            .filter(|event| components.contains(&event.component))
            .cloned()
            .collect())
    }

    /// True once any event of one of `components` has been evicted
    pub fn is_evicted(&self, components: &[ComponentName]) -> Result<bool, StoreError> {
        let inner = self.inner.read()?;
        Ok(components.iter().any(|component| inner.evicted.contains(component)))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read()?.events.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{EntityId, EntityRef, Snapshot};
    use serde_json::json;

    fn event(seq: u64, component: &str) -> Arc<ChangeEvent> {
        let user = EntityRef::new("user", EntityId::from_u128(1));
        Arc::new(ChangeEvent::created(seq, Snapshot::new(user, component, json!({}))))
    }

    #[test]
    fn filters_by_component() {
        let log = EventLog::new(16);
        for (seq, component) in [(1, "login"), (1, "profile"), (2, "login")] {
            log.append(event(seq, component)).unwrap();
        }

        let logins = log.events_for(&["login".into()]).unwrap();
        assert_eq!(logins.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn oldest_events_are_evicted() {
        let log = EventLog::new(2);
        log.append(event(1, "profile")).unwrap();
        log.append(event(1, "login")).unwrap();
        assert!(!log.is_evicted(&["profile".into(), "login".into()]).unwrap());

        log.append(event(2, "login")).unwrap();
        assert_eq!(log.len().unwrap(), 2);
        assert!(log.is_evicted(&["profile".into()]).unwrap());
        assert!(!log.is_evicted(&["login".into()]).unwrap());
        assert!(log.events_for(&["profile".into()]).unwrap().is_empty());
    }
}
