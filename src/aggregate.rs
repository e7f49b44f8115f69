//! Aggregates
//!
//! An [Accumulator] folds snapshots into one value per group key. It is
//! driven as an ordinary definition: `prev` looks up the accumulator of the
//! old snapshot's group, and `update` removes the old snapshot from it and
//! adds the new snapshot to the accumulator of the new group

use concord_core::{ComponentName, EntityRef, EntityType, Key, Lookup, Snapshot};
use serde::{Deserialize, Serialize};

use crate::definition::{Definition, Entry, Prev, Upsert, ViewValue};
use crate::error::DefinitionError;
use crate::store::ViewHandle;

pub trait Accumulator: Send + Sync + 'static {
    type Acc: ViewValue;

    fn watches(&self) -> &ComponentName;

    fn entity_type(&self) -> Option<&EntityType> {
        None
    }

    /// The group `snapshot` contributes to. `None` leaves it out of the aggregate
    fn group(&self, snapshot: &Snapshot) -> Option<Key>;

    fn zero(&self) -> Self::Acc;

    fn add(&self, acc: Self::Acc, snapshot: &Snapshot) -> Self::Acc;

    fn remove(&self, acc: Self::Acc, snapshot: &Snapshot) -> Self::Acc;

    /// Empty accumulators are deleted from the view
    fn is_empty(&self, _acc: &Self::Acc) -> bool {
        false
    }
}

/// Adapts an [Accumulator] to a [Definition]
pub struct AggregateView<A>(pub A);

impl<A: Accumulator> AggregateView<A> {
    fn write(&self, key: Key, acc: A::Acc) -> Upsert<A::Acc> {
        if self.0.is_empty(&acc) {
            Upsert::delete(key)
        } else {
            Upsert::put(key, acc)
        }
    }
}

impl<A: Accumulator> Definition for AggregateView<A> {
    type Value = A::Acc;

    fn watches(&self) -> &ComponentName {
        self.0.watches()
    }

    fn entity_type(&self) -> Option<&EntityType> {
        self.0.entity_type()
    }

    fn prev(&self, _view: &ViewHandle<'_, A::Acc>, _entity: &EntityRef, old: Option<&Snapshot>) -> Result<Prev<A::Acc>, DefinitionError> {
        Ok(match old.and_then(|old| self.0.group(old)) {
            Some(group) => Prev::Lookup(Lookup::Eq(group)),
            None => Prev::none(),
        })
    }

    fn update(
        &self,
        view: &mut ViewHandle<'_, A::Acc>,
        old_entries: Vec<Entry<A::Acc>>,
        _entity: &EntityRef,
        old: Option<&Snapshot>,
        new: Option<&Snapshot>,
    ) -> Result<Vec<Upsert<A::Acc>>, DefinitionError> {
        let acc = &self.0;

        let mut left = old.and_then(|old| {
            let group = acc.group(old)?;
            let current = old_entries
                .into_iter()
                .find(|entry| entry.key == group)
                .map(|entry| entry.value)
                .unwrap_or_else(|| acc.zero());
            Some((group, acc.remove(current, old)))
        });

        let mut writes = Vec::with_capacity(2);
        if let Some((group, new)) = new.and_then(|new| Some((acc.group(new)?, new))) {
            let current = match left.take() {
                Some((old_group, current)) if old_group == group => current,
                other => {
                    left = other;
                    view.get(&group).unwrap_or_else(|| acc.zero())
                }
            };
            writes.push(self.write(group, acc.add(current, new)));
        }

        if let Some((group, current)) = left {
            writes.push(self.write(group, current));
        }
        Ok(writes)
    }
}

/// Counts snapshots per group
pub struct Count<G> {
    watches: ComponentName,
    group: G,
}

impl<G> Count<G>
where
    G: Fn(&Snapshot) -> Option<Key> + Send + Sync + 'static,
{
    pub fn new(watches: impl Into<ComponentName>, group: G) -> Self {
        Count {
            watches: watches.into(),
            group,
        }
    }
}

impl<G> Accumulator for Count<G>
where
    G: Fn(&Snapshot) -> Option<Key> + Send + Sync + 'static,
{
    type Acc = u64;

    fn watches(&self) -> &ComponentName {
        &self.watches
    }

    fn group(&self, snapshot: &Snapshot) -> Option<Key> {
        (self.group)(snapshot)
    }

    fn zero(&self) -> u64 {
        0
    }

    fn add(&self, acc: u64, _snapshot: &Snapshot) -> u64 {
        acc + 1
    }

    fn remove(&self, acc: u64, _snapshot: &Snapshot) -> u64 {
        acc.saturating_sub(1)
    }

    fn is_empty(&self, acc: &u64) -> bool {
        *acc == 0
    }
}

/// The running state of a [Sum]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub count: u64,
    pub total: i64,
}

/// Sums an integer field per group. Snapshots without the field count as 0
pub struct Sum<G> {
    watches: ComponentName,
    field: String,
    group: G,
}

impl<G> Sum<G>
where
    G: Fn(&Snapshot) -> Option<Key> + Send + Sync + 'static,
{
    pub fn new(watches: impl Into<ComponentName>, field: &str, group: G) -> Self {
        Sum {
            watches: watches.into(),
            field: field.to_string(),
            group,
        }
    }

    fn value(&self, snapshot: &Snapshot) -> i64 {
        snapshot.int_field(&self.field).unwrap_or(0)
    }
}

impl<G> Accumulator for Sum<G>
where
    G: Fn(&Snapshot) -> Option<Key> + Send + Sync + 'static,
{
    type Acc = Tally;

    fn watches(&self) -> &ComponentName {
        &self.watches
    }

    fn group(&self, snapshot: &Snapshot) -> Option<Key> {
        (self.group)(snapshot)
    }

    fn zero(&self) -> Tally {
        Tally::default()
    }

    fn add(&self, acc: Tally, snapshot: &Snapshot) -> Tally {
        Tally {
            count: acc.count + 1,
            total: acc.total.saturating_add(self.value(snapshot)),
        }
    }

    fn remove(&self, acc: Tally, snapshot: &Snapshot) -> Tally {
        Tally {
            count: acc.count.saturating_sub(1),
            total: acc.total.saturating_sub(self.value(snapshot)),
        }
    }

    fn is_empty(&self, acc: &Tally) -> bool {
        acc.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Entries;
    use concord_core::{key, EntityId, ViewName};
    use serde_json::json;

    fn by_author(snapshot: &Snapshot) -> Option<Key> {
        snapshot.str_field("author").map(|author| key![author])
    }

    fn post(author: &str, likes: i64) -> Snapshot {
        Snapshot::new(
            EntityRef::new("post", EntityId::from_u128(1)),
            "post",
            json!({ "author": author, "likes": likes }),
        )
    }

    fn run<A: Accumulator>(
        aggr: &AggregateView<A>,
        committed: &Entries<A::Acc>,
        old: Option<&Snapshot>,
        new: Option<&Snapshot>,
    ) -> Vec<Upsert<A::Acc>> {
        let view = ViewName::new("v");
        let entity = EntityRef::new("post", EntityId::from_u128(1));
        let mut handle = ViewHandle::new(&view, committed, None);
        let old_entries = match aggr.prev(&handle, &entity, old).unwrap() {
            Prev::Lookup(lookup) => handle.find(&lookup),
            Prev::Resolved(entries) => entries,
            Prev::Skip => return Vec::new(),
        };
        let mut writes = aggr.update(&mut handle, old_entries, &entity, old, new).unwrap();
        writes.sort_by(|a, b| a.key.cmp(&b.key));
        writes
    }

    #[test]
    fn count_moves_between_groups() {
        let aggr = AggregateView(Count::new("post", by_author));
        let committed: Entries<u64> = [(key!["ann"], 1), (key!["bob"], 4)].into_iter().collect();

        let writes = run(&aggr, &committed, Some(&post("ann", 0)), Some(&post("bob", 0)));
        assert_eq!(writes, vec![Upsert::delete(key!["ann"]), Upsert::put(key!["bob"], 5)]);

        let writes = run(&aggr, &committed, Some(&post("bob", 0)), Some(&post("bob", 3)));
        assert_eq!(writes, vec![Upsert::put(key!["bob"], 4)]);

        let writes = run(&aggr, &committed, None, Some(&post("cat", 0)));
        assert_eq!(writes, vec![Upsert::put(key!["cat"], 1)]);
    }

    #[test]
    fn sum_tracks_totals() {
        let aggr = AggregateView(Sum::new("post", "likes", by_author));
        let committed: Entries<Tally> = [(key!["ann"], Tally { count: 2, total: 10 })].into_iter().collect();

        let writes = run(&aggr, &committed, Some(&post("ann", 4)), Some(&post("ann", 7)));
        assert_eq!(writes, vec![Upsert::put(key!["ann"], Tally { count: 2, total: 13 })]);

        let writes = run(&aggr, &committed, Some(&post("ann", 4)), None);
        assert_eq!(writes, vec![Upsert::put(key!["ann"], Tally { count: 1, total: 6 })]);
    }
}
