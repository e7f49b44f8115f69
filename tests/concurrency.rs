use std::sync::Arc;
use std::thread;

use concord::*;
use serde_json::json;

fn trace() {
    std::env::set_var("RUST_BACKTRACE", "1");

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

const WRITERS: u128 = 8;
const POSTS: u128 = 50;
const AUTHORS: [&str; 3] = ["ann", "bob", "cat"];

fn post(id: u128, author: &str) -> Snapshot {
    Snapshot::new(
        EntityRef::new("post", EntityId::from_u128(id)),
        "forum-post",
        json!({ "author": author }),
    )
}

fn by_author(snapshot: &Snapshot) -> Option<Key> {
    snapshot.str_field("author").map(|author| key![author])
}

fn engine(parallelism: usize) -> Engine {
    let mut schema = SchemaBuilder::new();
    schema.component("forum-post").unwrap();
    schema.new_aggr("posts-per-author", Count::new("forum-post", by_author)).unwrap();
    schema.new_aggr("posts", Count::new("forum-post", |_: &Snapshot| Some(key!["all"]))).unwrap();
    schema.build(EngineConfig::default().with_parallelism(parallelism)).unwrap()
}

/// Each post is created by one author and then handed around the others
fn history(id: u128) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let mut current = post(id, AUTHORS[0]);
    events.push(ChangeEvent::created(1, current.clone()));
    for (seq, author) in AUTHORS.iter().cycle().skip(1).take(id as usize % 5).enumerate() {
        let next = post(id, author);
        events.push(ChangeEvent::updated(seq as u64 + 2, current, next.clone()));
        current = next;
    }
    events
}

fn final_author(id: u128) -> &'static str {
    AUTHORS[(id as usize % 5) % AUTHORS.len()]
}

fn assert_counts(engine: &Engine, ids: impl Iterator<Item = u128> + Clone) {
    let total = ids.clone().count() as u64;
    let posts_per_author = ViewName::new("posts-per-author");
    for author in AUTHORS {
        let expected = ids.clone().filter(|id| final_author(*id) == author).count() as u64;
        let found = engine.get::<u64>(&posts_per_author, &key![author]).unwrap();
        assert_eq!(found.unwrap_or(0), expected, "posts by {}", author);
    }
    assert_eq!(engine.get::<u64>(&"posts".into(), &key!["all"]).unwrap(), Some(total));
}

#[test]
fn concurrent_writers_share_views() {
    trace();

    let engine = Arc::new(engine(1));
    let listener: Arc<dyn ChangeListener> = engine.clone();

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let listener = listener.clone();
            thread::spawn(move || {
                for id in (0..POSTS).map(|n| writer * POSTS + n) {
                    for event in history(id) {
                        listener.on_change(&event);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.failures().is_empty());
    assert_counts(&engine, 0..WRITERS * POSTS);
}

#[test]
fn batches_keep_stream_order() {
    trace();

    let engine = engine(4);
    let ids = 0..POSTS;

    // interleave the streams, each stream's own events stay in order
    let histories: Vec<Vec<ChangeEvent>> = ids.clone().map(history).collect();
    let longest = histories.iter().map(Vec::len).max().unwrap_or(0);
    let events: Vec<ChangeEvent> = (0..longest)
        .flat_map(|i| histories.iter().filter_map(move |h| h.get(i).cloned()))
        .collect();

    let report = engine.apply_batch(&events);
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.applied.maintained, events.len() * 2);
    assert_counts(&engine, ids.clone());

    // a second delivery of the same batch is rejected stream by stream
    let report = engine.apply_batch(&events);
    assert_eq!(report.errors.len(), events.len());
    assert!(report
        .errors
        .iter()
        .all(|err| matches!(err, EngineError::OutOfOrder { .. })));
    assert_counts(&engine, ids);
}

#[test]
fn rebuilds_never_race_live_events() {
    trace();

    let engine = engine(1);
    let posts = ViewName::new("posts");
    let total = 3000u128;

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for id in 0..total {
                engine.apply(&ChangeEvent::created(1, post(id, AUTHORS[id as usize % 3]))).unwrap();
            }
        });

        while !writer.is_finished() {
            engine.rebuild(&posts).unwrap();
        }
        writer.join().unwrap();
    });

    assert_eq!(engine.get::<u64>(&posts, &key!["all"]).unwrap(), Some(total as u64));

    engine.rebuild(&posts).unwrap();
    assert_eq!(engine.get::<u64>(&posts, &key!["all"]).unwrap(), Some(total as u64));
}
