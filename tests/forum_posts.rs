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

fn post(id: u128, author: &str, title: &str, likes: i64) -> Snapshot {
    Snapshot::new(
        EntityRef::new("post", EntityId::from_u128(id)),
        "forum-post",
        json!({ "author": author, "title": title, "likes": likes }),
    )
}

fn by_author(snapshot: &Snapshot) -> Option<Key> {
    snapshot.str_field("author").map(|author| key![author])
}

fn schema() -> SchemaBuilder {
    let mut schema = SchemaBuilder::new();
    schema.entity_type("post").unwrap().component("forum-post").unwrap();
    schema
}

#[test]
fn posts_per_author_by_hand() {
    trace();

    // counts a post once, when it is created
    let posts_per_author = view::<u64, _, _>(
        "forum-post",
        |_, _, old| Ok(if old.is_some() { Prev::Skip } else { Prev::none() }),
        |view, _, _, _, new| {
            let Some(author) = new.and_then(by_author) else {
                return Ok(Vec::new());
            };
            let count = view.get(&author).unwrap_or(0);
            Ok(vec![Upsert::put(author, count + 1)])
        },
    );

    let mut schema = schema();
    schema.new_aggr_with("posts-per-author", Count::new("forum-post", by_author), ViewOptions::default()).unwrap();
    schema.new_view("posts-per-author-by-hand", posts_per_author).unwrap();
    let engine = schema.build(EngineConfig::default()).unwrap();

    for view in [ViewName::new("posts-per-author"), ViewName::new("posts-per-author-by-hand")] {
        assert_eq!(engine.get::<u64>(&view, &key!["A"]).unwrap(), None);
    }

    engine.apply(&ChangeEvent::created(1, post(1, "A", "first", 0))).unwrap();
    for view in [ViewName::new("posts-per-author"), ViewName::new("posts-per-author-by-hand")] {
        assert_eq!(engine.get::<u64>(&view, &key!["A"]).unwrap(), Some(1));
    }

    engine.apply(&ChangeEvent::created(1, post(2, "A", "second", 0))).unwrap();
    for view in [ViewName::new("posts-per-author"), ViewName::new("posts-per-author-by-hand")] {
        assert_eq!(engine.get::<u64>(&view, &key!["A"]).unwrap(), Some(2));
    }

    // a title edit is not a new post
    let applied = engine
        .apply(&ChangeEvent::updated(2, post(2, "A", "second", 0), post(2, "A", "second, edited", 0)))
        .unwrap();
    assert_eq!(applied.skipped, 1);
    for view in [ViewName::new("posts-per-author"), ViewName::new("posts-per-author-by-hand")] {
        assert_eq!(engine.get::<u64>(&view, &key!["A"]).unwrap(), Some(2));
    }
}

#[test]
fn counts_move_with_the_author() {
    trace();

    let mut schema = schema();
    schema.new_aggr("posts-per-author", Count::new("forum-post", by_author)).unwrap();
    let engine = schema.build(EngineConfig::default()).unwrap();
    let counts = ViewName::new("posts-per-author");

    engine.apply(&ChangeEvent::created(1, post(1, "A", "one", 0))).unwrap();
    engine.apply(&ChangeEvent::created(1, post(2, "A", "two", 0))).unwrap();
    engine.apply(&ChangeEvent::created(1, post(3, "B", "three", 0))).unwrap();

    engine
        .apply(&ChangeEvent::updated(2, post(3, "B", "three", 0), post(3, "A", "three", 0)))
        .unwrap();
    assert_eq!(
        engine.find::<u64>(&counts, &Lookup::All).unwrap(),
        vec![Entry::new(key!["A"], 3)]
    );

    engine.apply(&ChangeEvent::deleted(2, post(1, "A", "one", 0))).unwrap();
    engine.apply(&ChangeEvent::deleted(2, post(2, "A", "two", 0))).unwrap();
    engine.apply(&ChangeEvent::deleted(3, post(3, "A", "three", 0))).unwrap();
    assert!(engine.is_empty(&counts).unwrap());
}

#[test]
fn likes_per_author() {
    trace();

    let mut schema = schema();
    schema.new_aggr("likes", Sum::new("forum-post", "likes", by_author)).unwrap();
    let engine = schema.build(EngineConfig::default()).unwrap();
    let likes = ViewName::new("likes");

    engine.apply(&ChangeEvent::created(1, post(1, "A", "one", 5))).unwrap();
    engine.apply(&ChangeEvent::created(1, post(2, "A", "two", 3))).unwrap();
    engine
        .apply(&ChangeEvent::updated(2, post(2, "A", "two", 3), post(2, "A", "two", 10)))
        .unwrap();

    assert_eq!(
        engine.get::<Tally>(&likes, &key!["A"]).unwrap(),
        Some(Tally { count: 2, total: 15 })
    );

    // posts without an author are left out
    let anonymous = Snapshot::new(
        EntityRef::new("post", EntityId::from_u128(9)),
        "forum-post",
        json!({ "likes": 100 }),
    );
    engine.apply(&ChangeEvent::created(1, anonymous)).unwrap();
    assert_eq!(engine.len(&likes).unwrap(), 1);
}
