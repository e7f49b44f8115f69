use std::sync::Arc;

use concord::extract::{self, Normalize};
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

const U1: EntityId = EntityId::from_u128(0x0001);
const U2: EntityId = EntityId::from_u128(0x0002);

fn user(id: EntityId) -> EntityRef {
    EntityRef::new("user", id)
}

fn login(id: EntityId, data: serde_json::Value) -> Snapshot {
    Snapshot::new(user(id), "login", data)
}

fn login_keys(snapshot: &Snapshot) -> Vec<Key> {
    extract::fields(snapshot, &["username", "email"], Normalize::CaseFold)
}

/// Every username and email of a user resolves to that user
fn login_index() -> impl Definition<Value = EntityId> {
    view::<EntityId, _, _>(
        "login",
        |_, _, old| {
            Ok(match old {
                Some(old) => Prev::Lookup(Lookup::any_of(login_keys(old))),
                None => Prev::none(),
            })
        },
        |_, old_entries, entity, _, new| {
            let keys = new.map(login_keys).unwrap_or_default();
            Ok(extract::reconcile(old_entries, keys, entity.id))
        },
    )
    .for_entity_type("user")
}

fn schema() -> SchemaBuilder {
    let mut schema = SchemaBuilder::new();
    schema
        .entity_type("user")
        .unwrap()
        .component("login")
        .unwrap()
        .component("profile")
        .unwrap();
    schema
}

#[test]
fn login_index_follows_username_changes() {
    trace();

    let mut schema = schema();
    schema.new_view("logins", login_index()).unwrap();

    let journal = Arc::new(MemoryJournal::new());
    let engine = Engine::builder(schema.seal()).journal(journal.clone()).open().unwrap();
    let logins = ViewName::new("logins");

    let bob = login(U1, json!({ "username": "bob", "email": "b@x.com" }));
    let applied = engine.apply(&ChangeEvent::created(1, bob.clone())).unwrap();
    assert_eq!(applied, Applied { maintained: 1, skipped: 0, written: 2 });

    assert_eq!(
        engine.find::<EntityId>(&logins, &Lookup::All).unwrap(),
        vec![Entry::new(key!["b@x.com"], U1), Entry::new(key!["bob"], U1)]
    );

    let robert = login(U1, json!({ "username": "robert", "email": "b@x.com" }));
    let applied = engine.apply(&ChangeEvent::updated(2, bob, robert)).unwrap();

    // ["b@x.com"] is untouched, only the username moves
    assert_eq!(applied.written, 2);
    assert_eq!(journal.records(), 4);
    assert_eq!(
        engine.find::<EntityId>(&logins, &Lookup::All).unwrap(),
        vec![Entry::new(key!["b@x.com"], U1), Entry::new(key!["robert"], U1)]
    );
    assert_eq!(engine.get::<EntityId>(&logins, &key!["bob"]).unwrap(), None);
}

#[test]
fn multi_valued_fields_project_to_many_keys() {
    trace();

    let mut schema = schema();
    schema.new_view("logins", login_index()).unwrap();
    let engine = schema.build(EngineConfig::default()).unwrap();
    let logins = ViewName::new("logins");

    let ann = login(U2, json!({ "username": " Ann ", "email": ["ann@x.io", "ANN@x.io", ""] }));
    engine.apply(&ChangeEvent::created(1, ann.clone())).unwrap();

    assert_eq!(
        engine.find::<EntityId>(&logins, &Lookup::any_of([key!["ann"], key!["ann@x.io"], key!["nobody"]])).unwrap(),
        vec![Entry::new(key!["ann"], U2), Entry::new(key!["ann@x.io"], U2)]
    );

    // an entity type the definition doesn't follow is ignored
    let bot = Snapshot::new(EntityRef::new("bot", U1), "login", json!({ "username": "crawler" }));
    let applied = engine.apply(&ChangeEvent::created(1, bot)).unwrap();
    assert_eq!(applied, Applied::default());
    assert_eq!(engine.len(&logins).unwrap(), 2);

    engine.apply(&ChangeEvent::deleted(2, ann)).unwrap();
    assert!(engine.is_empty(&logins).unwrap());
}

#[test]
fn shared_view_partitions() {
    trace();

    fn by_field(component: &str, field: &'static str, partition: &'static str) -> impl Definition<Value = EntityId> {
        let keys = move |s: &Snapshot| -> Vec<Key> {
            extract::fields(s, &[field], Normalize::CaseFold)
                .iter()
                .map(|k| Key::prefixed(Scalar::from(partition), k))
                .collect()
        };
        let prev_keys = keys.clone();
        view::<EntityId, _, _>(
            component,
            move |_, _, old| {
                Ok(match old {
                    Some(old) => Prev::Lookup(Lookup::any_of(prev_keys(old))),
                    None => Prev::none(),
                })
            },
            move |_, old_entries, entity, _, new| Ok(extract::reconcile(old_entries, new.map(&keys).unwrap_or_default(), entity.id)),
        )
    }

    let mut schema = schema();
    schema
        .new_view_with("by-username", by_field("login", "username", "login"), ViewOptions::shared("contacts", "login"))
        .unwrap()
        .new_view_with("by-nickname", by_field("profile", "nickname", "profile"), ViewOptions::shared("contacts", "profile"))
        .unwrap();
    let engine = schema.build(EngineConfig::default()).unwrap();
    let contacts = ViewName::new("contacts");

    engine.apply(&ChangeEvent::created(1, login(U1, json!({ "username": "bob" })))).unwrap();
    engine
        .apply(&ChangeEvent::created(1, Snapshot::new(user(U1), "profile", json!({ "nickname": "bob" }))))
        .unwrap();
    engine
        .apply(&ChangeEvent::created(1, Snapshot::new(user(U2), "profile", json!({ "nickname": "Bobcat" }))))
        .unwrap();

    // the same value under two partitions is two keys
    assert_eq!(engine.len(&contacts).unwrap(), 3);
    assert_eq!(
        engine.find::<EntityId>(&contacts, &Lookup::prefix(key!["profile"])).unwrap(),
        vec![Entry::new(key!["profile", "bob"], U1), Entry::new(key!["profile", "bobcat"], U2)]
    );
    assert_eq!(engine.schema().views(), vec![&contacts]);
}

#[test]
fn update_reads_other_components_through_primary_storage() {
    trace();

    // username -> display name, taken from the user's profile
    let directory = view::<String, _, _>(
        "login",
        |_, _, old| {
            Ok(match old.and_then(|s| s.str_field("username")) {
                Some(name) => Prev::Lookup(Lookup::eq(key![name])),
                None => Prev::none(),
            })
        },
        |view, old_entries, entity, _, new| {
            for entry in old_entries {
                view.delete(entry.key);
            }
            let Some(username) = new.and_then(|s| s.str_field("username")) else {
                return Ok(Vec::new());
            };
            let profile = view.component(entity, &"profile".into())?;
            let display = profile
                .as_ref()
                .and_then(|p| p.str_field("display"))
                .ok_or_else(|| DefinitionError::MissingField("display".to_string()))?;
            Ok(vec![Upsert::put(key![username], display.to_string())])
        },
    );

    let mut schema = schema();
    schema.new_view("directory", directory).unwrap();

    let primary = Arc::new(MemoryPrimary::new());
    let engine = Engine::builder(schema.seal()).primary(primary.clone()).open().unwrap();
    let directory = ViewName::new("directory");

    engine.on_change(&primary.put(Snapshot::new(user(U1), "profile", json!({ "display": "Bob B." }))));
    engine.on_change(&primary.put(login(U1, json!({ "username": "bob" }))));
    assert_eq!(engine.get::<String>(&directory, &key!["bob"]).unwrap(), Some("Bob B.".to_string()));

    engine.on_change(&primary.put(login(U1, json!({ "username": "bobby" }))));
    assert_eq!(
        engine.find::<String>(&directory, &Lookup::All).unwrap(),
        vec![Entry::new(key!["bobby"], "Bob B.".to_string())]
    );

    // no profile: the batch is abandoned and the view keeps its last good state
    engine.on_change(&primary.put(login(U2, json!({ "username": "ghost" }))));
    assert_eq!(engine.len(&directory).unwrap(), 1);
    assert_eq!(engine.stale(&directory), vec![user(U2)]);

    let failures = engine.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::Update);
    assert_eq!(failures[0].definition, DefinitionName::new("directory"));
    assert_eq!(failures[0].event.seq, 1);
}
