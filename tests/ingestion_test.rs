use peopledb::{Database, Options};
use serde_json::json;

fn test_db() -> std::sync::Arc<Database> {
    Database::new(Options { num_workers: 2, partition_count: 8, ..Options::default() })
}

#[test]
fn insert_grows_schema_permissively() {
    let _ = env_logger::try_init();
    let db = test_db();

    let accepted = db
        .insert(
            "alice",
            &[json!({"__time": 1, "__action": "view", "country": "us", "page": "home"})],
            0,
        )
        .unwrap();
    assert_eq!(accepted, 1);

    // A column introduced by a later insert is auto-added rather than rejected.
    let accepted = db
        .insert("alice", &[json!({"__time": 2, "__action": "click", "button": "buy"})], 0)
        .unwrap();
    assert_eq!(accepted, 1);

    db.shutdown();
}

#[test]
fn duplicate_rows_are_not_double_counted() {
    let _ = env_logger::try_init();
    let db = test_db();

    let row = json!({"__time": 1, "__action": "view", "country": "us"});
    assert_eq!(db.insert("alice", &[row.clone()], 0).unwrap(), 1);
    assert_eq!(db.insert("alice", &[row.clone()], 0).unwrap(), 0);
    // A third, distinct row is still accepted.
    let row2 = json!({"__time": 2, "__action": "view", "country": "us"});
    assert_eq!(db.insert("alice", &[row2], 0).unwrap(), 1);

    db.shutdown();
}

#[test]
fn batched_insert_accepts_every_distinct_row() {
    let _ = env_logger::try_init();
    let db = test_db();

    let rows: Vec<_> = (0..20)
        .map(|i| json!({"__time": i, "__action": "view", "country": "us"}))
        .collect();
    let accepted = db.insert("alice", &rows, 0).unwrap();
    assert_eq!(accepted, 20);

    db.shutdown();
}

#[test]
fn distinct_persons_land_on_partitions_owned_by_this_node() {
    let _ = env_logger::try_init();
    let db = test_db();

    for i in 0..200 {
        let id = format!("person_{i}");
        db.insert(&id, &[json!({"__time": 0, "__action": "view", "country": "us"})], 0)
            .unwrap();
    }

    let result = db
        .query("if country == \"us\":\n    tally(1):\n        n = count(1)\n", 0)
        .unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["columns"]["0"], 200);

    db.shutdown();
}

#[test]
fn strict_schema_mode_rejects_unknown_columns() {
    let _ = env_logger::try_init();
    let db = Database::new(Options {
        num_workers: 1,
        partition_count: 1,
        schema_mode: peopledb::schema::SchemaMode::Strict,
        ..Options::default()
    });

    let err = db
        .insert("alice", &[json!({"__time": 1, "__action": "view", "country": "us"})], 0)
        .unwrap_err();
    assert!(matches!(err, peopledb::errors::Error::BadSchema(_)));

    db.shutdown();
}
