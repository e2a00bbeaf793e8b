use peopledb::{Database, Options};
use serde_json::json;

fn test_db() -> std::sync::Arc<Database> {
    Database::new(Options { num_workers: 2, partition_count: 4, ..Options::default() })
}

fn seed(db: &Database) {
    db.insert(
        "alice",
        &[
            json!({"__time": 1000, "__action": "view", "country": "us", "price": 10.0}),
            json!({"__time": 2000, "__action": "purchase", "country": "us", "price": 25.0}),
        ],
        0,
    )
    .unwrap();
    db.insert(
        "bob",
        &[json!({"__time": 1500, "__action": "view", "country": "fr", "price": 5.0})],
        0,
    )
    .unwrap();
    db.insert(
        "carol",
        &[
            json!({"__time": 1200, "__action": "view", "country": "us", "price": 3.0}),
            json!({"__time": 1800, "__action": "view", "country": "us", "price": 7.0}),
        ],
        0,
    )
    .unwrap();
}

#[test]
fn tally_counts_matching_persons() {
    let db = test_db();
    seed(&db);

    let result = db
        .query("if country == \"us\":\n    tally(1):\n        n = count(1)\n", 0)
        .unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["columns"]["0"], 2);

    db.shutdown();
}

#[test]
fn tally_groups_by_key_expression() {
    let db = test_db();
    seed(&db);

    let result = db
        .query("tally(country):\n    n = count(1)\n", 0)
        .unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        let key = row["key"][0].as_str().unwrap();
        let n = row["columns"]["0"].as_u64().unwrap();
        match key {
            "us" => assert_eq!(n, 2),
            "fr" => assert_eq!(n, 1),
            other => panic!("unexpected key {other}"),
        }
    }

    db.shutdown();
}

#[test]
fn for_events_sums_a_numeric_field() {
    let db = test_db();
    seed(&db);

    let src = "\
for_events:
    tally(1):
        total = sum(price)
";
    let result = db.query(src, 0).unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let total = rows[0]["columns"]["0"].as_f64().unwrap();
    assert!((total - 50.0).abs() < 1e-9);

    db.shutdown();
}

#[test]
fn no_matches_yields_empty_result() {
    let db = test_db();
    seed(&db);

    let result = db
        .query("if country == \"de\":\n    tally(1):\n        n = count(1)\n", 0)
        .unwrap();
    assert_eq!(result.as_array().unwrap().len(), 0);

    db.shutdown();
}

#[test]
fn declared_segment_is_materialized_and_counted() {
    let db = test_db();
    seed(&db);

    // A query that is only a segment declaration reports each segment's
    // population rather than a tally result tree.
    let src = "segment us_viewers:\n    if country == \"us\":\n        tally(1):\n            n = count(1)\n";
    let result = db.query(src, 0).unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "us_viewers");
    assert_eq!(rows[0]["population"], 2);

    db.shutdown();
}

#[test]
fn segment_math_reuses_cached_population_without_iterating() {
    let db = test_db();
    seed(&db);

    // Materialize the segment once.
    db.query("segment us_viewers:\n    if country == \"us\":\n        tally(1):\n            n = count(1)\n", 0)
        .unwrap();

    // A later bare population() expression is flagged as segment math and
    // resolves straight from the cached bitmap.
    let result = db.query("population(us_viewers)\n", 0).unwrap();
    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert!((rows[0]["columns"]["0"].as_f64().unwrap() - 2.0).abs() < 1e-9);

    db.shutdown();
}

#[test]
fn empty_database_returns_empty_result() {
    let db = test_db();
    let result = db
        .query("if country == \"us\":\n    tally(1):\n        n = count(1)\n", 0)
        .unwrap();
    assert_eq!(result.as_array().unwrap().len(), 0);
    db.shutdown();
}

#[test]
fn bad_query_source_is_a_compile_error() {
    let db = test_db();
    let err = db.query("this is not valid @@ syntax\n", 0).unwrap_err();
    assert!(matches!(err, peopledb::errors::Error::QueryCompile(_)));
    db.shutdown();
}
