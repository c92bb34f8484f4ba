//! End-to-end tests for the persistence pipeline.
//!
//! Drives the store through its public surface the way session runners
//! do, across threads:
//!
//! A. Accepted writes keep their submission order
//! B. Concurrent producers, every accepted write accounted for
//! C. Stop mid-stream: rows match successful receipts exactly
//! D. Identical timestamps from many threads share one timeline row
//! E. Repeated output reuses its cache reference through the pipeline

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use tracemon::data_unit::DataUnit;
use tracemon::schema::{self, Field, SchemaRegistry, Value};
use tracemon::store::{StoreHandle, TraceStore};

// =============================================================================
// Fixtures
// =============================================================================

fn registry_with(tables: Vec<schema::Table>) -> Arc<SchemaRegistry> {
    let registry = Arc::new(SchemaRegistry::new());
    for table in tables {
        registry.register(table).expect("register");
    }
    registry
}

fn ticks_table() -> schema::Table {
    schema::Table::new("Ticks", vec![Field::integer("Seq")], vec![], vec![])
}

fn metrics_table() -> schema::Table {
    let (fields, fks) = schema::with_time_ref(vec![Field::real("Load")]);
    schema::Table::new("Metrics", fields, fks, vec![])
}

fn snapshots_table() -> schema::Table {
    let (fields, fks) = schema::with_time_ref(vec![Field::text("Tool")]);
    let (fields, _) = schema::with_output_ref(fields);
    schema::Table::new("Snapshots", fields, fks, vec![])
}

fn started(registry: Arc<SchemaRegistry>) -> (TraceStore, StoreHandle) {
    let mut store = TraceStore::in_memory(registry).expect("in-memory store");
    store
        .start(Arc::new(AtomicBool::new(false)))
        .expect("start");
    let handle = store.handle();
    (store, handle)
}

fn add_host(handle: &StoreHandle, name: &str) -> i64 {
    handle
        .execute(
            "INSERT INTO TraceHost VALUES (NULL, ?1)",
            &[vec![Value::from(name)]],
        )
        .expect("insert host")
        .last_insert_id
}

fn count(handle: &StoreHandle, sql: &str) -> i64 {
    let rows = handle.query(sql, vec![]).expect("count query");
    rows[0][0].as_integer().expect("integer count")
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn accepted_writes_keep_their_order() {
    let registry = registry_with(vec![ticks_table()]);
    let (mut store, handle) = started(Arc::clone(&registry));
    let table = registry.get("Ticks").expect("table");

    let mut last = None;
    for seq in 0..200i64 {
        let mut unit =
            DataUnit::new(Arc::clone(&table), vec![vec![Value::Integer(seq)]]).expect("unit");
        if seq == 199 {
            last = unit.receipt();
        }
        assert!(handle.enqueue(unit));
    }
    last.expect("receipt").wait().expect("final write");

    let rows = handle
        .query("SELECT Seq FROM Ticks ORDER BY rowid", vec![])
        .expect("query");
    let seqs: Vec<i64> = rows.iter().filter_map(|r| r[0].as_integer()).collect();
    assert_eq!(seqs, (0..200).collect::<Vec<_>>());
    assert!(store.stop(Duration::from_secs(5)));
}

#[test]
fn concurrent_producers_lose_nothing() {
    let registry = registry_with(vec![ticks_table()]);
    let (mut store, handle) = started(Arc::clone(&registry));
    let table = registry.get("Ticks").expect("table");

    let mut producers = Vec::new();
    for t in 0..4i64 {
        let handle = handle.clone();
        let table = Arc::clone(&table);
        producers.push(thread::spawn(move || {
            let mut receipts = Vec::new();
            for i in 0..250i64 {
                let mut unit =
                    DataUnit::new(Arc::clone(&table), vec![vec![Value::Integer(t * 1000 + i)]])
                        .expect("unit");
                receipts.push(unit.receipt().expect("fresh receipt"));
                assert!(handle.enqueue(unit));
            }
            receipts
        }));
    }
    for producer in producers {
        for receipt in producer.join().expect("producer") {
            receipt.wait().expect("write");
        }
    }

    assert_eq!(count(&handle, "SELECT count(*) FROM Ticks"), 1000);
    assert!(store.stop(Duration::from_secs(5)));
}

#[test]
fn stop_mid_stream_matches_rows_to_receipts() {
    let registry = registry_with(vec![ticks_table()]);
    let (mut store, handle) = started(Arc::clone(&registry));
    let table = registry.get("Ticks").expect("table");

    let producer = {
        let handle = handle.clone();
        let table = Arc::clone(&table);
        thread::spawn(move || {
            let mut receipts = Vec::new();
            for seq in 0..50_000i64 {
                let mut unit = DataUnit::new(Arc::clone(&table), vec![vec![Value::Integer(seq)]])
                    .expect("unit")
                    .with_timeout(Duration::from_secs(10));
                let receipt = unit.receipt().expect("fresh receipt");
                if !handle.enqueue(unit) {
                    break;
                }
                receipts.push(receipt);
            }
            receipts
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(store.stop(Duration::from_secs(10)));
    let receipts = producer.join().expect("producer");
    assert!(!receipts.is_empty());

    // every accepted write either landed or reported its fate; the row
    // count matches the successful receipts exactly
    let ok = receipts
        .into_iter()
        .map(|receipt| receipt.wait())
        .filter(Result::is_ok)
        .count();
    assert_eq!(count(&handle, "SELECT count(*) FROM Ticks"), ok as i64);
}

#[test]
fn shared_timestamp_resolves_to_one_timeline_row() {
    let registry = registry_with(vec![metrics_table()]);
    let (mut store, handle) = started(Arc::clone(&registry));
    let host_id = add_host(&handle, "alpha");
    let table = registry.get("Metrics").expect("table");

    let mut producers = Vec::new();
    for t in 0..8u32 {
        let handle = handle.clone();
        let table = Arc::clone(&table);
        producers.push(thread::spawn(move || {
            let mut receipts = Vec::new();
            for i in 0..5u32 {
                let mut unit = DataUnit::new(
                    Arc::clone(&table),
                    vec![vec![
                        Value::Integer(host_id),
                        Value::Null,
                        Value::Real(f64::from(t * 10 + i)),
                    ]],
                )
                .expect("unit")
                .with_timestamp("2026-03-01 12:00:00");
                receipts.push(unit.receipt().expect("fresh receipt"));
                assert!(handle.enqueue(unit));
            }
            receipts
        }));
    }
    for producer in producers {
        for receipt in producer.join().expect("producer") {
            receipt.wait().expect("write");
        }
    }

    assert_eq!(count(&handle, "SELECT count(*) FROM TimeLine"), 1);
    assert_eq!(count(&handle, "SELECT count(DISTINCT TL_REF) FROM Metrics"), 1);
    assert_eq!(count(&handle, "SELECT count(*) FROM Metrics"), 40);
    assert!(store.stop(Duration::from_secs(5)));
}

#[test]
fn repeated_output_reuses_its_reference() {
    let registry = registry_with(vec![snapshots_table()]);
    let (mut store, handle) = started(Arc::clone(&registry));
    let host_id = add_host(&handle, "alpha");
    let table = registry.get("Snapshots").expect("table");

    let capture_a = "PID  CPU\n101  12%\n204  3%";
    let capture_b = "PID  CPU\n101  14%\n204  3%";
    let mut refs = Vec::new();
    for text in [capture_a, capture_a, capture_b] {
        let mut unit = DataUnit::new(
            Arc::clone(&table),
            vec![vec![
                Value::Integer(host_id),
                Value::Null,
                Value::from("atop"),
                Value::Null,
            ]],
        )
        .expect("unit")
        .with_timestamp("2026-03-01 12:00:00")
        .with_output(text);
        let receipt = unit.receipt().expect("fresh receipt");
        assert!(handle.enqueue(unit));
        receipt.wait().expect("write");
        let rows = handle
            .query("SELECT OUTPUT_REF FROM Snapshots ORDER BY rowid DESC", vec![])
            .expect("query");
        refs.push(rows[0][0].as_integer().expect("assigned reference"));
    }
    assert_eq!(refs[0], refs[1]);
    assert_ne!(refs[1], refs[2]);

    assert_eq!(
        count(&handle, "SELECT count(DISTINCT OUTPUT_REF) FROM LinesCacheMap"),
        2
    );
    // the header and the idle process line appear in both captures but
    // are stored once
    assert_eq!(count(&handle, "SELECT count(*) FROM LinesCache"), 4);
    assert!(store.stop(Duration::from_secs(5)));
}
