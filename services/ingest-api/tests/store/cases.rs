use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use ingest_api::ingest::{IngestBatch, ingest};
use ingest_api::query::{LatestReading, latest_measurement};
use ingest_api::store::{self, PostgresStore, SqliteStore, StoreConfig, TelemetryStore};
use ingest_api::types::{DeviceKey, MeasurementRow};
use serde_json::json;

fn row(ts: Option<i64>, accel_x: f64) -> MeasurementRow {
    MeasurementRow {
        timestamp: ts,
        timestamp_iso: ts.map(|t| format!("iso-{t}")),
        accel_x,
        accel_y: 2.0,
        accel_z: 3.0,
        gyro_x: 0.1,
        gyro_y: 0.2,
        gyro_z: 0.3,
        mag_x: 4.0,
        mag_y: 5.0,
        mag_z: 6.0,
        light: None,
        lat: 1.5,
        long: -2.5,
        speed: 0.0,
        mic_level: Some(-20.0),
        pressure: 1000.0,
    }
}

// (rows, distinct device keys) in `measurements`, read over a separate connection
fn stored_rows(path: &Path) -> (i64, i64) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT device_id) FROM measurements",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .unwrap()
}

fn exercise_store(store: &dyn TelemetryStore) {
    let first = store.resolve_device("dev-a").unwrap();
    assert!(first.created);
    let again = store.resolve_device("dev-a").unwrap();
    assert!(!again.created);
    assert_eq!(first.key, again.key);

    let other = store.resolve_device("dev-b").unwrap();
    assert_ne!(other.key, first.key);

    let rows = vec![row(Some(100), 1.0), row(Some(300), 3.0), row(Some(200), 2.0)];
    assert_eq!(store.insert_measurements(first.key, &rows).unwrap(), 3);

    let latest = store.latest_measurement("dev-a").unwrap().unwrap();
    assert_eq!(latest, rows[1]);
    assert!(store.latest_measurement("dev-b").unwrap().is_none());
    assert!(store.latest_measurement("dev-missing").unwrap().is_none());

    let devices = store.list_devices().unwrap();
    let ids: Vec<&str> = devices.iter().map(|d| d.external_id.as_str()).collect();
    assert_eq!(ids, ["dev-a", "dev-b"]);
}

#[test]
fn sqlite_memory_store_contract() {
    let store = SqliteStore::open_in_memory().unwrap();
    exercise_store(&store);
}

#[test]
fn sqlite_file_store_contract_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ingest.db");
    {
        let store = SqliteStore::open(&path, 5_000).unwrap();
        exercise_store(&store);
        assert_eq!(stored_rows(&path), (3, 1));
    }
    // schema bootstrap is idempotent and rows survive
    let store = SqliteStore::open(&path, 5_000).unwrap();
    assert_eq!(store.list_devices().unwrap().len(), 2);
    assert!(store.latest_measurement("dev-a").unwrap().is_some());
}

#[test]
fn connect_selects_backend_from_url() {
    let store = store::connect(&StoreConfig::new("sqlite::memory:")).unwrap();
    assert!(store.list_devices().unwrap().is_empty());
    assert!(store::connect(&StoreConfig::new("mysql://localhost/x")).is_err());
}

#[test]
fn null_timestamps_sort_after_real_ones() {
    let store = SqliteStore::open_in_memory().unwrap();
    let dev = store.resolve_device("dev").unwrap();
    store
        .insert_measurements(dev.key, &[row(None, 9.0), row(Some(5), 5.0), row(None, 8.0)])
        .unwrap();
    let latest = store.latest_measurement("dev").unwrap().unwrap();
    assert_eq!(latest.timestamp, Some(5));
}

#[test]
fn equal_timestamps_prefer_newest_insert() {
    let store = SqliteStore::open_in_memory().unwrap();
    let dev = store.resolve_device("dev").unwrap();
    store.insert_measurements(dev.key, &[row(Some(7), 1.0)]).unwrap();
    store.insert_measurements(dev.key, &[row(Some(7), 2.0)]).unwrap();
    let latest = store.latest_measurement("dev").unwrap().unwrap();
    assert_eq!(latest.accel_x, 2.0);
}

#[test]
fn batch_is_all_or_nothing() {
    let store = SqliteStore::open_in_memory().unwrap();
    let dev = store.resolve_device("dev").unwrap();
    // sqlite binds NaN as NULL, so the second row trips NOT NULL after the first went in
    let err = store.insert_measurements(dev.key, &[row(Some(1), 1.0), row(Some(2), f64::NAN)]);
    assert!(err.is_err());
    assert!(store.latest_measurement("dev").unwrap().is_none());

    let ghost = DeviceKey(9_999);
    assert!(store.insert_measurements(ghost, &[row(Some(1), 1.0)]).is_err());
}

#[test]
fn concurrent_first_sight_converges_on_one_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    // one connection per thread so inserts genuinely race on the unique index
    let stores: Vec<Arc<SqliteStore>> = (0..8)
        .map(|_| Arc::new(SqliteStore::open(&path, 10_000).unwrap()))
        .collect();
    let barrier = Arc::new(Barrier::new(stores.len()));

    let handles: Vec<_> = stores
        .iter()
        .cloned()
        .map(|store| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                store.resolve_device("shared-device").unwrap()
            })
        })
        .collect();
    let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let key = resolved[0].key;
    assert!(resolved.iter().all(|r| r.key == key));
    assert_eq!(resolved.iter().filter(|r| r.created).count(), 1);
    assert_eq!(stores[0].list_devices().unwrap().len(), 1);
}

#[test]
fn ingest_pipeline_writes_rows_under_one_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.db");
    let store = SqliteStore::open(&path, 5_000).unwrap();
    let records: Vec<_> = (1..=5)
        .map(|ts| {
            json!({
                "timestamp": ts,
                "data": {
                    "accelerometer": {"x": ts as f64, "y": 0.0, "z": 0.0},
                    "gyroscope": {"x": 0.0, "y": 0.0, "z": 0.0},
                    "magnetometer": {"x": 0.0, "y": 0.0, "z": 0.0},
                    "location": {"lat": 0.0, "long": 0.0, "speed": 0.0},
                    "barometer": {"pressure": 990.0}
                }
            })
        })
        .collect();
    let batch = IngestBatch::from_payload(json!({
        "metadata": {"deviceId": "pipe"},
        "records": records,
    }))
    .unwrap();
    let receipt = ingest(&store, batch).unwrap();
    assert_eq!(receipt.inserted, 5);
    assert_eq!(receipt.device, "pipe");
    assert_eq!(stored_rows(&path), (5, 1));
    let key = store.resolve_device("pipe").unwrap().key;
    let conn = rusqlite::Connection::open(&path).unwrap();
    let for_key: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM measurements WHERE device_id = ?1",
            [key.0],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(for_key, 5);

    match latest_measurement(&store, "pipe").unwrap() {
        LatestReading::Found(reading) => {
            assert_eq!(reading.timestamp, Some(5));
            assert_eq!(reading.data.accelerometer.x, 5.0);
            assert_eq!(reading.timestamp_iso, None);
        }
        LatestReading::NoData => panic!("expected a reading"),
    }
    assert_eq!(store.list_devices().unwrap().len(), 1);
}

// Live Postgres run; skipped unless INGEST_API_TEST_DATABASE_URL points at a
// disposable database.
#[test]
fn postgres_store_contract() {
    let Ok(url) = std::env::var("INGEST_API_TEST_DATABASE_URL") else {
        eprintln!("INGEST_API_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = Arc::new(PostgresStore::new(&StoreConfig::new(url)).unwrap());
    let tag = format!("pg-{}", std::process::id());
    let dev = store.resolve_device(&tag).unwrap();
    assert_eq!(store.resolve_device(&tag).unwrap().key, dev.key);
    let rows = vec![row(Some(100), 1.0), row(Some(300), 3.0), row(Some(200), 2.0)];
    store.insert_measurements(dev.key, &rows).unwrap();
    assert_eq!(store.latest_measurement(&tag).unwrap().unwrap(), rows[1]);
    assert!(
        store
            .list_devices()
            .unwrap()
            .iter()
            .any(|d| d.external_id == tag)
    );

    // first sight from many pooled connections at once; exactly one insert wins
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let shared = format!("pg-race-{}-{nanos}", std::process::id());
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let barrier = barrier.clone();
            let shared = shared.clone();
            thread::spawn(move || {
                barrier.wait();
                store.resolve_device(&shared).unwrap()
            })
        })
        .collect();
    let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let key = resolved[0].key;
    assert!(resolved.iter().all(|r| r.key == key));
    assert_eq!(resolved.iter().filter(|r| r.created).count(), 1);
    assert_eq!(
        store
            .list_devices()
            .unwrap()
            .iter()
            .filter(|d| d.external_id == shared)
            .count(),
        1
    );
}
