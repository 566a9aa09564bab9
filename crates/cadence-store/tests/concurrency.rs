// Several handles on one database file, the way separate web and worker
// processes share a store.

use std::sync::{Arc, Barrier};
use std::thread;

use cadence_core::CadenceConfig;
use cadence_store::record::now;
use cadence_store::{
    Connector, CronBackend, JobListing, JobStore, NewJob, ScheduleOutcome, ScheduledEvent,
    StoreError, UnscheduleOutcome,
};
use chrono::Duration;
use serde_json::json;
use tempfile::TempDir;

fn config(dir: &TempDir) -> CadenceConfig {
    let mut config = CadenceConfig::default();
    config.database.path = dir.path().join("jobs.db").to_string_lossy().into_owned();
    config
}

fn open(config: &CadenceConfig) -> JobStore {
    let store = JobStore::open(config).unwrap();
    store.upgrade().unwrap();
    store
}

#[test]
fn racing_inserts_leave_one_live_row() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    open(&config);

    let nextrun = now() + Duration::hours(1);
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = open(&config);
                barrier.wait();
                store.insert(NewJob::single(1, "race", nextrun, vec![json!("same")]))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let created = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(StoreError::DuplicateKey)))
        .count();
    assert_eq!((created, duplicates), (1, 1));

    let rows = open(&config).list(&JobListing::default()).unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
fn only_one_worker_claims_a_job() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let job = open(&config)
        .insert(NewJob::single(1, "work", now() - Duration::minutes(1), vec![]))
        .unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = open(&config);
                barrier.wait();
                store.claim(job.id).unwrap()
            })
        })
        .collect();

    let claims = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|claimed| *claimed)
        .count();
    assert_eq!(claims, 1);
}

#[test]
fn writes_from_another_handle_are_seen_after_upgrade() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let reader = open(&config);
    let writer = open(&config);

    let job = writer
        .insert(NewJob::single(1, "shared", now() + Duration::hours(1), vec![]))
        .unwrap();
    assert_eq!(reader.get(job.id).unwrap().map(|j| j.id), Some(job.id));
    assert_eq!(reader.schema_version().unwrap(), cadence_store::SCHEMA_VERSION);
}

#[test]
fn unschedule_from_another_handle_is_seen_by_the_next_schedule() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let web = Connector::new(Arc::new(open(&config)), &config.scheduler);
    let worker = Connector::new(Arc::new(open(&config)), &config.scheduler);

    let at = now() + Duration::hours(1);
    let event = ScheduledEvent::single("publish_future_post", at, vec![json!(102)]);
    assert_eq!(web.schedule(&event), ScheduleOutcome::Created);
    // warms the lookup on the web handle
    assert_eq!(web.schedule(&event), ScheduleOutcome::Unchanged);

    assert_eq!(
        worker.unschedule("publish_future_post", at, &[json!(102)]),
        UnscheduleOutcome::Removed
    );
    assert!(web.next_scheduled("publish_future_post", &[json!(102)]).is_none());

    assert_eq!(web.schedule(&event), ScheduleOutcome::Created);
    let live = open(&config)
        .list(&JobListing {
            deleted: Some(false),
            ..JobListing::default()
        })
        .unwrap();
    assert_eq!(live.len(), 1);
}
