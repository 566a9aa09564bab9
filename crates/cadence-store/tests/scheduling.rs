// Behaviour of the scheduling adapter as a cron host sees it.

use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use cadence_core::CadenceConfig;
use cadence_store::record::{live_sentinel, now};
use cadence_store::{
    Connector, CronBackend, JobListing, JobStatus, JobStore, ScheduleOutcome, ScheduledEvent,
    UnscheduleOutcome,
};
use chrono::{DateTime, Duration as Span, Utc};
use rusqlite::Connection;
use serde_json::json;

fn setup() -> (Arc<JobStore>, Connector) {
    let config = CadenceConfig::default();
    let store = JobStore::new(Connection::open_in_memory().unwrap(), &config).unwrap();
    store.upgrade().unwrap();
    let store = Arc::new(store);
    let connector = Connector::new(Arc::clone(&store), &config.scheduler);
    (store, connector)
}

fn in_hours(hours: i64) -> DateTime<Utc> {
    now() + Span::hours(hours)
}

fn all_rows(store: &JobStore, hook: &str) -> Vec<cadence_store::Job> {
    store
        .list(&JobListing {
            hook: Some(hook.to_string()),
            limit: 100,
            order: cadence_store::SortOrder::Asc,
            ..JobListing::default()
        })
        .unwrap()
}

#[test]
fn scheduling_twice_keeps_one_row() {
    let (store, connector) = setup();
    let event = ScheduledEvent::recurring("wp_version_check", in_hours(1), "hourly", 3_600, vec![]);

    assert_eq!(connector.schedule(&event), ScheduleOutcome::Created);
    assert_eq!(connector.schedule(&event), ScheduleOutcome::Unchanged);
    assert_eq!(all_rows(&store, "wp_version_check").len(), 1);
}

#[test]
fn recurring_event_at_another_time_is_a_duplicate() {
    let (store, connector) = setup();
    let args = vec![json!("arg")];
    let first = ScheduledEvent::recurring("sync", in_hours(0), "hourly", 3_600, args.clone());
    let second = ScheduledEvent::recurring("sync", in_hours(1), "hourly", 3_600, args.clone());

    assert_eq!(connector.schedule(&first), ScheduleOutcome::Created);
    assert!(connector.schedule(&second).is_accepted());

    let rows = all_rows(&store, "sync");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].nextrun, first.timestamp);
    assert_eq!(
        connector.next_scheduled("sync", &args).map(|job| job.id),
        Some(rows[0].id)
    );
}

#[test]
fn one_off_events_at_different_times_coexist() {
    let (store, connector) = setup();
    for hours in 1..=3 {
        let event = ScheduledEvent::single("publish_future_post", in_hours(hours), vec![json!(102)]);
        assert_eq!(connector.schedule(&event), ScheduleOutcome::Created);
    }
    assert_eq!(all_rows(&store, "publish_future_post").len(), 3);
    assert_eq!(connector.jobs().len(), 3);
}

#[test]
fn revising_keeps_identity_and_registration() {
    let (store, connector) = setup();
    let at = in_hours(1);
    connector.schedule(&ScheduledEvent::recurring("cleanup", at, "hourly", 3_600, vec![]));
    let before = all_rows(&store, "cleanup").remove(0);

    sleep(Duration::from_secs(1));
    let outcome = connector.schedule(&ScheduledEvent::named("cleanup", at, "daily", vec![]));
    assert_eq!(outcome, ScheduleOutcome::Revised);

    let after = all_rows(&store, "cleanup").remove(0);
    assert_eq!(after.id, before.id);
    assert_eq!(after.schedule.as_deref(), Some("daily"));
    assert_eq!(after.interval, Some(86_400));
    assert_eq!(after.registered_at, before.registered_at);
    assert!(after.revised_at > before.revised_at);
    assert_eq!(after.hook_instance, "");
}

#[test]
fn unknown_recurrence_is_rejected() {
    let (store, connector) = setup();
    let event = ScheduledEvent::named("cleanup", in_hours(1), "fortnightly", vec![]);
    assert_eq!(connector.schedule(&event), ScheduleOutcome::Rejected);
    assert!(all_rows(&store, "cleanup").is_empty());
}

#[test]
fn new_rows_carry_the_live_sentinel() {
    let (store, connector) = setup();
    connector.schedule(&ScheduledEvent::single("h", in_hours(1), vec![]));
    let job = all_rows(&store, "h").remove(0);
    assert_eq!(job.deleted_at, live_sentinel());
    assert!(!job.is_deleted());
    assert!(job.started_at.is_none());
    assert!(job.finished_at.is_none());
}

#[test]
fn unschedule_stamps_deletion_time_for_every_status() {
    let (store, connector) = setup();
    let at = in_hours(-1);
    for (hook, status) in [
        ("waiting_job", JobStatus::Waiting),
        ("running_job", JobStatus::Running),
    ] {
        connector.schedule(&ScheduledEvent::single(hook, at, vec![]));
        let job = all_rows(&store, hook).remove(0);
        if status == JobStatus::Running {
            assert!(store.claim(job.id).unwrap());
        }

        let before = now();
        sleep(Duration::from_secs(1));
        assert_eq!(connector.unschedule(hook, at, &[]), UnscheduleOutcome::Removed);
        sleep(Duration::from_secs(1));
        let after = now();

        let deleted = store.get(job.id).unwrap().unwrap();
        assert_eq!(deleted.status, status);
        assert!(deleted.deleted_at > before, "{hook} deleted too early");
        assert!(deleted.deleted_at < after, "{hook} deleted too late");
    }
}

#[test]
fn unscheduling_nothing_is_not_found() {
    let (_store, connector) = setup();
    assert_eq!(
        connector.unschedule("nope", in_hours(1), &[]),
        UnscheduleOutcome::NotFound
    );
}

#[test]
fn clear_all_only_touches_matching_args() {
    let (store, connector) = setup();
    let args = vec![json!("arg1")];
    for hours in 1..=2 {
        connector.schedule(&ScheduledEvent::single("hook", in_hours(hours), vec![]));
    }
    for hours in 3..=4 {
        connector.schedule(&ScheduledEvent::single("hook", in_hours(hours), args.clone()));
    }

    assert_eq!(connector.clear_all("hook", Some(Vec::new().as_slice())), 2);
    let rows = all_rows(&store, "hook");
    assert_eq!(rows.iter().filter(|job| job.is_deleted()).count(), 2);
    assert!(rows
        .iter()
        .filter(|job| job.is_deleted())
        .all(|job| job.args.is_empty()));

    assert_eq!(connector.clear_all("hook", Some(args.as_slice())), 2);
    assert!(connector.next_scheduled("hook", &args).is_none());
    assert_eq!(all_rows(&store, "hook").len(), 4);
}

#[test]
fn clear_all_without_args_takes_every_variant() {
    let (_store, connector) = setup();
    connector.schedule(&ScheduledEvent::single("hook", in_hours(1), vec![]));
    connector.schedule(&ScheduledEvent::single("hook", in_hours(2), vec![json!(1)]));
    assert_eq!(connector.clear_all("hook", None), 2);
    assert_eq!(connector.clear_all("hook", None), 0);
}

#[test]
fn clear_all_respects_the_limit() {
    let mut config = CadenceConfig::default();
    config.scheduler.clear_limit = 2;
    let store = JobStore::new(Connection::open_in_memory().unwrap(), &config).unwrap();
    store.upgrade().unwrap();
    let connector = Connector::new(Arc::new(store), &config.scheduler);

    for hours in 1..=3 {
        connector.schedule(&ScheduledEvent::single("bulk", in_hours(hours), vec![]));
    }
    assert_eq!(connector.clear_all("bulk", None), 2);
    assert_eq!(connector.clear_all("bulk", None), 1);
}

#[test]
fn unscheduling_next_to_a_deleted_twin_removes_the_row() {
    let (store, connector) = setup();
    let at = now();
    let event = ScheduledEvent::recurring("twin", at, "daily", 86_400, vec![]);

    connector.schedule(&event);
    assert_eq!(connector.unschedule("twin", at, &[]), UnscheduleOutcome::Removed);
    connector.schedule(&event);
    // Same second: the soft-deleted twin already owns this deletion stamp.
    let outcome = connector.unschedule("twin", at, &[]);
    assert_eq!(outcome, UnscheduleOutcome::Removed);

    let rows = all_rows(&store, "twin");
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|job| job.is_deleted()));
    assert!(connector.next_scheduled("twin", &[]).is_none());
}

#[test]
fn sites_are_isolated() {
    let (_store, connector) = setup();
    let other = connector.for_site(2);
    let event = ScheduledEvent::single("h", in_hours(1), vec![]);

    assert_eq!(connector.schedule(&event), ScheduleOutcome::Created);
    assert_eq!(other.schedule(&event), ScheduleOutcome::Created);
    assert_eq!(other.clear_all("h", None), 1);
    assert_eq!(connector.jobs().len(), 1);
}

#[test]
fn missing_schema_degrades_to_rejection() {
    let config = CadenceConfig::default();
    let store = JobStore::new(Connection::open_in_memory().unwrap(), &config).unwrap();
    let connector = Connector::new(Arc::new(store), &config.scheduler);
    let event = ScheduledEvent::single("h", in_hours(1), vec![]);

    assert_eq!(connector.schedule(&event), ScheduleOutcome::Rejected);
    assert_eq!(
        connector.unschedule("h", event.timestamp, &[]),
        UnscheduleOutcome::NotFound
    );
    assert_eq!(connector.clear_all("h", None), 0);
    assert!(connector.jobs().is_empty());
}

#[test]
fn deleted_filter_on_listing() {
    let (store, connector) = setup();
    let at = in_hours(1);
    connector.schedule(&ScheduledEvent::single("h", at, vec![]));
    connector.schedule(&ScheduledEvent::single("h", in_hours(2), vec![]));
    connector.unschedule("h", at, &[]);

    let deleted = store
        .list(&JobListing {
            deleted: Some(true),
            ..JobListing::default()
        })
        .unwrap();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].is_deleted());
}
