//! Scheduling adapter on top of [`JobStore`].
//!
//! This is the surface a cron host calls into. Every call resolves to a
//! plain outcome; store failures are logged here and never reach the caller
//! as errors.
//!
//! Each call is one request: it starts from an empty query cache, since other
//! processes may have written to the table since the previous call.

use std::sync::Arc;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::query::{JobQuery, TimeFilter};
use crate::store::JobStore;
use crate::types::{Job, JobChanges, NewJob, UpdateOutcome};

/// A request to run `hook` with `args` at `timestamp`, optionally recurring.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub hook: String,
    pub timestamp: DateTime<Utc>,
    pub args: Vec<Value>,
    /// Recurrence name; resolved to an interval when `interval` is absent.
    pub schedule: Option<String>,
    pub interval: Option<u64>,
}

impl ScheduledEvent {
    pub fn single(hook: impl Into<String>, timestamp: DateTime<Utc>, args: Vec<Value>) -> Self {
        Self {
            hook: hook.into(),
            timestamp,
            args,
            schedule: None,
            interval: None,
        }
    }

    pub fn recurring(
        hook: impl Into<String>,
        timestamp: DateTime<Utc>,
        schedule: impl Into<String>,
        interval: u64,
        args: Vec<Value>,
    ) -> Self {
        Self {
            hook: hook.into(),
            timestamp,
            args,
            schedule: Some(schedule.into()),
            interval: Some(interval),
        }
    }

    /// Recurring by name only; the interval comes from the recurrence table.
    pub fn named(
        hook: impl Into<String>,
        timestamp: DateTime<Utc>,
        schedule: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            hook: hook.into(),
            timestamp,
            args,
            schedule: Some(schedule.into()),
            interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Created,
    /// An equivalent job already exists; nothing was written.
    Unchanged,
    /// The existing job's recurrence was replaced.
    Revised,
    Rejected,
}

impl ScheduleOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ScheduleOutcome::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnscheduleOutcome {
    Removed,
    NotFound,
}

/// What scheduling an event against the current state should do.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create,
    Unchanged,
    Revise(JobChanges),
}

/// Compare a resolved event with the live job matching its hook, timestamp
/// and args.
pub fn decide(existing: Option<&Job>, event: &ScheduledEvent) -> Decision {
    match existing {
        None => Decision::Create,
        Some(job) if job.schedule == event.schedule && job.interval == event.interval => {
            Decision::Unchanged
        }
        Some(_) => Decision::Revise(JobChanges::recurrence(
            event.schedule.clone(),
            event.interval,
        )),
    }
}

/// The operations a cron host delegates to the job store.
pub trait CronBackend {
    fn schedule(&self, event: &ScheduledEvent) -> ScheduleOutcome;

    fn unschedule(&self, hook: &str, timestamp: DateTime<Utc>, args: &[Value]) -> UnscheduleOutcome;

    /// Remove every pending occurrence of `hook`, optionally only those with
    /// `args`. Returns how many were removed.
    fn clear_all(&self, hook: &str, args: Option<&[Value]>) -> usize;
}

/// [`CronBackend`] for one site.
#[derive(Clone)]
pub struct Connector {
    store: Arc<JobStore>,
    site: i64,
    clear_limit: usize,
}

impl Connector {
    pub fn new(store: Arc<JobStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            site: config.site,
            clear_limit: config.clear_limit,
        }
    }

    /// Same store and limits, acting for another site.
    pub fn for_site(&self, site: i64) -> Self {
        Self {
            site,
            ..self.clone()
        }
    }

    pub fn site(&self) -> i64 {
        self.site
    }

    /// Earliest live occurrence of `hook` with `args`, if any.
    pub fn next_scheduled(&self, hook: &str, args: &[Value]) -> Option<Job> {
        self.begin_request();
        let query = JobQuery::for_hook(hook).site(self.site).args(args.to_vec());
        match self.store.query(&query) {
            Ok(jobs) => jobs.into_iter().next(),
            Err(e) => {
                error!(%hook, "next scheduled lookup failed: {e}");
                None
            }
        }
    }

    /// All live jobs of this site, earliest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.begin_request();
        self.store.get_by_site(self.site).unwrap_or_else(|e| {
            error!(site = self.site, "listing jobs failed: {e}");
            Vec::new()
        })
    }

    // --- private helpers ---------------------------------------------------

    fn begin_request(&self) {
        self.store.cache().reset();
    }

    /// Fill in whichever of schedule name and interval is missing. `None` for
    /// a recurrence name nobody registered.
    fn resolve(&self, event: &ScheduledEvent) -> Option<ScheduledEvent> {
        let recurrences = self.store.recurrences();
        let mut event = event.clone();
        event.schedule = event.schedule.filter(|name| !name.is_empty());
        event.interval = event.interval.filter(|i| *i > 0);
        match (&event.schedule, event.interval) {
            (Some(name), None) => event.interval = Some(recurrences.interval_of(name)?),
            (None, Some(interval)) => event.schedule = Some(recurrences.name_or_fake(interval)),
            _ => {}
        }
        Some(event)
    }

    fn find(&self, hook: &str, timestamp: DateTime<Utc>, args: &[Value]) -> Result<Option<Job>> {
        let query = JobQuery::for_hook(hook)
            .site(self.site)
            .time(TimeFilter::At(timestamp))
            .args(args.to_vec());
        Ok(self.store.query(&query)?.into_iter().next())
    }

    fn create(&self, event: &ScheduledEvent) -> Result<ScheduleOutcome> {
        let new = match (&event.schedule, event.interval) {
            (Some(schedule), Some(interval)) => NewJob::recurring(
                self.site,
                event.hook.clone(),
                event.timestamp,
                schedule.clone(),
                interval,
                event.args.clone(),
            ),
            _ => NewJob::single(self.site, event.hook.clone(), event.timestamp, event.args.clone()),
        };
        match self.store.insert(new) {
            Ok(job) => {
                debug!(job_id = job.id, "job created");
                Ok(ScheduleOutcome::Created)
            }
            // Someone else holds this identity already, which is what we wanted.
            Err(StoreError::DuplicateKey) => {
                debug!("equivalent job already registered");
                Ok(ScheduleOutcome::Unchanged)
            }
            Err(e) => Err(e),
        }
    }

    fn try_schedule(&self, event: &ScheduledEvent) -> Result<ScheduleOutcome> {
        let Some(event) = self.resolve(event) else {
            warn!(schedule = ?event.schedule, "unknown recurrence, event rejected");
            return Ok(ScheduleOutcome::Rejected);
        };

        let existing = self.find(&event.hook, event.timestamp, &event.args)?;
        match (decide(existing.as_ref(), &event), existing) {
            (Decision::Create, _) | (_, None) => self.create(&event),
            (Decision::Unchanged, Some(_)) => Ok(ScheduleOutcome::Unchanged),
            (Decision::Revise(changes), Some(job)) => match self.store.update(job.id, &changes)? {
                UpdateOutcome::Updated => {
                    info!(job_id = job.id, schedule = ?event.schedule, "job revised");
                    Ok(ScheduleOutcome::Revised)
                }
                UpdateOutcome::Removed => Ok(ScheduleOutcome::Revised),
                // deleted between the read and the write
                UpdateOutcome::Missing => self.create(&event),
            },
        }
    }

    fn try_unschedule(
        &self,
        hook: &str,
        timestamp: DateTime<Utc>,
        args: &[Value],
    ) -> Result<UnscheduleOutcome> {
        let Some(job) = self.find(hook, timestamp, args)? else {
            return Ok(UnscheduleOutcome::NotFound);
        };
        if self.store.soft_delete(job.id)? {
            Ok(UnscheduleOutcome::Removed)
        } else {
            Ok(UnscheduleOutcome::NotFound)
        }
    }
}

impl CronBackend for Connector {
    #[instrument(skip(self, event), fields(hook = %event.hook, site = self.site))]
    fn schedule(&self, event: &ScheduledEvent) -> ScheduleOutcome {
        self.begin_request();
        self.try_schedule(event).unwrap_or_else(|e| {
            error!("scheduling failed: {e}");
            ScheduleOutcome::Rejected
        })
    }

    #[instrument(skip(self, args), fields(site = self.site))]
    fn unschedule(&self, hook: &str, timestamp: DateTime<Utc>, args: &[Value]) -> UnscheduleOutcome {
        self.begin_request();
        self.try_unschedule(hook, timestamp, args)
            .unwrap_or_else(|e| {
                error!("unscheduling failed: {e}");
                UnscheduleOutcome::NotFound
            })
    }

    #[instrument(skip(self, args), fields(site = self.site))]
    fn clear_all(&self, hook: &str, args: Option<&[Value]>) -> usize {
        self.begin_request();
        self.store
            .clear_all(self.site, hook, args, self.clear_limit)
            .unwrap_or_else(|e| {
                error!("clearing hook failed: {e}");
                0
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{live_sentinel, parse_timestamp};
    use crate::types::JobStatus;
    use serde_json::json;

    fn job(schedule: Option<&str>, interval: Option<u64>) -> Job {
        let at = parse_timestamp("2030-01-01 00:00:00").unwrap();
        Job {
            id: 1,
            site: 1,
            hook: "h".to_string(),
            hook_instance: String::new(),
            args: vec![json!("a")],
            args_digest: String::new(),
            nextrun: at,
            interval,
            schedule: schedule.map(str::to_string),
            status: JobStatus::Waiting,
            registered_at: at,
            revised_at: at,
            started_at: None,
            finished_at: None,
            deleted_at: live_sentinel(),
        }
    }

    fn event(schedule: Option<&str>, interval: Option<u64>) -> ScheduledEvent {
        let mut event = ScheduledEvent::single(
            "h",
            parse_timestamp("2030-01-01 00:00:00").unwrap(),
            vec![json!("a")],
        );
        event.schedule = schedule.map(str::to_string);
        event.interval = interval;
        event
    }

    #[test]
    fn nothing_existing_means_create() {
        assert_eq!(decide(None, &event(None, None)), Decision::Create);
    }

    #[test]
    fn identical_event_is_unchanged() {
        let existing = job(Some("hourly"), Some(3_600));
        assert_eq!(
            decide(Some(&existing), &event(Some("hourly"), Some(3_600))),
            Decision::Unchanged
        );
        let single = job(None, None);
        assert_eq!(decide(Some(&single), &event(None, None)), Decision::Unchanged);
    }

    #[test]
    fn changed_recurrence_is_revised() {
        let existing = job(Some("hourly"), Some(3_600));
        assert_eq!(
            decide(Some(&existing), &event(Some("daily"), Some(86_400))),
            Decision::Revise(JobChanges::recurrence(Some("daily".into()), Some(86_400)))
        );
        assert_eq!(
            decide(Some(&existing), &event(None, None)),
            Decision::Revise(JobChanges::recurrence(None, None))
        );
    }

    #[test]
    fn only_rejection_is_not_accepted() {
        assert!(ScheduleOutcome::Created.is_accepted());
        assert!(ScheduleOutcome::Unchanged.is_accepted());
        assert!(ScheduleOutcome::Revised.is_accepted());
        assert!(!ScheduleOutcome::Rejected.is_accepted());
    }
}
