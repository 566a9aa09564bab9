use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::live_sentinel;

/// Lifecycle state of a job. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its nextrun time.
    Waiting,
    /// Claimed by a worker and currently executing.
    Running,
    /// Execution finished.
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
        }
    }

    /// Statuses a row may hold for an update to move it to `self`.
    pub(crate) fn predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Waiting => &[JobStatus::Waiting],
            JobStatus::Running => &[JobStatus::Waiting],
            JobStatus::Done => &[JobStatus::Waiting, JobStatus::Running],
        }
    }

    /// Live statuses: the default filter for every query.
    pub fn live() -> Vec<JobStatus> {
        vec![JobStatus::Waiting, JobStatus::Running]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identity.
    pub id: i64,
    /// Tenant the job belongs to.
    pub site: i64,
    /// Symbolic name of the action to run.
    pub hook: String,
    /// `nextrun` in canonical format for one-off jobs, empty for recurring ones.
    pub hook_instance: String,
    pub args: Vec<Value>,
    /// Hex SHA-256 of the serialized args.
    pub args_digest: String,
    pub nextrun: DateTime<Utc>,
    /// Seconds between runs; `None` for one-off jobs.
    pub interval: Option<u64>,
    /// Recurrence name, e.g. `hourly`; `None` for one-off jobs.
    pub schedule: Option<String>,
    pub status: JobStatus,
    pub registered_at: DateTime<Utc>,
    pub revised_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The live sentinel until the job is soft-deleted.
    pub deleted_at: DateTime<Utc>,
}

impl Job {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at != live_sentinel()
    }
}

/// Input for [`crate::JobStore::insert`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub site: i64,
    pub hook: String,
    pub args: Vec<Value>,
    pub nextrun: DateTime<Utc>,
    pub interval: Option<u64>,
    pub schedule: Option<String>,
}

impl NewJob {
    /// A job that runs once at `nextrun`.
    pub fn single(site: i64, hook: impl Into<String>, nextrun: DateTime<Utc>, args: Vec<Value>) -> Self {
        Self {
            site,
            hook: hook.into(),
            args,
            nextrun,
            interval: None,
            schedule: None,
        }
    }

    /// A job that first runs at `nextrun` and then every `interval` seconds.
    pub fn recurring(
        site: i64,
        hook: impl Into<String>,
        nextrun: DateTime<Utc>,
        schedule: impl Into<String>,
        interval: u64,
        args: Vec<Value>,
    ) -> Self {
        Self {
            site,
            hook: hook.into(),
            args,
            nextrun,
            interval: Some(interval),
            schedule: Some(schedule.into()),
        }
    }
}

/// Metadata revision applied by [`crate::JobStore::update`].
///
/// `None` leaves a column untouched; the nested options of `interval` and
/// `schedule` allow clearing them (turning a recurring job into a one-off).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobChanges {
    pub schedule: Option<Option<String>>,
    pub interval: Option<Option<u64>>,
    pub nextrun: Option<DateTime<Utc>>,
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobChanges {
    /// Replace the recurrence of a job in one go.
    pub fn recurrence(schedule: Option<String>, interval: Option<u64>) -> Self {
        Self {
            schedule: Some(schedule),
            interval: Some(interval),
            ..Self::default()
        }
    }
}

/// Result of [`crate::JobStore::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The revision collided with another live job; this row was removed
    /// and the pre-existing one kept.
    Removed,
    /// No row with that id exists.
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_text() {
        for status in [JobStatus::Waiting, JobStatus::Running, JobStatus::Done] {
            assert_eq!(status.to_string().parse::<JobStatus>(), Ok(status));
        }
        assert!("completed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(JobStatus::Running.predecessors().contains(&JobStatus::Waiting));
        assert!(!JobStatus::Running.predecessors().contains(&JobStatus::Done));
        assert!(!JobStatus::Waiting.predecessors().contains(&JobStatus::Running));
    }
}
