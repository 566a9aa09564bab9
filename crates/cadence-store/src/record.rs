//! Column-level encoding of job records.
//!
//! Every timestamp that reaches SQL goes through [`format_timestamp`] so that
//! string comparisons in `WHERE` clauses are also chronological comparisons.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};
use crate::recurrence::Recurrences;
use crate::types::{Job, JobStatus};

/// Canonical datetime format for every stored timestamp (UTC).
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `deleted_at` of a live row. A real value rather than NULL so the
/// uniqueness index covers live rows.
pub const LIVE_DELETED_AT: &str = "9999-12-31 23:59:59";

/// Column list shared by every `SELECT` that feeds [`JobRow::from_row`].
pub const JOB_COLUMNS: &str = "id, site, hook, hook_instance, args, args_digest, nextrun, \
     interval, status, schedule, registered_at, revised_at, started_at, finished_at, deleted_at";

/// [`LIVE_DELETED_AT`] as a timestamp.
pub fn live_sentinel() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(DATE_FORMAT).to_string()
}

/// Format a unix timestamp (seconds); `None` when out of chrono's range.
pub fn format_unix(secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(format_timestamp)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

/// Deterministic encoding of an argument list.
///
/// Object keys come out sorted, so equal argument lists always produce the
/// same bytes and therefore the same digest.
pub fn serialize_args(args: &[Value]) -> Result<String> {
    Ok(serde_json::to_string(args)?)
}

pub fn deserialize_args(raw: &str) -> serde_json::Result<Vec<Value>> {
    serde_json::from_str(raw)
}

/// Lowercase hex SHA-256 of the serialized args.
pub fn args_digest(serialized: &str) -> String {
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

/// One-off jobs are disambiguated by their run time; recurring ones are not.
pub fn hook_instance_for(formatted_nextrun: &str, interval: Option<u64>) -> String {
    match interval {
        Some(_) => String::new(),
        None => formatted_nextrun.to_string(),
    }
}

/// A `jobs` row exactly as stored.
///
/// Query results are cached in this shape so that a row which fails to
/// decode is never cached as a [`Job`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: i64,
    pub site: i64,
    pub hook: String,
    pub hook_instance: String,
    pub args: String,
    pub args_digest: String,
    pub nextrun: String,
    pub interval: Option<i64>,
    pub status: String,
    pub schedule: Option<String>,
    pub registered_at: String,
    pub revised_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub deleted_at: String,
}

impl JobRow {
    /// Map a row selected with [`JOB_COLUMNS`].
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            site: row.get("site")?,
            hook: row.get("hook")?,
            hook_instance: row.get("hook_instance")?,
            args: row.get("args")?,
            args_digest: row.get("args_digest")?,
            nextrun: row.get("nextrun")?,
            interval: row.get("interval")?,
            status: row.get("status")?,
            schedule: row.get("schedule")?,
            registered_at: row.get("registered_at")?,
            revised_at: row.get("revised_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }

    /// Encode a record for writing. The digest and hook instance are derived
    /// here from `args`, `nextrun` and `interval`, whatever the record claims.
    pub fn from_job(job: &Job) -> Result<Self> {
        let args = serialize_args(&job.args)?;
        let nextrun = format_timestamp(job.nextrun);
        let interval = job
            .interval
            .map(|i| {
                i64::try_from(i).map_err(|_| StoreError::Decode {
                    id: job.id,
                    reason: format!("interval {i} does not fit in a column"),
                })
            })
            .transpose()?;

        Ok(Self {
            id: job.id,
            site: job.site,
            hook: job.hook.clone(),
            hook_instance: hook_instance_for(&nextrun, job.interval),
            args_digest: args_digest(&args),
            args,
            nextrun,
            interval,
            status: job.status.to_string(),
            schedule: job.interval.and(job.schedule.clone()),
            registered_at: format_timestamp(job.registered_at),
            revised_at: format_timestamp(job.revised_at),
            started_at: job.started_at.map(format_timestamp),
            finished_at: job.finished_at.map(format_timestamp),
            deleted_at: format_timestamp(job.deleted_at),
        })
    }

    /// Decode into a [`Job`]. Fails only for this row; the caller decides
    /// whether to skip it.
    pub fn decode(self, recurrences: &Recurrences) -> Result<Job> {
        let id = self.id;
        let bad = |reason: String| StoreError::Decode { id, reason };
        let timestamp = |column: &str, raw: &str| {
            parse_timestamp(raw).ok_or_else(|| bad(format!("{column} '{raw}' is not a timestamp")))
        };
        let optional = |column: &str, raw: Option<&str>| raw.map(|r| timestamp(column, r)).transpose();

        let args = deserialize_args(&self.args).map_err(|e| bad(format!("args: {e}")))?;
        let status: JobStatus = self.status.parse().map_err(bad)?;
        let interval = match self.interval {
            None | Some(0) => None,
            Some(i) => Some(u64::try_from(i).map_err(|_| bad(format!("negative interval {i}")))?),
        };
        let schedule = interval.map(|i| match self.schedule {
            Some(name) if !name.is_empty() => name,
            _ => recurrences.name_or_fake(i),
        });

        Ok(Job {
            id,
            site: self.site,
            nextrun: timestamp("nextrun", &self.nextrun)?,
            registered_at: timestamp("registered_at", &self.registered_at)?,
            revised_at: timestamp("revised_at", &self.revised_at)?,
            started_at: optional("started_at", self.started_at.as_deref())?,
            finished_at: optional("finished_at", self.finished_at.as_deref())?,
            deleted_at: timestamp("deleted_at", &self.deleted_at)?,
            hook: self.hook,
            hook_instance: self.hook_instance,
            args,
            args_digest: self.args_digest,
            interval,
            schedule,
            status,
        })
    }
}
