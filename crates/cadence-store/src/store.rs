use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cadence_core::CadenceConfig;
use chrono::SubsecRound;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cache::QueryCache;
use crate::error::{Result, StoreError};
use crate::query::{sql_count, JobListing, JobQuery};
use crate::record::{
    args_digest, format_timestamp, live_sentinel, now, serialize_args, JobRow, JOB_COLUMNS,
    LIVE_DELETED_AT,
};
use crate::recurrence::Recurrences;
use crate::schema::{self, UpgradeOutcome};
use crate::types::{Job, JobChanges, JobStatus, NewJob, UpdateOutcome};

/// Persistent job store over one SQLite connection.
///
/// Every write is a single statement; concurrent writers in other processes
/// are coordinated by the uniqueness index, not by locks held here.
pub struct JobStore {
    db: Mutex<Connection>,
    cache: QueryCache,
    recurrences: Recurrences,
}

impl JobStore {
    /// Open the database at `config.database.path`.
    pub fn open(config: &CadenceConfig) -> Result<Self> {
        let conn = Connection::open(&config.database.path)?;
        Self::new(conn, config)
    }

    /// Wrap an open connection. The schema is not touched; call
    /// [`JobStore::upgrade`] before the first write to a new database.
    pub fn new(conn: Connection, config: &CadenceConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self {
            db: Mutex::new(conn),
            cache: QueryCache::new(config.cache.max_entries),
            recurrences: Recurrences::new(&config.recurrences),
        })
    }

    pub fn recurrences(&self) -> &Recurrences {
        &self.recurrences
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Run the schema upgrade. The cache is reset whatever the result.
    #[instrument(skip(self))]
    pub fn upgrade(&self) -> Result<UpgradeOutcome> {
        let outcome = {
            let mut db = self.lock();
            schema::upgrade(&mut db, &self.recurrences)
        };
        self.cache.reset();
        let outcome = outcome?;
        match outcome {
            UpgradeOutcome::Current => debug!("schema already current"),
            UpgradeOutcome::Created => info!("schema created"),
            UpgradeOutcome::Upgraded { from, to } => info!(from, to, "schema upgraded"),
        }
        Ok(outcome)
    }

    pub fn schema_version(&self) -> Result<u32> {
        schema::schema_version(&self.lock())
    }

    /// Point lookup by id, soft-deleted rows included.
    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<Option<Job>> {
        if let Some(job) = self.cache.job(id) {
            debug!("job cache hit");
            return Ok(Some(job));
        }

        let read_at = self.cache.generation();
        let row = self
            .lock()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                JobRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => {
                let job = row.decode(&self.recurrences)?;
                self.cache.store_job(&job, read_at);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Every live `waiting` or `running` job of a site.
    #[instrument(skip(self))]
    pub fn get_by_site(&self, site: i64) -> Result<Vec<Job>> {
        self.query(&JobQuery::new().site(site).unlimited())
    }

    /// Filtered read. Rows that fail to decode are logged and skipped.
    #[instrument(skip(self))]
    pub fn query(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let (sql, values) = query.to_sql()?;
        let rows = self.fetch(&sql, &values)?;
        Ok(self.decode_all(rows))
    }

    /// Register a new job. A job with the same identity already live yields
    /// [`StoreError::DuplicateKey`] and leaves the table untouched.
    #[instrument(skip(self, job), fields(hook = %job.hook, site = job.site))]
    pub fn insert(&self, job: NewJob) -> Result<Job> {
        let interval = job.interval.filter(|i| *i > 0);
        let schedule = interval.map(|i| {
            job.schedule
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| self.recurrences.name_or_fake(i))
        });
        let stamp = now();
        let mut record = Job {
            id: 0,
            site: job.site,
            hook: job.hook,
            hook_instance: String::new(),
            args: job.args,
            args_digest: String::new(),
            nextrun: job.nextrun.trunc_subsecs(0),
            interval,
            schedule,
            status: JobStatus::Waiting,
            registered_at: stamp,
            revised_at: stamp,
            started_at: None,
            finished_at: None,
            deleted_at: live_sentinel(),
        };
        let row = JobRow::from_job(&record)?;

        let id = {
            let db = self.lock();
            db.execute(
                "INSERT INTO jobs
                 (site, hook, hook_instance, args, args_digest, nextrun, interval,
                  status, schedule, registered_at, revised_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.site,
                    row.hook,
                    row.hook_instance,
                    row.args,
                    row.args_digest,
                    row.nextrun,
                    row.interval,
                    row.status,
                    row.schedule,
                    row.registered_at,
                    row.revised_at,
                    row.deleted_at,
                ],
            )?;
            db.last_insert_rowid()
        };
        self.cache.invalidate(&[id]);

        record.id = id;
        record.hook_instance = row.hook_instance;
        record.args_digest = row.args_digest;
        info!(job_id = id, "job registered");
        Ok(record)
    }

    /// Revise a job's metadata and bump `revised_at`.
    ///
    /// `hook_instance` is recomputed from the resulting interval and nextrun.
    /// If that makes the row collide with another job it is deleted, the
    /// other one kept, and [`UpdateOutcome::Removed`] returned.
    #[instrument(skip(self, changes))]
    pub fn update(&self, id: i64, changes: &JobChanges) -> Result<UpdateOutcome> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        let interval = changes
            .interval
            .map(|i| interval_value(id, i))
            .transpose()?;
        let nextrun = changes.nextrun.map(|t| SqlValue::Text(format_timestamp(t)));

        let schedule = match (&changes.schedule, changes.interval) {
            (Some(schedule), _) => Some(optional_text(schedule.clone())),
            // a one-off job has no recurrence name
            (None, Some(None)) => Some(SqlValue::Null),
            _ => None,
        };
        if let Some(schedule) = schedule {
            sets.push("schedule = ?".into());
            values.push(schedule);
        }
        if let Some(interval) = &interval {
            sets.push("interval = ?".into());
            values.push(interval.clone());
        }
        if let Some(nextrun) = &nextrun {
            sets.push("nextrun = ?".into());
            values.push(nextrun.clone());
        }
        if let Some(status) = changes.status {
            sets.push("status = ?".into());
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(started_at) = changes.started_at {
            sets.push("started_at = ?".into());
            values.push(SqlValue::Text(format_timestamp(started_at)));
        }
        if let Some(finished_at) = changes.finished_at {
            sets.push("finished_at = ?".into());
            values.push(SqlValue::Text(format_timestamp(finished_at)));
        }
        sets.push("revised_at = ?".into());
        values.push(SqlValue::Text(format_timestamp(now())));

        // SET expressions see the old row, so the new values are bound again.
        let interval_expr = match interval {
            Some(v) => {
                values.push(v);
                "?"
            }
            None => "interval",
        };
        let nextrun_expr = match nextrun {
            Some(v) => {
                values.push(v);
                "?"
            }
            None => "nextrun",
        };
        sets.push(format!(
            "hook_instance = CASE WHEN IFNULL({interval_expr}, 0) = 0 THEN {nextrun_expr} ELSE '' END"
        ));

        let mut sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
        values.push(SqlValue::Integer(id));
        if let Some(status) = changes.status {
            let allowed = status.predecessors();
            sql.push_str(&format!(
                " AND status IN ({})",
                vec!["?"; allowed.len()].join(", ")
            ));
            values.extend(allowed.iter().map(|s| SqlValue::Text(s.as_str().to_string())));
        }

        let db = self.lock();
        let outcome = match db.execute(&sql, params_from_iter(values.iter())) {
            Ok(0) => return explain_unchanged(&db, id, changes.status),
            Ok(_) => UpdateOutcome::Updated,
            Err(e) => match StoreError::from(e) {
                StoreError::DuplicateKey => {
                    warn!(job_id = id, "revision collides with another job, removing it");
                    db.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
                    UpdateOutcome::Removed
                }
                other => return Err(other),
            },
        };
        drop(db);

        self.cache.invalidate(&[id]);
        debug!(?outcome, "job revised");
        Ok(outcome)
    }

    /// Mark a live job deleted as of now. Returns `false` when there was no
    /// live row with that id, which includes one already deleted.
    #[instrument(skip(self))]
    pub fn soft_delete(&self, id: i64) -> Result<bool> {
        let stamp = format_timestamp(now());
        let deleted = soft_delete_row(&self.lock(), id, &stamp)?;
        if deleted {
            self.cache.invalidate(&[id]);
            info!(job_id = id, "job deleted");
        }
        Ok(deleted)
    }

    /// Soft-delete up to `limit` live jobs of `hook` on `site`, optionally
    /// only those with exactly `args`. `limit == 0` means no bound.
    #[instrument(skip(self, args))]
    pub fn clear_all(
        &self,
        site: i64,
        hook: &str,
        args: Option<&[Value]>,
        limit: usize,
    ) -> Result<usize> {
        let digest = args
            .map(|a| serialize_args(a).map(|s| args_digest(&s)))
            .transpose()?;
        let stamp = format_timestamp(now());

        let db = self.lock();
        let ids: Vec<i64> = {
            let mut sql = String::from(
                "SELECT id FROM jobs
                 WHERE site = ? AND hook = ? AND deleted_at = ?
                   AND status IN ('waiting', 'running')",
            );
            let mut values = vec![
                SqlValue::Integer(site),
                SqlValue::Text(hook.to_string()),
                SqlValue::Text(LIVE_DELETED_AT.to_string()),
            ];
            if let Some(digest) = digest {
                sql.push_str(" AND args_digest = ?");
                values.push(SqlValue::Text(digest));
            }
            sql.push_str(" ORDER BY nextrun, id LIMIT ?");
            values.push(SqlValue::Integer(if limit == 0 { -1 } else { sql_count(limit) }));

            let mut stmt = db.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(values.iter()), |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            ids
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE jobs SET deleted_at = ? WHERE deleted_at = ? AND id IN ({})",
            vec!["?"; ids.len()].join(", ")
        );
        let mut values = vec![
            SqlValue::Text(stamp.clone()),
            SqlValue::Text(LIVE_DELETED_AT.to_string()),
        ];
        values.extend(ids.iter().map(|id| SqlValue::Integer(*id)));

        let count = match db.execute(&sql, params_from_iter(values.iter())) {
            Ok(n) => n,
            Err(e) => match StoreError::from(e) {
                StoreError::DuplicateKey => {
                    warn!("bulk clear collided, clearing row by row");
                    let mut cleared = 0;
                    for id in &ids {
                        if soft_delete_row(&db, *id, &stamp)? {
                            cleared += 1;
                        }
                    }
                    cleared
                }
                other => return Err(other),
            },
        };
        drop(db);

        self.cache.invalidate(&ids);
        info!(count, "jobs cleared");
        Ok(count)
    }

    /// Move a live `waiting` job to `running`. Only one of several competing
    /// callers gets `true`.
    #[instrument(skip(self))]
    pub fn claim(&self, id: i64) -> Result<bool> {
        let stamp = format_timestamp(now());
        let claimed = self.lock().execute(
            "UPDATE jobs SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'waiting' AND deleted_at = ?3",
            params![stamp, id, LIVE_DELETED_AT],
        )? == 1;
        if claimed {
            self.cache.invalidate(&[id]);
            debug!(job_id = id, "job claimed");
        }
        Ok(claimed)
    }

    /// Record the end of a run. One-off jobs become `done`; recurring jobs go
    /// back to `waiting` one interval later. `false` if the job was not running.
    ///
    /// `running → waiting` for a recurring job is the only backwards status
    /// move the store makes. The row stands for the whole series, and each
    /// occurrence starts over as `waiting`. [`JobStore::update`] never allows it.
    #[instrument(skip(self))]
    pub fn finish(&self, id: i64) -> Result<bool> {
        let stamp = format_timestamp(now());
        let finished = self.lock().execute(
            "UPDATE jobs SET
                finished_at = ?1,
                status  = CASE WHEN IFNULL(interval, 0) = 0 THEN 'done' ELSE 'waiting' END,
                nextrun = CASE WHEN IFNULL(interval, 0) = 0 THEN nextrun
                               ELSE datetime(nextrun, '+' || interval || ' seconds') END
             WHERE id = ?2 AND status = 'running'",
            params![stamp, id],
        )? == 1;
        if finished {
            self.cache.invalidate(&[id]);
            debug!(job_id = id, "job finished");
        }
        Ok(finished)
    }

    /// Operator listing. Not cached.
    #[instrument(skip(self))]
    pub fn list(&self, listing: &JobListing) -> Result<Vec<Job>> {
        let (sql, values) = listing.to_sql();
        let rows: Vec<JobRow> = {
            let db = self.lock();
            let mut stmt = db.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), JobRow::from_row)?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };
        Ok(self.decode_all(rows))
    }

    // --- private helpers ---------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch(&self, sql: &str, values: &[SqlValue]) -> Result<Vec<JobRow>> {
        let key = self.cache.key(sql, values);
        if let Some(rows) = self.cache.rows(&key) {
            debug!(rows = rows.len(), "query cache hit");
            return Ok(rows);
        }

        let rows: Vec<JobRow> = {
            let db = self.lock();
            let mut stmt = db.prepare(sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), JobRow::from_row)?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };
        self.cache.store_rows(key, rows.clone());
        Ok(rows)
    }

    fn decode_all(&self, rows: Vec<JobRow>) -> Vec<Job> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.id;
                match row.decode(&self.recurrences) {
                    Ok(job) => Some(job),
                    Err(e) => {
                        warn!(job_id = id, "skipping job: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Soft-delete one live row. A twin deleted in the same second already owns
/// that identity, so the row is removed outright instead.
fn soft_delete_row(db: &Connection, id: i64, stamp: &str) -> Result<bool> {
    match db.execute(
        "UPDATE jobs SET deleted_at = ?1 WHERE id = ?2 AND deleted_at = ?3",
        params![stamp, id, LIVE_DELETED_AT],
    ) {
        Ok(n) => Ok(n > 0),
        Err(e) => match StoreError::from(e) {
            StoreError::DuplicateKey => {
                warn!(job_id = id, "deleted twin already exists, removing job");
                db.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
                Ok(true)
            }
            other => Err(other),
        },
    }
}

/// Work out why an `UPDATE` touched nothing.
fn explain_unchanged(db: &Connection, id: i64, to: Option<JobStatus>) -> Result<UpdateOutcome> {
    let current: Option<String> = db
        .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    match (current, to) {
        (Some(from), Some(to)) => {
            let from = from
                .parse()
                .map_err(|reason| StoreError::Decode { id, reason })?;
            Err(StoreError::InvalidTransition { id, from, to })
        }
        _ => Ok(UpdateOutcome::Missing),
    }
}

fn interval_value(id: i64, interval: Option<u64>) -> Result<SqlValue> {
    match interval.filter(|i| *i > 0) {
        Some(i) => i64::try_from(i)
            .map(SqlValue::Integer)
            .map_err(|_| StoreError::Decode {
                id,
                reason: format!("interval {i} does not fit in a column"),
            }),
        None => Ok(SqlValue::Null),
    }
}

fn optional_text(value: Option<String>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Text)
}
