use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{error, info};

use crate::error::{Result, StoreError};
use crate::query::sql_count;
use crate::record::{
    args_digest, deserialize_args, format_timestamp, now, serialize_args, LIVE_DELETED_AT,
};
use crate::recurrence::Recurrences;

/// Version written to `PRAGMA user_version` once every step has run.
pub const SCHEMA_VERSION: u32 = 12;

/// Final shape of the jobs table. Used for fresh databases and as the
/// target of the version 12 rebuild, so both paths end up identical.
const CREATE_JOBS_TABLE: &str = "
    CREATE TABLE jobs (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        site          INTEGER NOT NULL,
        hook          TEXT    NOT NULL,
        hook_instance TEXT    NOT NULL DEFAULT '',
        args          TEXT    NOT NULL,
        args_digest   TEXT    NOT NULL,
        nextrun       TEXT    NOT NULL,
        interval      INTEGER,
        status        TEXT    NOT NULL DEFAULT 'waiting'
                      CHECK (status IN ('waiting', 'running', 'done')),
        schedule      TEXT,
        registered_at TEXT    NOT NULL,
        revised_at    TEXT    NOT NULL,
        started_at    TEXT,
        finished_at   TEXT,
        deleted_at    TEXT    NOT NULL DEFAULT '9999-12-31 23:59:59'
    );";

// deleted_at is part of the identity: one live row per identity, plus any
// number of rows soft-deleted at distinct times.
const CREATE_JOBS_INDEXES: &str = "
    CREATE UNIQUE INDEX idx_jobs_uniqueness
        ON jobs (site, hook, hook_instance, args_digest, deleted_at);
    CREATE INDEX idx_jobs_status ON jobs (status, deleted_at);
    CREATE INDEX idx_jobs_status_finished_at ON jobs (status, finished_at);
    CREATE INDEX idx_jobs_site ON jobs (site, deleted_at);
    CREATE INDEX idx_jobs_hook ON jobs (hook, deleted_at);";

/// Result of [`upgrade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Already at [`SCHEMA_VERSION`]; nothing ran.
    Current,
    /// No table existed; it was created at the current version.
    Created,
    Upgraded { from: u32, to: u32 },
}

struct StepContext<'a> {
    recurrences: &'a Recurrences,
    now: String,
}

struct Migration {
    version: u32,
    summary: &'static str,
    apply: fn(&Transaction<'_>, &StepContext<'_>) -> Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        summary: "add and populate schedule",
        apply: add_schedule,
    },
    Migration {
        version: 3,
        summary: "index site and hook",
        apply: index_site_and_hook,
    },
    Migration {
        version: 4,
        summary: "drop nextrun index",
        apply: drop_nextrun_index,
    },
    Migration {
        version: 5,
        summary: "add deleted_at",
        apply: add_deleted_at,
    },
    Migration {
        version: 6,
        summary: "add finished_at",
        apply: add_finished_at,
    },
    Migration {
        version: 7,
        summary: "add lifecycle timestamps",
        apply: add_lifecycle_timestamps,
    },
    Migration {
        version: 9,
        summary: "drop legacy log table",
        apply: drop_log_table,
    },
    Migration {
        version: 10,
        summary: "add identity columns and clean up finished jobs",
        apply: add_identity_columns,
    },
    Migration {
        version: 11,
        summary: "enforce job identity",
        apply: add_uniqueness_index,
    },
    Migration {
        version: 12,
        summary: "rebuild with live sentinel",
        apply: rebuild_with_sentinel,
    },
];

pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(u32::try_from(version).unwrap_or(0))
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Bring the jobs table up to [`SCHEMA_VERSION`].
///
/// Runs inside a single `BEGIN EXCLUSIVE` transaction: other connections
/// never see a half-migrated table, and any failing step rolls back the whole
/// upgrade (the transaction is dropped without commit on every error path).
/// A database at version 0 with no table is created fresh; one with a table
/// is treated as the original version 1 layout.
pub fn upgrade(conn: &mut Connection, recurrences: &Recurrences) -> Result<UpgradeOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    let found = schema_version(&tx)?;

    if found == SCHEMA_VERSION {
        return Ok(UpgradeOutcome::Current);
    }
    if found > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    let outcome = if found == 0 && !table_exists(&tx, "jobs")? {
        tx.execute_batch(CREATE_JOBS_TABLE)?;
        tx.execute_batch(CREATE_JOBS_INDEXES)?;
        info!(version = SCHEMA_VERSION, "jobs table created");
        UpgradeOutcome::Created
    } else {
        let ctx = StepContext {
            recurrences,
            now: format_timestamp(now()),
        };
        let from = found.max(1);
        for step in MIGRATIONS.iter().filter(|m| m.version > from) {
            info!(version = step.version, summary = step.summary, "applying migration");
            (step.apply)(&tx, &ctx).map_err(|e| {
                error!(version = step.version, "migration failed, rolling back: {e}");
                StoreError::Migration {
                    version: step.version,
                    source: Box::new(e),
                }
            })?;
        }
        UpgradeOutcome::Upgraded {
            from: found,
            to: SCHEMA_VERSION,
        }
    };

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(outcome)
}

fn add_schedule(tx: &Transaction<'_>, ctx: &StepContext<'_>) -> Result<()> {
    tx.execute_batch("ALTER TABLE jobs ADD COLUMN schedule TEXT;")?;
    let mut stmt = tx.prepare(
        "UPDATE jobs SET schedule = ?1
         WHERE interval = ?2 AND status NOT IN ('failed', 'completed')",
    )?;
    for (interval, name) in ctx.recurrences.by_interval() {
        stmt.execute(rusqlite::params![name, sql_count(interval)])?;
    }
    Ok(())
}

fn index_site_and_hook(tx: &Transaction<'_>, _: &StepContext<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_jobs_site ON jobs (site);
         CREATE INDEX IF NOT EXISTS idx_jobs_hook ON jobs (hook);",
    )?;
    Ok(())
}

fn drop_nextrun_index(tx: &Transaction<'_>, _: &StepContext<'_>) -> Result<()> {
    tx.execute_batch("DROP INDEX IF EXISTS idx_jobs_nextrun;")?;
    Ok(())
}

fn add_deleted_at(tx: &Transaction<'_>, _: &StepContext<'_>) -> Result<()> {
    tx.execute_batch(
        "DROP INDEX IF EXISTS idx_jobs_status;
         DROP INDEX IF EXISTS idx_jobs_site;
         DROP INDEX IF EXISTS idx_jobs_hook;
         ALTER TABLE jobs ADD COLUMN deleted_at TEXT;
         CREATE INDEX idx_jobs_status ON jobs (status, deleted_at);
         CREATE INDEX idx_jobs_site ON jobs (site, deleted_at);
         CREATE INDEX idx_jobs_hook ON jobs (hook, deleted_at);",
    )?;
    Ok(())
}

fn add_finished_at(tx: &Transaction<'_>, _: &StepContext<'_>) -> Result<()> {
    tx.execute_batch(
        "ALTER TABLE jobs ADD COLUMN finished_at TEXT;
         CREATE INDEX idx_jobs_status_finished_at ON jobs (status, finished_at);",
    )?;
    Ok(())
}

fn add_lifecycle_timestamps(tx: &Transaction<'_>, ctx: &StepContext<'_>) -> Result<()> {
    // SQLite refuses non-constant defaults on ADD COLUMN, so backfill instead.
    tx.execute_batch(
        "ALTER TABLE jobs DROP COLUMN start;
         ALTER TABLE jobs ADD COLUMN registered_at TEXT;
         ALTER TABLE jobs ADD COLUMN revised_at TEXT;
         ALTER TABLE jobs ADD COLUMN started_at TEXT;",
    )?;
    tx.execute(
        "UPDATE jobs SET registered_at = ?1, revised_at = ?1",
        [&ctx.now],
    )?;
    Ok(())
}

fn drop_log_table(tx: &Transaction<'_>, _: &StepContext<'_>) -> Result<()> {
    tx.execute_batch("DROP TABLE IF EXISTS job_logs;")?;
    Ok(())
}

fn add_identity_columns(tx: &Transaction<'_>, _: &StepContext<'_>) -> Result<()> {
    tx.execute_batch(
        "ALTER TABLE jobs ADD COLUMN hook_instance TEXT;
         ALTER TABLE jobs ADD COLUMN args_digest TEXT;

         -- rows soft-deleted under the NULL convention are gone for good
         DELETE FROM jobs WHERE deleted_at IS NOT NULL;

         -- finished without a recorded finish time: nothing worth keeping
         DELETE FROM jobs
         WHERE status IN ('completed', 'failed') AND finished_at IS NULL;
         UPDATE jobs SET status = 'done' WHERE status IN ('completed', 'failed');

         UPDATE jobs SET hook_instance = nextrun
         WHERE interval IS NULL OR interval = 0;",
    )?;

    let rows: Vec<(i64, String)> = {
        let mut stmt = tx.prepare("SELECT id, args FROM jobs")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        rows
    };
    // Rewrite args in canonical form so the digest matches what lookups compute.
    let mut update =
        tx.prepare("UPDATE jobs SET args = ?1, args_digest = ?2 WHERE id = ?3")?;
    for (id, raw) in &rows {
        let args = serialize_args(&deserialize_args(raw)?)?;
        update.execute(rusqlite::params![args, args_digest(&args), id])?;
    }

    // Keep the most recently registered row of every identity.
    let removed = tx.execute(
        "DELETE FROM jobs WHERE id NOT IN (
            SELECT MAX(id) FROM jobs
            GROUP BY site, hook, IFNULL(hook_instance, ''), args_digest
        )",
        [],
    )?;
    info!(digests = rows.len(), duplicates_removed = removed, "identity columns populated");
    Ok(())
}

fn add_uniqueness_index(tx: &Transaction<'_>, _: &StepContext<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_uniqueness
            ON jobs (site, hook, hook_instance, args_digest);",
    )?;
    Ok(())
}

fn rebuild_with_sentinel(tx: &Transaction<'_>, ctx: &StepContext<'_>) -> Result<()> {
    tx.execute_batch(
        "DROP INDEX IF EXISTS idx_jobs_uniqueness;
         ALTER TABLE jobs RENAME TO jobs_legacy;",
    )?;
    tx.execute_batch(CREATE_JOBS_TABLE)?;

    // NULL hook_instance on recurring rows slipped past the version 11 index,
    // so duplicates are dropped again while copying.
    tx.execute(
        "INSERT INTO jobs (id, site, hook, hook_instance, args, args_digest, nextrun,
                           interval, status, schedule, registered_at, revised_at,
                           started_at, finished_at, deleted_at)
         SELECT id, site, hook,
                CASE WHEN IFNULL(interval, 0) = 0 THEN nextrun ELSE '' END,
                args, args_digest, nextrun, NULLIF(interval, 0), status,
                CASE WHEN IFNULL(interval, 0) = 0 THEN NULL ELSE schedule END,
                IFNULL(registered_at, ?1), IFNULL(revised_at, ?1),
                started_at, finished_at, IFNULL(deleted_at, ?2)
         FROM jobs_legacy
         WHERE id IN (
            SELECT MAX(id) FROM jobs_legacy
            GROUP BY site, hook,
                     CASE WHEN IFNULL(interval, 0) = 0 THEN nextrun ELSE '' END,
                     args_digest, IFNULL(deleted_at, ?2)
         )",
        rusqlite::params![ctx.now, LIVE_DELETED_AT],
    )?;

    tx.execute_batch("DROP TABLE jobs_legacy;")?;
    tx.execute_batch(CREATE_JOBS_INDEXES)?;
    Ok(())
}
