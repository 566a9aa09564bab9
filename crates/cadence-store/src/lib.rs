//! `cadence-store`: SQLite-backed persistent job store for cron hosts.
//!
//! # Overview
//!
//! Jobs live in one `jobs` table. A job's identity is
//! `(site, hook, hook_instance, args_digest, deleted_at)` and is enforced by a
//! unique index, so concurrent writers coordinate through uniqueness
//! violations instead of locks. [`JobStore`] owns the table, [`Connector`]
//! turns scheduling requests into store calls, and [`schema::upgrade`] moves
//! older databases to the current layout.
//!
//! # Job identity
//!
//! | Kind      | `hook_instance`        | `deleted_at`                        |
//! |-----------|------------------------|-------------------------------------|
//! | one-off   | nextrun, canonical     | `9999-12-31 23:59:59` while live    |
//! | recurring | empty string           | `9999-12-31 23:59:59` while live    |

pub mod cache;
pub mod connector;
pub mod error;
pub mod query;
pub mod record;
pub mod recurrence;
pub mod schema;
pub mod store;
pub mod types;

pub use connector::{
    decide, Connector, CronBackend, Decision, ScheduleOutcome, ScheduledEvent, UnscheduleOutcome,
};
pub use error::{Result, StoreError};
pub use query::{JobListing, JobQuery, ListOrderBy, SortOrder, TimeFilter};
pub use recurrence::Recurrences;
pub use schema::{UpgradeOutcome, SCHEMA_VERSION};
pub use store::JobStore;
pub use types::{Job, JobChanges, JobStatus, NewJob, UpdateOutcome};
