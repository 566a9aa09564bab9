use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::Result;
use crate::record::{args_digest, format_timestamp, now, serialize_args, JOB_COLUMNS, LIVE_DELETED_AT};
use crate::types::JobStatus;

/// Predicate on `nextrun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFilter {
    /// Strictly after now.
    Future,
    /// Now or earlier.
    Past,
    /// Inclusive range; the bounds may be given in either order.
    Between(DateTime<Utc>, DateTime<Utc>),
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// Filter for [`crate::JobStore::query`].
///
/// The default matches one live `waiting` or `running` job, earliest
/// `nextrun` first.
#[derive(Debug, Clone, PartialEq)]
pub struct JobQuery {
    pub site: Option<i64>,
    pub hook: Option<String>,
    pub hook_instance: Option<String>,
    /// Compared by digest, never by the stored text.
    pub args: Option<Vec<Value>>,
    pub time: Option<TimeFilter>,
    /// Empty matches every status.
    pub statuses: Vec<JobStatus>,
    pub order: SortOrder,
    /// `0` means no limit.
    pub limit: usize,
    pub include_deleted: bool,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            site: None,
            hook: None,
            hook_instance: None,
            args: None,
            time: None,
            statuses: JobStatus::live(),
            order: SortOrder::Asc,
            limit: 1,
            include_deleted: false,
        }
    }
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_hook(hook: impl Into<String>) -> Self {
        Self::new().hook(hook)
    }

    pub fn site(mut self, site: i64) -> Self {
        self.site = Some(site);
        self
    }

    pub fn hook(mut self, hook: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self
    }

    pub fn hook_instance(mut self, instance: impl Into<String>) -> Self {
        self.hook_instance = Some(instance.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn time(mut self, filter: TimeFilter) -> Self {
        self.time = Some(filter);
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn any_status(mut self) -> Self {
        self.statuses.clear();
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn unlimited(self) -> Self {
        self.limit(0)
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Resolve into a statement and its bound values. Relative time filters
    /// are pinned to the current second here, so they are part of the cache key.
    pub(crate) fn to_sql(&self) -> Result<(String, Vec<SqlValue>)> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(site) = self.site {
            clauses.push("site = ?".into());
            values.push(SqlValue::Integer(site));
        }
        if let Some(hook) = &self.hook {
            clauses.push("hook = ?".into());
            values.push(SqlValue::Text(hook.clone()));
        }
        if let Some(instance) = &self.hook_instance {
            clauses.push("hook_instance = ?".into());
            values.push(SqlValue::Text(instance.clone()));
        }
        if let Some(args) = &self.args {
            clauses.push("args_digest = ?".into());
            values.push(SqlValue::Text(args_digest(&serialize_args(args)?)));
        }
        match self.time {
            Some(TimeFilter::Future) => {
                clauses.push("nextrun > ?".into());
                values.push(SqlValue::Text(format_timestamp(now())));
            }
            Some(TimeFilter::Past) => {
                clauses.push("nextrun <= ?".into());
                values.push(SqlValue::Text(format_timestamp(now())));
            }
            Some(TimeFilter::Between(a, b)) => {
                clauses.push("nextrun BETWEEN ? AND ?".into());
                values.push(SqlValue::Text(format_timestamp(a.min(b))));
                values.push(SqlValue::Text(format_timestamp(a.max(b))));
            }
            Some(TimeFilter::At(at)) => {
                clauses.push("nextrun = ?".into());
                values.push(SqlValue::Text(format_timestamp(at)));
            }
            None => {}
        }
        if !self.statuses.is_empty() {
            clauses.push(format!("status IN ({})", placeholders(self.statuses.len())));
            values.extend(
                self.statuses
                    .iter()
                    .map(|s| SqlValue::Text(s.as_str().to_string())),
            );
        }
        if !self.include_deleted {
            clauses.push("deleted_at = ?".into());
            values.push(SqlValue::Text(LIVE_DELETED_AT.to_string()));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let dir = self.order.keyword();
        sql.push_str(&format!(" ORDER BY nextrun {dir}, id {dir}"));
        if self.limit > 0 {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(sql_count(self.limit)));
        }
        Ok((sql, values))
    }
}

/// Columns an operator listing may be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrderBy {
    #[default]
    Id,
    Site,
    Hook,
    HookInstance,
    Args,
    Nextrun,
    Interval,
    Status,
}

impl ListOrderBy {
    pub fn as_column(&self) -> &'static str {
        match self {
            ListOrderBy::Id => "id",
            ListOrderBy::Site => "site",
            ListOrderBy::Hook => "hook",
            ListOrderBy::HookInstance => "hook_instance",
            ListOrderBy::Args => "args",
            ListOrderBy::Nextrun => "nextrun",
            ListOrderBy::Interval => "interval",
            ListOrderBy::Status => "status",
        }
    }
}

impl FromStr for ListOrderBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "id" => Ok(ListOrderBy::Id),
            "site" => Ok(ListOrderBy::Site),
            "hook" => Ok(ListOrderBy::Hook),
            "hook_instance" => Ok(ListOrderBy::HookInstance),
            "args" => Ok(ListOrderBy::Args),
            "nextrun" => Ok(ListOrderBy::Nextrun),
            "interval" => Ok(ListOrderBy::Interval),
            "status" => Ok(ListOrderBy::Status),
            other => Err(format!("cannot order jobs by '{other}'")),
        }
    }
}

/// Operator listing: plain filters and pagination over every row,
/// soft-deleted ones included unless `deleted` says otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct JobListing {
    pub id: Option<i64>,
    pub site: Option<i64>,
    pub hook: Option<String>,
    pub status: Option<JobStatus>,
    /// `Some(true)` only soft-deleted rows, `Some(false)` only live ones.
    pub deleted: Option<bool>,
    pub limit: usize,
    /// 1-based.
    pub page: usize,
    pub order: SortOrder,
    pub order_by: ListOrderBy,
}

impl Default for JobListing {
    fn default() -> Self {
        Self {
            id: None,
            site: None,
            hook: None,
            status: None,
            deleted: None,
            limit: 20,
            page: 1,
            order: SortOrder::Desc,
            order_by: ListOrderBy::Id,
        }
    }
}

impl JobListing {
    pub(crate) fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(id) = self.id {
            clauses.push("id = ?");
            values.push(SqlValue::Integer(id));
        }
        if let Some(site) = self.site {
            clauses.push("site = ?");
            values.push(SqlValue::Integer(site));
        }
        if let Some(hook) = &self.hook {
            clauses.push("hook = ?");
            values.push(SqlValue::Text(hook.clone()));
        }
        if let Some(status) = self.status {
            clauses.push("status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        match self.deleted {
            Some(true) => clauses.push("deleted_at != ?"),
            Some(false) => clauses.push("deleted_at = ?"),
            None => {}
        }
        if self.deleted.is_some() {
            values.push(SqlValue::Text(LIVE_DELETED_AT.to_string()));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {} {} LIMIT ? OFFSET ?",
            self.order_by.as_column(),
            self.order.keyword()
        ));
        let offset = self.page.saturating_sub(1).saturating_mul(self.limit);
        values.push(SqlValue::Integer(sql_count(self.limit)));
        values.push(SqlValue::Integer(sql_count(offset)));
        (sql, values)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// A count as an SQLite integer, saturating. A negative LIMIT would mean
/// no limit at all.
pub(crate) fn sql_count<T: TryInto<i64>>(n: T) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_query_is_live_and_limited() {
        let (sql, values) = JobQuery::for_hook("wp_version_check").to_sql().unwrap();
        assert!(sql.contains("hook = ?"));
        assert!(sql.contains("status IN (?, ?)"));
        assert!(sql.contains("deleted_at = ?"));
        assert!(sql.ends_with("ORDER BY nextrun ASC, id ASC LIMIT ?"));
        assert_eq!(values.last(), Some(&SqlValue::Integer(1)));
    }

    #[test]
    fn args_are_matched_by_digest() {
        let (sql, values) = JobQuery::new().args(vec![json!(1)]).to_sql().unwrap();
        assert!(sql.contains("args_digest = ?"));
        assert_eq!(values[0], SqlValue::Text(args_digest("[1]")));
    }

    #[test]
    fn unrestricted_query_has_no_status_or_limit() {
        let (sql, _) = JobQuery::new()
            .any_status()
            .include_deleted()
            .unlimited()
            .order(SortOrder::Desc)
            .to_sql()
            .unwrap();
        assert!(!sql.contains("WHERE"));
        assert!(!sql.contains("LIMIT"));
        assert!(sql.contains("nextrun DESC"));
    }

    #[test]
    fn range_bounds_are_normalised() {
        let early = crate::record::parse_timestamp("2021-01-01 00:00:00").unwrap();
        let late = crate::record::parse_timestamp("2021-01-02 00:00:00").unwrap();
        let (_, values) = JobQuery::new()
            .any_status()
            .include_deleted()
            .time(TimeFilter::Between(late, early))
            .to_sql()
            .unwrap();
        assert_eq!(values[0], SqlValue::Text("2021-01-01 00:00:00".into()));
        assert_eq!(values[1], SqlValue::Text("2021-01-02 00:00:00".into()));
    }

    #[test]
    fn huge_limits_saturate_instead_of_going_negative() {
        let (_, values) = JobQuery::new().limit(usize::MAX).to_sql().unwrap();
        assert_eq!(values.last(), Some(&SqlValue::Integer(i64::MAX)));

        let listing = JobListing {
            limit: usize::MAX,
            page: 2,
            ..JobListing::default()
        };
        let (_, values) = listing.to_sql();
        assert_eq!(
            &values[values.len() - 2..],
            &[SqlValue::Integer(i64::MAX), SqlValue::Integer(i64::MAX)]
        );
        assert_eq!(sql_count(u64::MAX), i64::MAX);
        assert_eq!(sql_count(42_usize), 42);
    }

    #[test]
    fn listing_paginates_and_orders_by_whitelisted_column() {
        let listing = JobListing {
            deleted: Some(true),
            limit: 10,
            page: 3,
            order_by: "nextrun".parse().unwrap(),
            order: "asc".parse().unwrap(),
            ..JobListing::default()
        };
        let (sql, values) = listing.to_sql();
        assert!(sql.contains("deleted_at != ?"));
        assert!(sql.ends_with("ORDER BY nextrun ASC LIMIT ? OFFSET ?"));
        assert_eq!(&values[1..], &[SqlValue::Integer(10), SqlValue::Integer(20)]);
        assert!("nextrun; DROP TABLE jobs".parse::<ListOrderBy>().is_err());
    }
}
