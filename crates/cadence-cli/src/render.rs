//! Plain-text table output for `cadence jobs`.

use cadence_store::record::format_timestamp;
use cadence_store::Job;
use chrono::{DateTime, Utc};

/// Maximum column width before truncation
const MAX_COLUMN_WIDTH: usize = 32;

const HEADERS: [&str; 11] = [
    "id",
    "site",
    "hook",
    "hook_instance",
    "nextrun",
    "status",
    "registered_at",
    "revised_at",
    "started_at",
    "finished_at",
    "deleted_at",
];

pub fn table(jobs: &[Job]) -> String {
    let rows: Vec<[String; 11]> = jobs.iter().map(cells).collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count()).min(MAX_COLUMN_WIDTH);
        }
    }

    let mut out = line(&HEADERS.map(String::from), &widths);
    out.push_str(&line(&widths.map(|w| "-".repeat(w)), &widths));
    for row in &rows {
        out.push_str(&line(row, &widths));
    }
    out
}

fn cells(job: &Job) -> [String; 11] {
    [
        job.id.to_string(),
        job.site.to_string(),
        job.hook.clone(),
        job.hook_instance.clone(),
        format_timestamp(job.nextrun),
        job.status.to_string(),
        format_timestamp(job.registered_at),
        format_timestamp(job.revised_at),
        optional(job.started_at),
        optional(job.finished_at),
        format_timestamp(job.deleted_at),
    ]
}

fn optional(at: Option<DateTime<Utc>>) -> String {
    at.map(format_timestamp).unwrap_or_default()
}

fn line(cells: &[String; 11], widths: &[usize; 11]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{:<width$}", truncate(cell, width)))
        .collect();
    format!("{}\n", padded.join("  ").trim_end())
}

fn truncate(value: &str, max_width: usize) -> String {
    if value.chars().count() <= max_width {
        value.to_string()
    } else {
        let take = max_width.saturating_sub(3);
        format!("{}...", value.chars().take(take).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_store::record::{live_sentinel, parse_timestamp};
    use cadence_store::JobStatus;

    fn job(hook: &str) -> Job {
        let at = parse_timestamp("2030-01-01 00:00:00").unwrap();
        Job {
            id: 7,
            site: 1,
            hook: hook.to_string(),
            hook_instance: String::new(),
            args: Vec::new(),
            args_digest: String::new(),
            nextrun: at,
            interval: Some(3_600),
            schedule: Some("hourly".to_string()),
            status: JobStatus::Waiting,
            registered_at: at,
            revised_at: at,
            started_at: None,
            finished_at: None,
            deleted_at: live_sentinel(),
        }
    }

    #[test]
    fn header_and_rows_line_up() {
        let out = table(&[job("wp_version_check")]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id  site  hook"));
        assert!(lines[2].starts_with("7   1     wp_version_check"));
        assert!(lines[2].contains("2030-01-01 00:00:00"));
        assert!(lines[2].ends_with("9999-12-31 23:59:59"));
    }

    #[test]
    fn long_hooks_are_truncated() {
        let hook = "h".repeat(50);
        let out = table(&[job(&hook)]);
        assert!(!out.contains(&hook));
        assert!(out.contains(&format!("{}...", "h".repeat(MAX_COLUMN_WIDTH - 3))));
    }
}
