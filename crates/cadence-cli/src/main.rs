use std::path::Path;

use anyhow::{bail, Context};
use cadence_core::CadenceConfig;
use cadence_store::{JobListing, JobStatus, JobStore, ListOrderBy, SortOrder, StoreError, UpgradeOutcome};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

mod render;

/// Operator commands for the cadence job store
#[derive(Parser)]
#[command(name = "cadence")]
#[command(version)]
#[command(long_about = None)]
struct Cli {
    /// Config file (defaults to CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(long, env = "CADENCE_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the jobs table or bring it up to the current schema version
    Upgrade,
    /// List jobs, soft-deleted ones included
    Jobs(JobsArgs),
}

#[derive(clap::Args)]
struct JobsArgs {
    #[arg(long)]
    id: Option<i64>,

    #[arg(long)]
    site: Option<i64>,

    #[arg(long)]
    hook: Option<String>,

    /// waiting, running or done
    #[arg(long)]
    status: Option<JobStatus>,

    /// true for soft-deleted jobs only, false for live ones only
    #[arg(long)]
    deleted: Option<bool>,

    #[arg(long, default_value_t = 20)]
    limit: usize,

    #[arg(long, default_value_t = 1)]
    page: usize,

    /// asc or desc
    #[arg(long, default_value = "desc")]
    order: SortOrder,

    /// id, site, hook, hook_instance, args, nextrun, interval or status
    #[arg(long = "orderby", default_value = "id")]
    order_by: ListOrderBy,

    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
}

impl JobsArgs {
    fn listing(&self) -> JobListing {
        JobListing {
            id: self.id,
            site: self.site,
            hook: self.hook.clone(),
            status: self.status,
            deleted: self.deleted,
            limit: self.limit,
            page: self.page.max(1),
            order: self.order,
            order_by: self.order_by,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_cli=info,cadence_store=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = CadenceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = JobStore::open(&config).map_err(explain)?;

    match cli.command {
        Commands::Upgrade => upgrade(&store),
        Commands::Jobs(args) => jobs(&store, &args),
    }
}

fn upgrade(store: &JobStore) -> anyhow::Result<()> {
    match store.upgrade().map_err(explain)? {
        UpgradeOutcome::Current => println!("Database upgrade not required."),
        UpgradeOutcome::Created | UpgradeOutcome::Upgraded { .. } => {
            println!("Database version upgraded.")
        }
    }
    Ok(())
}

fn jobs(store: &JobStore, args: &JobsArgs) -> anyhow::Result<()> {
    let jobs = store.list(&args.listing()).map_err(explain)?;
    if jobs.is_empty() {
        bail!("No jobs found");
    }

    match args.format {
        Format::Table => print!("{}", render::table(&jobs)),
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(&jobs).context("encoding jobs")?
        ),
    }
    Ok(())
}

/// Turn the store failures an operator can act on into readable errors.
fn explain(e: StoreError) -> anyhow::Error {
    match e {
        StoreError::SchemaMissing => {
            anyhow::anyhow!("the jobs table does not exist; run `cadence upgrade` first")
        }
        StoreError::Unavailable(reason) => {
            anyhow::anyhow!("the job database is unavailable: {reason}")
        }
        other => anyhow::Error::new(other),
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_flags_map_onto_a_listing() {
        let cli = Cli::parse_from([
            "cadence", "jobs", "--hook", "wp_version_check", "--status", "running", "--deleted",
            "false", "--order", "asc", "--orderby", "nextrun", "--page", "3",
        ]);
        let Commands::Jobs(args) = cli.command else {
            panic!("expected the jobs command");
        };
        let listing = args.listing();
        assert_eq!(listing.hook.as_deref(), Some("wp_version_check"));
        assert_eq!(listing.status, Some(JobStatus::Running));
        assert_eq!(listing.deleted, Some(false));
        assert_eq!(listing.order, SortOrder::Asc);
        assert_eq!(listing.order_by, ListOrderBy::Nextrun);
        assert_eq!((listing.limit, listing.page), (20, 3));
    }

    #[test]
    fn jobs_defaults_match_the_store_listing() {
        let cli = Cli::parse_from(["cadence", "jobs"]);
        let Commands::Jobs(args) = cli.command else {
            panic!("expected the jobs command");
        };
        assert_eq!(args.listing(), JobListing::default());
    }

    #[test]
    fn unknown_order_column_is_refused() {
        assert!(Cli::try_parse_from(["cadence", "jobs", "--orderby", "password"]).is_err());
    }
}
