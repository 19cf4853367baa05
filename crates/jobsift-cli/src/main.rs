use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobsift_core::MergeResult;
use jobsift_dedup::{
    run_with_report, CancellationToken, DedupConfig, DedupOptions, DedupRunReport,
};
use jobsift_storage::{InMemoryJobRepository, JobRepository, PgJobRepository};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobsift-cli")]
#[command(about = "JobSift duplicate detection & canonicalization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect duplicate postings and merge them into their canonical.
    Dedup(DedupArgs),
    /// Apply the bundled database migrations.
    Migrate,
}

#[derive(Debug, Args, Default)]
struct DedupArgs {
    /// Report what would be merged without writing anything.
    #[arg(long)]
    dry_run: bool,
    /// Maximum number of candidate jobs to analyze.
    #[arg(long)]
    limit: Option<usize>,
    /// Minimum title-embedding cosine similarity (default 0.98).
    #[arg(long)]
    threshold: Option<f32>,
    /// Run against a JSON snapshot of jobs instead of the database.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Directory for the per-run report.
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

impl DedupArgs {
    fn options(&self, config: &DedupConfig) -> DedupOptions {
        let mut options = config.options(self.dry_run);
        if self.limit.is_some() {
            options.limit = self.limit;
        }
        if let Some(threshold) = self.threshold {
            options.similarity_threshold = threshold;
        }
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = DedupConfig::from_env();

    match cli.command.unwrap_or(Commands::Dedup(DedupArgs::default())) {
        Commands::Dedup(args) => dedup(&config, &args).await?,
        Commands::Migrate => {
            let repo = PgJobRepository::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to database")?;
            repo.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn dedup(config: &DedupConfig, args: &DedupArgs) -> Result<()> {
    let options = args.options(config);
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current group and stopping");
            on_signal.cancel();
        }
    });

    let report = if let Some(path) = &args.snapshot {
        let repo = InMemoryJobRepository::load_snapshot(path)
            .await
            .with_context(|| format!("loading snapshot {}", path.display()))?;
        let report = execute(&repo, &options, &cancel).await?;
        if !options.dry_run && report.result.duplicates_merged > 0 {
            repo.save_snapshot(path)
                .await
                .with_context(|| format!("saving snapshot {}", path.display()))?;
        }
        report
    } else {
        let repo = PgJobRepository::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting to database")?;
        execute(&repo, &options, &cancel).await?
    };

    // Merges are already committed at this point; a report failure must not hide them.
    print_summary(&report.result);
    if let Some(dir) = args.report_dir.as_ref().or(config.reports_dir.as_ref()) {
        write_report(&report, dir).await;
    }
    Ok(())
}

async fn write_report(report: &DedupRunReport, dir: &Path) -> Option<PathBuf> {
    match report.write_to(dir).await {
        Ok(path) => {
            info!(path = %path.display(), "wrote dedup report");
            Some(path)
        }
        Err(err) => {
            warn!(
                dir = %dir.display(),
                error = %format!("{err:#}"),
                "could not write dedup report"
            );
            None
        }
    }
}

async fn execute<R>(
    repo: &R,
    options: &DedupOptions,
    cancel: &CancellationToken,
) -> Result<DedupRunReport>
where
    R: JobRepository + ?Sized,
{
    run_with_report(repo, options, cancel)
        .await
        .context("duplicate detection failed")
}

fn print_summary(result: &MergeResult) {
    let reduction = result
        .reduction_pct()
        .map(|pct| format!("{pct:.2}%"))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        concat!(
            "dedup complete: jobs_analyzed={} duplicate_groups={} duplicates_merged={} ",
            "locations_merged={} groups_failed={} reduction_pct={}",
        ),
        result.jobs_analyzed,
        result.duplicate_groups,
        result.duplicates_merged,
        result.locations_merged,
        result.groups_failed,
        reduction
    );
    if result.dry_run {
        println!("dry run: no changes made");
    }
    if result.cancelled {
        println!("run interrupted: only committed groups are reflected above");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_options() {
        let cli = Cli::parse_from([
            "jobsift-cli",
            "dedup",
            "--dry-run",
            "--limit",
            "50",
            "--threshold",
            "0.9",
        ]);
        let Some(Commands::Dedup(args)) = cli.command else {
            panic!("expected dedup command");
        };
        let options = args.options(&DedupConfig::from_lookup(|_| None));
        assert!(options.dry_run);
        assert_eq!(options.limit, Some(50));
        assert_eq!(options.similarity_threshold, 0.9);
    }

    #[test]
    fn defaults_follow_config() {
        let config = DedupConfig::from_lookup(|key| match key {
            "JOBSIFT_FETCH_LIMIT" => Some("10".to_string()),
            _ => None,
        });
        let options = DedupArgs::default().options(&config);
        assert!(!options.dry_run);
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.similarity_threshold, 0.98);
    }

    #[tokio::test]
    async fn report_write_failure_is_not_fatal() {
        let repo = InMemoryJobRepository::new(vec![]);
        let report = run_with_report(&repo, &DedupOptions::default(), &CancellationToken::new())
            .await
            .expect("run");

        let dir = tempfile::tempdir().expect("tempdir");
        let not_a_dir = dir.path().join("reports");
        std::fs::write(&not_a_dir, "occupied").expect("write file");
        assert_eq!(write_report(&report, &not_a_dir).await, None);

        let path = write_report(&report, dir.path()).await.expect("report path");
        assert!(path.ends_with("dedup_report.json"));
    }

    #[test]
    fn no_subcommand_parses() {
        let cli = Cli::parse_from(["jobsift-cli"]);
        assert!(cli.command.is_none());
    }
}
