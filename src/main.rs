use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod db;
mod dedup;
mod deliver;
mod dispatch;
mod generator;
mod models;
mod pipeline;
mod report;
mod roster;
mod store;

use crate::config::Settings;
use crate::db::PgStore;
use crate::deliver::SmtpDeliverer;
use crate::dispatch::{Dispatcher, TokioSleep};
use crate::generator::MatchApiGenerator;
use crate::models::RunStats;
use crate::pipeline::{FacultyPipeline, PipelineOutcome};
use crate::store::ScheduleStore;

#[derive(Parser)]
#[command(name = "rfp-notifier")]
#[command(about = "Automated funding opportunity digests for ICC faculty", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Sync faculty profiles from a roster CSV without dispatching digests
    Sync {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Full automation: sync the roster, then dispatch digests to all due faculty
    Run {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Process one faculty member now, bypassing due-date gating
    Process {
        #[arg(long)]
        email: String,
    },
    /// Show system status
    Status,
    /// List all faculty with schedule and delivery totals
    List,
    /// Write the markdown daily report
    Report {
        #[arg(long, default_value = "daily-report.md")]
        out: PathBuf,
    },
    /// Reactivate a faculty member and resume their schedule
    Activate {
        #[arg(long)]
        email: String,
    },
    /// Deactivate a faculty member, pausing their schedule
    Deactivate {
        #[arg(long)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let today = Utc::now().date_naive();

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool, today).await?;
            println!("Seed data inserted.");
        }
        Commands::Sync { csv } => {
            let store = PgStore::new(pool.clone());
            let stats = roster::sync(&pool, &store, &csv, today)
                .await
                .context("roster sync failed")?;
            println!("Roster sync completed: {stats}.");
        }
        Commands::Run { csv, limit } => {
            let stats = run_automation(&pool, &settings, csv.as_deref(), limit, today).await?;
            println!("Run completed: {stats}.");
        }
        Commands::Process { email } => {
            process_one(&pool, &settings, &email, today).await?;
        }
        Commands::Status => {
            let store = PgStore::new(pool.clone());
            let counters = store.counters(today).await?;
            let due = store.select_due(today, Some(5)).await?;

            println!("RFP notifier status for {today}");
            println!(
                "  Faculty: {} total, {} active",
                counters.total_faculty, counters.active_faculty
            );
            println!(
                "  Today: {} attempts, {} sent, {} failed, {} skipped, {} tokens",
                counters.attempts_today,
                counters.sent_today,
                counters.failed_today,
                counters.skipped_today,
                counters.tokens_today
            );
            println!(
                "  Schedules: {} due, {} overdue, {} failed, {} paused",
                counters.due, counters.overdue, counters.failed_schedules,
                counters.paused_schedules
            );
            if !due.is_empty() {
                println!("  Next due:");
                for record in due {
                    println!(
                        "    - {} ({}, due {}, {} retries)",
                        record.profile.email,
                        record.profile.cadence,
                        record.next_due_date,
                        record.retry_count
                    );
                }
            }
        }
        Commands::List => {
            let faculty = db::list_faculty(&pool).await?;
            if faculty.is_empty() {
                println!("No faculty found.");
            }
            for entry in &faculty {
                let state = if entry.active { "active" } else { "inactive" };
                let next_due = entry
                    .next_due_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unscheduled".to_string());
                let status = entry.schedule_status.as_deref().unwrap_or("unscheduled");
                println!(
                    "- {} [{state}] cadence {}, {status}, next due {next_due}, {} attempts ({} sent)",
                    entry.email, entry.cadence, entry.total_attempts, entry.successful_sends
                );
            }
            if !faculty.is_empty() {
                println!("Total: {} faculty members", faculty.len());
            }
        }
        Commands::Report { out } => {
            let store = PgStore::new(pool.clone());
            let counters = store.counters(today).await?;
            let due = store.select_due(today, None).await?;
            let report = report::build_daily_report(today, &counters, &due);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Activate { email } => {
            if db::set_active(&pool, &email, true).await? {
                println!("Faculty {email} activated; schedule resumed.");
            } else {
                anyhow::bail!("faculty not found: {email}");
            }
        }
        Commands::Deactivate { email } => {
            if db::set_active(&pool, &email, false).await? {
                println!("Faculty {email} deactivated; schedule paused.");
            } else {
                anyhow::bail!("faculty not found: {email}");
            }
        }
    }

    Ok(())
}

/// The end-to-end run mode: roster sync, stale-processing release, due-set
/// selection, paced dispatch. Per-faculty failures are absorbed into the
/// returned counters; only hard sync/store/configuration errors propagate
/// (and fail the process with a non-zero exit).
async fn run_automation(
    pool: &PgPool,
    settings: &Settings,
    csv: Option<&std::path::Path>,
    limit: Option<i64>,
    today: NaiveDate,
) -> anyhow::Result<RunStats> {
    let store: Arc<dyn ScheduleStore> = Arc::new(PgStore::new(pool.clone()));

    if let Some(csv) = csv {
        let stats = roster::sync(pool, store.as_ref(), csv, today)
            .await
            .context("roster sync failed")?;
        tracing::info!(%stats, "roster sync step completed");
    } else {
        tracing::info!("no roster CSV given, skipping sync step");
    }

    let stale_before = Utc::now() - Duration::hours(settings.stale_processing_hours);
    let released = store.release_stale_processing(stale_before).await?;
    if released > 0 {
        tracing::warn!(released, "returned stale processing schedules to pending");
    }

    let due = store.select_due(today, limit.or(settings.due_limit)).await?;
    if due.is_empty() {
        tracing::info!("no faculty due for digests today");
        return Ok(RunStats::default());
    }

    let generator = Arc::new(MatchApiGenerator::from_settings(&settings.api)?);
    let deliverer = Arc::new(SmtpDeliverer::from_settings(
        &settings.smtp,
        &settings.digest_dir,
    )?);
    let pipeline = Arc::new(FacultyPipeline::new(
        Arc::clone(&store),
        generator,
        deliverer,
        settings.lookback_days,
    ));
    let dispatcher = Dispatcher::new(pipeline, settings.pacing.clone(), Arc::new(TokioSleep));

    Ok(dispatcher.dispatch(due, today).await)
}

/// Manual single-faculty mode. Bypasses due-date gating but runs the full
/// pipeline and updates schedule state identically; the exit code reflects
/// whether a digest was actually sent.
async fn process_one(
    pool: &PgPool,
    settings: &Settings,
    email: &str,
    today: NaiveDate,
) -> anyhow::Result<()> {
    let profile = db::fetch_profile(pool, email)
        .await?
        .with_context(|| format!("faculty not found: {email}"))?;
    if !profile.active {
        anyhow::bail!("faculty is inactive: {email}");
    }

    let store: Arc<dyn ScheduleStore> = Arc::new(PgStore::new(pool.clone()));
    store.initialize(&profile.email, profile.cadence, today).await?;

    let generator = Arc::new(MatchApiGenerator::from_settings(&settings.api)?);
    let deliverer = Arc::new(SmtpDeliverer::from_settings(
        &settings.smtp,
        &settings.digest_dir,
    )?);
    let pipeline = FacultyPipeline::new(
        Arc::clone(&store),
        generator,
        deliverer,
        settings.lookback_days,
    );

    let outcome = pipeline.process(&profile, today).await;
    if let Some(schedule) = store.schedule_for(&profile.email).await? {
        tracing::info!(
            email = %schedule.faculty_email,
            next_due = %schedule.next_due_date,
            status = %schedule.status,
            retries = schedule.retry_count,
            "schedule advanced"
        );
    }

    match outcome {
        PipelineOutcome::Sent { message_id } => {
            println!("Digest sent to {email} (message id {message_id}).");
            Ok(())
        }
        PipelineOutcome::Skipped => {
            anyhow::bail!("digest for {email} skipped as a duplicate of a recent send")
        }
        PipelineOutcome::Failed { reason } => {
            anyhow::bail!("processing failed for {email}: {reason}")
        }
    }
}
