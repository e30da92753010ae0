use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use nitroscout_sync::{maybe_build_scheduler, RunSummary, ScoutPipeline, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nitroscout")]
#[command(about = "Aggregate, score and report developer-community leads")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Aggregate, pre-filter, score and publish today's reports.
    Run,
    /// Query every source and persist the candidate set without scoring.
    Aggregate,
    /// Score a persisted candidate set and publish its reports.
    Score {
        #[arg(long)]
        date: NaiveDate,
    },
    /// List the artifacts published for a date and print its run summary.
    Reports {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run on the configured cron until Ctrl-C.
    Schedule,
}

/// First Ctrl-C stops the run at the next stage boundary.
fn forward_interrupts(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current stage");
            flag.store(true, Ordering::SeqCst);
        }
    });
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} ({}): {} candidates, {} scored, {} omitted, {} reports",
        summary.run_date,
        if summary.is_completed() { "completed" } else { "cancelled" },
        summary.candidates,
        summary.scored,
        summary.omitted(),
        summary.reports.len()
    );
    for report in &summary.reports {
        println!("  {}", report.markdown_path.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nitroscout=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let pipeline = ScoutPipeline::from_config(config)
        .await
        .context("building pipeline")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            forward_interrupts(pipeline.interrupt_flag());
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Aggregate => {
            let set = pipeline.aggregate_at(Utc::now()).await?;
            println!(
                "aggregated {} candidates for {} ({} failed sources)",
                set.candidates.len(),
                set.run_date,
                set.failed_sources().len()
            );
        }
        Commands::Score { date } => {
            forward_interrupts(pipeline.interrupt_flag());
            let summary = pipeline.score_date(date).await?;
            print_summary(&summary);
        }
        Commands::Reports { date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            for name in pipeline.list_reports(date).await? {
                println!("{name}");
            }
            match RunSummary::load(pipeline.store(), date).await {
                Ok(summary) => println!("\n{}", summary.render_markdown()),
                Err(err) => warn!(error = %err, "no run summary"),
            }
        }
        Commands::Schedule => {
            let cron = pipeline.config().cron.clone();
            let mut sched = maybe_build_scheduler(Arc::new(pipeline))
                .await?
                .context("scheduler disabled; set NITROSCOUT_SCHEDULER_ENABLED=1")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
