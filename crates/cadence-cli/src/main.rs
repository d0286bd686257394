use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use cadence_core::db;
use cadence_core::models::NewWindowData;
use cadence_core::repository::{
    MaterializationRepository, SqliteRepository, WindowRepository,
};
use cadence_core::worker::{MaterializationWorker, WorkerConfig};

mod cli;
mod config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::new().unwrap_or_default();

    let pool = match db::establish_connection(&config.database_path).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    };
    let repository = Arc::new(SqliteRepository::new(pool));
    let worker = MaterializationWorker::with_config(
        repository.clone(),
        WorkerConfig {
            look_ahead_months: config.worker.look_ahead_months,
            max_organizations: config.worker.max_organizations,
        },
    );

    let cli = cli::Cli::parse();
    let result = match cli.command {
        cli::Commands::Run(command) => run(&worker, command).await,
        cli::Commands::Prune(command) => prune(&repository, command).await,
        cli::Commands::Window(command) => match command.command {
            cli::WindowSubcommand::Init(command) => window_init(&repository, command).await,
            cli::WindowSubcommand::Status(command) => window_status(&repository, command).await,
        },
    };

    if let Err(e) = result {
        eprintln!("{} {e:#}", "Error:".red().bold());
        std::process::exit(1);
    }
}

fn parse_clock(at: Option<String>) -> anyhow::Result<DateTime<Utc>> {
    match at {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("invalid clock override '{raw}'"))?;
            Ok(parsed.with_timezone(&Utc))
        }
        None => Ok(Utc::now()),
    }
}

async fn run(worker: &MaterializationWorker, command: cli::RunCommand) -> anyhow::Result<()> {
    let now = parse_clock(command.at)?;

    match command.org {
        Some(organization_id) => {
            let summary = worker.run_for_organization(organization_id, now).await?;
            println!(
                "Organization {}: {} rules processed ({} failed), {} instances created, {} pruned{}",
                organization_id,
                summary.rules_processed,
                summary.rules_failed,
                summary.instances_created,
                summary.instances_pruned,
                if summary.truncated {
                    " (truncated, resumes next run)"
                } else {
                    ""
                },
            );
        }
        None => {
            let report = worker.run_all(now).await?;
            println!(
                "Sweep: {} organizations processed, {} failed, {} instances created, {} pruned",
                report.organizations_processed,
                report.organizations_failed,
                report.instances_created,
                report.instances_pruned,
            );
            for (organization_id, error) in &report.failures {
                eprintln!("  {} {}: {}", "failed".red(), organization_id, error);
            }
        }
    }
    Ok(())
}

async fn prune(repository: &SqliteRepository, command: cli::PruneCommand) -> anyhow::Result<()> {
    let pruned = repository
        .prune_expired_instances(command.org, Utc::now())
        .await?;
    println!("Pruned {pruned} instances for organization {}", command.org);
    Ok(())
}

async fn window_init(
    repository: &SqliteRepository,
    command: cli::WindowInitCommand,
) -> anyhow::Result<()> {
    let window = repository
        .initialize_window(
            NewWindowData {
                organization_id: command.org,
                hot_window_months: command.hot_months,
                retention_months: command.retention_months,
                priority: command.priority,
                max_instances_per_run: command.max_instances_per_run,
                notes: command.notes,
                creator_id: command.creator,
            },
            Utc::now(),
        )
        .await?;
    println!(
        "Window {} for organization {}: {} months ahead, {} months retained",
        window.id, window.organization_id, window.hot_window_months, window.retention_months
    );
    Ok(())
}

async fn window_status(
    repository: &SqliteRepository,
    command: cli::WindowStatusCommand,
) -> anyhow::Result<()> {
    let window = repository
        .find_window(command.org)
        .await?
        .context("no generation window for that organization")?;
    let status = repository.cleanup_status(command.org, Utc::now()).await?;

    println!("Organization:      {}", window.organization_id);
    println!(
        "Enabled:           {} (priority {})",
        window.is_enabled, window.priority
    );
    println!(
        "Hot window:        {} months ahead, ends {}",
        window.hot_window_months, window.window_ends_at
    );
    println!(
        "Retention:         {} months, {} of {} instances eligible for pruning",
        status.retention_months, status.instances_eligible_for_prune, status.total_instances
    );
    match window.last_run_at {
        Some(last_run) => println!(
            "Last run:          {} ({} instances)",
            last_run, window.last_run_instance_count
        ),
        None => println!("Last run:          never"),
    }
    if let Some(notes) = &window.notes {
        println!("Notes:             {notes}");
    }
    Ok(())
}
