//! Case administration CLI
//!
//! Operator tool over the Postgres case store: configuration checks,
//! overdue / due-soon listings for reminder jobs, and manual transitions.
//!
//! # Usage
//!
//! ```bash
//! # Validate the engine configuration ($BRANDENBED_CONFIG or --file)
//! case_admin check-config
//!
//! # Tickets past their SLA
//! case_admin overdue ticket
//!
//! # Leads whose follow-up falls in the next 24 hours
//! case_admin due-soon lead --hours 24
//!
//! # Inspect one case with its activity
//! case_admin show BB2025060001
//!
//! # Close a ticket with a note
//! case_admin transition BB2025060001 closed --note "Resolved by phone"
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use uuid::Uuid;

use brandenbed_cases::{
    obligations, Actor, CaseRecord, CaseReference, CaseRepository,
    CaseStatus, CaseType, EngineConfig, InMemoryDirectory, PgCaseStore, StaffId, StatusUpdate,
    SystemClock,
};

#[derive(Parser)]
#[command(name = "case_admin")]
#[command(version)]
#[command(about = "Operator CLI for the BrandenBed case lifecycle engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Postgres connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Engine configuration file (YAML)
    #[arg(long, global = true, env = "BRANDENBED_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the engine configuration
    CheckConfig,

    /// List open cases whose deadline has passed
    Overdue {
        /// lead, ticket, contract, maintenance or housekeeping
        case_type: String,
    },

    /// List open cases due within a window
    DueSoon {
        case_type: String,

        /// Window in hours (defaults to due_soon_hours from the config)
        #[arg(long)]
        hours: Option<u32>,
    },

    /// Show a case, its obligations and its activity log
    Show { reference: String },

    /// Move a case to another status
    Transition {
        reference: String,

        /// Target status, e.g. in_progress
        status: String,

        /// Note for the activity log (stored as resolution notes on close)
        #[arg(long)]
        note: Option<String>,

        /// Acting staff member id (system when omitted)
        #[arg(long)]
        staff: Option<Uuid>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,brandenbed_cases=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
            } else {
                eprintln!("{}: {:#}", "error".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;

    if let Commands::CheckConfig = cli.command {
        return cmd_check_config(&config, cli.format);
    }

    let database_url = cli
        .database_url
        .ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;
    let store = PgCaseStore::connect(&database_url)
        .await
        .context("connecting to Postgres")?;
    store.ensure_schema().await?;

    let repo = CaseRepository::new(
        Arc::new(store),
        Arc::new(SystemClock),
        Arc::new(InMemoryDirectory::new()),
        config,
    );

    match cli.command {
        Commands::CheckConfig => Ok(()),
        Commands::Overdue { case_type } => {
            let case_type = CaseType::parse(&case_type)?;
            let cases = repo.list_overdue(case_type).await?;
            print_cases(&format!("Overdue {case_type} cases"), &cases, repo.now(), cli.format)
        }
        Commands::DueSoon { case_type, hours } => {
            let case_type = CaseType::parse(&case_type)?;
            let window = hours.map(|h| Duration::hours(i64::from(h)));
            let cases = repo.list_due_soon(case_type, window).await?;
            print_cases(&format!("{case_type} cases due soon"), &cases, repo.now(), cli.format)
        }
        Commands::Show { reference } => {
            cmd_show(&repo, &CaseReference::parse(&reference)?, cli.format).await
        }
        Commands::Transition {
            reference,
            status,
            note,
            staff,
        } => {
            let reference = CaseReference::parse(&reference)?;
            let current = repo.get(&reference).await?;
            let to = CaseStatus::parse(current.case_type(), &status)?;
            let actor = staff.map_or(Actor::System, |id| Actor::Staff(StaffId(id)));
            let mut update = StatusUpdate::to(to);
            if let Some(note) = note {
                update = update.with_note(note);
            }
            let updated = repo.update_status(&reference, update, actor).await?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&updated)?),
                OutputFormat::Pretty => println!(
                    "{} {} {} → {}",
                    "OK".green().bold(),
                    updated.reference,
                    current.status,
                    updated.status.to_string().cyan()
                ),
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

fn cmd_check_config(config: &EngineConfig, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Pretty => {
            println!("{} Configuration valid", "OK".green().bold());
            println!("  {}", "Prefixes".bold());
            for case_type in CaseType::ALL {
                println!("    {:<13} {}", case_type.as_str(), config.prefix(case_type));
            }
            println!("  {}", "Categories".bold());
            for (name, category) in &config.categories {
                println!(
                    "    {:<20} {:>3}h  {:<9} {}",
                    name,
                    category.sla_hours,
                    category.default_priority.as_str(),
                    category.description.dimmed()
                );
            }
            println!(
                "  create_retry_limit={} due_soon_hours={}",
                config.create_retry_limit, config.due_soon_hours
            );
        }
    }
    Ok(())
}

fn print_cases(
    title: &str,
    cases: &[CaseRecord],
    now: DateTime<Utc>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(cases)?);
        return Ok(());
    }

    println!("{} ({})", title.bold(), cases.len());
    for case in cases {
        let deadline = obligations::deadline(case)
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        let marker = if obligations::is_overdue(case, now) {
            "OVERDUE".red().bold()
        } else {
            "due".yellow()
        };
        println!(
            "  {}  {:<18} {:<8} {} {}  {}",
            case.reference.as_str().cyan(),
            case.status.as_str(),
            case.priority.as_str(),
            marker,
            deadline,
            case.title
        );
    }
    Ok(())
}

async fn cmd_show(
    repo: &CaseRepository,
    reference: &CaseReference,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let record = repo.get(reference).await?;
    let facts = repo.obligations(reference).await?;
    let activity = repo.activities(reference).await?;

    if format == OutputFormat::Json {
        let output = serde_json::json!({
            "case": record,
            "obligations": facts,
            "activity": activity,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "{} {}  [{} / {}]",
        record.reference.as_str().cyan().bold(),
        record.title,
        record.case_type(),
        record.status.to_string().bold()
    );
    println!("  priority      {}", record.priority);
    if let Some(staff) = record.assigned_to {
        println!("  assigned_to   {staff}");
    }
    println!("  created       {}", record.created_at.format("%Y-%m-%d %H:%M"));
    if let Some(deadline) = facts.deadline {
        let label = deadline.format("%Y-%m-%d %H:%M").to_string();
        if facts.is_overdue {
            println!("  deadline      {}", label.red());
        } else {
            println!("  deadline      {label}");
        }
    }
    if record.case_type() == CaseType::Contract {
        println!("  days_remaining {}", facts.days_remaining);
    }
    println!("  age           {} day(s)", facts.days_since_created);

    println!("  {}", "Activity".bold());
    for entry in &activity {
        let author = entry
            .author
            .map(|a| a.to_string())
            .unwrap_or_else(|| "system".into());
        println!(
            "    {} {:<13} {:<36} {}",
            entry.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            entry.kind.as_str(),
            author,
            entry.text
        );
    }
    Ok(())
}
