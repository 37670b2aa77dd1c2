use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use rcv_core::cohort_plan::{
    CohortParams, DEFAULT_COHORT_LABEL, DEFAULT_COUNT_USERS, DEFAULT_COVERAGE_PER_MINDBLOCK,
    DEFAULT_DAYS,
};
use rcv_core::SettingsPatch;
use rcv_storage::SyntheticsStore;
use rcv_synthetics::control::{self, DEFAULT_RETAIN_DAYS};
use rcv_synthetics::{seed_cohort, seed_library, RunRequest, SyntheticsRunner};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_DB_PATH: &str = ".rcv/synthetics.db";

#[derive(Parser)]
#[command(name = "rcv")]
#[command(about = "Synthetic activity generator CLI", long_about = None)]
struct Cli {
    /// SQLite database path (falls back to RCV_DB_PATH).
    #[arg(long, global = true, default_value = "")]
    db: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed sim users and content engagements for a cohort
    Seed {
        #[arg(long, default_value_t = DEFAULT_COUNT_USERS)]
        count_users: u32,
        #[arg(long, default_value_t = DEFAULT_COVERAGE_PER_MINDBLOCK)]
        coverage: u32,
        #[arg(long, default_value_t = DEFAULT_DAYS)]
        days: u32,
        #[arg(long, default_value = DEFAULT_COHORT_LABEL)]
        label: String,
        #[arg(long, default_value_t = false)]
        no_orgs: bool,
        /// Also write onboarding runs for the first 200 users
        #[arg(long, default_value_t = false)]
        with_journeys: bool,
        /// Also queue welcome notifications for the first 100 users
        #[arg(long, default_value_t = false)]
        with_notifications: bool,
        /// Demo mindblock entries to create first
        #[arg(long)]
        library: Option<usize>,
    },
    /// Manage the mindblock library
    Library {
        #[command(subcommand)]
        action: LibraryCommands,
    },
    /// Run the generator once
    Run {
        #[arg(long)]
        target: Option<u32>,
        #[arg(long)]
        seed: Option<u32>,
    },
    /// Show settings and recent activity
    Status,
    /// Summarise activity over the last N hours
    Activity {
        #[arg(default_value_t = 24)]
        hours: u32,
    },
    /// Enable or pause scheduled generation
    Toggle {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    /// Update generator settings
    Settings {
        #[arg(long)]
        sessions_per_min: Option<u32>,
        #[arg(long)]
        max_per_run: Option<u32>,
        #[arg(long)]
        error_rate: Option<f64>,
        #[arg(long)]
        abandon_rate: Option<f64>,
    },
    /// Delete synthetic rows older than the retention window
    Cleanup {
        #[arg(long, default_value_t = DEFAULT_RETAIN_DAYS)]
        retain_days: u32,
    },
}

#[derive(Subcommand)]
enum LibraryCommands {
    /// Insert demo entries mb-0001..mb-N
    Seed { count: usize },
    /// List library entries
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let db_path = resolve_db_path(&cli.db);
    let store = open_store(&db_path)?;
    let now = Utc::now();

    match cli.command {
        Commands::Seed {
            count_users,
            coverage,
            days,
            label,
            no_orgs,
            with_journeys,
            with_notifications,
            library,
        } => {
            if let Some(count) = library {
                let created = seed_library(&store, count).context("Failed to seed library")?;
                println!("Created {created} library entries");
            }
            let params = CohortParams {
                count_users,
                coverage_per_mindblock: coverage,
                days,
                cohort_label: label,
                with_orgs: !no_orgs,
                with_journeys,
                with_notifications,
            };
            let report = seed_cohort(&store, &params, now).context("Failed to seed cohort")?;
            print_json(&report)?;
        }
        Commands::Library { action } => match action {
            LibraryCommands::Seed { count } => {
                let created = seed_library(&store, count).context("Failed to seed library")?;
                println!("Created {created} library entries");
            }
            LibraryCommands::List { limit } => {
                let entries =
                    control::mindblock_listing(&store, limit).context("Failed to list library")?;
                println!("Found {} mindblocks:", entries.len());
                for entry in &entries {
                    println!("- [{}] {} ({})", entry.id, entry.title, entry.family);
                }
            }
        },
        Commands::Run { target, seed } => {
            let result = SyntheticsRunner::default()
                .run_at(&store, RunRequest { target, seed }, now)
                .context("Generator run failed")?;
            print_json(&result)?;
        }
        Commands::Status => {
            let status = control::status(&store, now).context("Failed to read status")?;
            print_json(&status)?;
        }
        Commands::Activity { hours } => {
            let summary =
                control::activity(&store, hours, now).context("Failed to read activity")?;
            print_json(&summary)?;
        }
        Commands::Toggle { enabled } => {
            let settings =
                control::toggle(&store, enabled, now).context("Failed to toggle synthetics")?;
            print_json(&settings)?;
        }
        Commands::Settings {
            sessions_per_min,
            max_per_run,
            error_rate,
            abandon_rate,
        } => {
            let patch = SettingsPatch {
                enabled: None,
                sessions_per_min,
                max_per_run,
                error_rate,
                abandon_rate,
            };
            let settings = control::update_settings(&store, &patch, now)
                .context("Failed to update settings")?;
            print_json(&settings)?;
        }
        Commands::Cleanup { retain_days } => {
            let report =
                control::cleanup(&store, retain_days, now).context("Failed to clean up")?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(std::env::var("RCV_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_db_path(db_flag: &str) -> String {
    if !db_flag.trim().is_empty() {
        return db_flag.to_string();
    }
    if let Ok(value) = std::env::var("RCV_DB_PATH") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_DB_PATH.to_string()
}

fn open_store(db_path: &str) -> Result<SyntheticsStore> {
    let path = PathBuf::from(db_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    SyntheticsStore::open(&path).with_context(|| format!("Failed to open database {db_path}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{rendered}");
    Ok(())
}
