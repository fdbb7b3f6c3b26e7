mod ai;
mod config;
mod engine;
mod gmail;
mod ledger;
mod models;
mod pacing;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, EngineConfig};
use engine::{Engine, RunStats};
use gmail::{GmailConfig, GmailSource, ReadOnlySource};
use ledger::{CsvLedgerStore, Ledger, LedgerStore, MemoryLedgerStore};
use pacing::{RetryPolicy, ThreadSleeper};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "applytrack")]
#[command(about = "Track job applications from your mailbox into a CSV ledger")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan sent mail and inbox once and reconcile the ledger (default)
    Run,

    /// Print the ledger
    List,
}

#[derive(Args)]
struct RunArgs {
    /// Ledger CSV file
    #[arg(long, env = "APPLYTRACK_LEDGER", global = true)]
    ledger: Option<PathBuf>,

    /// File holding a Gmail OAuth access token
    #[arg(long, env = "APPLYTRACK_TOKEN_FILE", global = true)]
    token_file: Option<PathBuf>,

    /// Gmail label applied to processed messages
    #[arg(long, env = "APPLYTRACK_LABEL", default_value = config::DEFAULT_PROCESSED_LABEL, global = true)]
    label: String,

    /// Classifier model (gemini, gemini-flash, api-sonnet, api-haiku, gpt-5.2, gpt-4o)
    #[arg(short, long, env = "APPLYTRACK_MODEL", default_value = config::DEFAULT_MODEL, global = true)]
    model: String,

    /// Number of days to look back
    #[arg(short, long, default_value_t = config::DEFAULT_LOOKBACK_DAYS, global = true)]
    days: u32,

    /// Classifier attempts per message before giving up
    #[arg(long, default_value_t = 3, global = true)]
    retries: u32,

    /// Seconds between classifier retries
    #[arg(long, default_value_t = 30, global = true)]
    retry_delay: u64,

    /// Seconds to pause after each accepted sent-mail event
    #[arg(long, default_value_t = 31, global = true)]
    outbound_pause: u64,

    /// Seconds to pause after each accepted inbox event
    #[arg(long, default_value_t = 46, global = true)]
    inbound_pause: u64,

    /// Dry run - classify and report without writing the ledger or labelling mail
    #[arg(long, global = true)]
    dry_run: bool,
}

impl RunArgs {
    fn into_config(self) -> Config {
        Config {
            ledger_path: self.ledger.unwrap_or_else(config::default_ledger_path),
            token_file: self.token_file.unwrap_or_else(config::default_token_path),
            processed_label: self.label,
            model: self.model,
            classifier_retry: RetryPolicy::new(self.retries, Duration::from_secs(self.retry_delay)),
            engine: EngineConfig {
                lookback_days: self.days,
                outbound_pause: Duration::from_secs(self.outbound_pause),
                inbound_pause: Duration::from_secs(self.inbound_pause),
                ..EngineConfig::default()
            },
            dry_run: self.dry_run,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = cli.run.into_config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config),
        Commands::List => list(&config),
    }
}

fn run(config: Config) -> Result<()> {
    let store = CsvLedgerStore::new(config.ledger_path.clone());
    let sleeper = ThreadSleeper;

    let spec = ai::resolve_model(&config.model)?;
    let provider = ai::create_provider(&spec)?;
    let classifier = ai::LlmClassifier::new(provider, config.classifier_retry, &sleeper);

    let token = config::read_access_token(std::env::var("GMAIL_ACCESS_TOKEN").ok(), &config.token_file)?;
    let gmail = GmailSource::connect(GmailConfig {
        access_token: token,
        processed_label: config.processed_label.clone(),
    })
    .context("Failed to connect to Gmail")?;

    let today = chrono::Local::now().date_naive();
    info!(
        "Reconciling {} against the last {} days of mail using {}",
        store.path().display(),
        config.engine.lookback_days,
        spec.model_id
    );

    if config.dry_run {
        let preview = MemoryLedgerStore::with_records(store.load()?);
        let source = ReadOnlySource::new(&gmail);
        let stats = Engine::new(&classifier, &source, &preview, &sleeper, config.engine, today).run()?;
        print_stats(&stats);
        println!(
            "\n(Dry run - {} ledger write(s) skipped, no messages labelled)",
            preview.save_count()
        );
        print_records(&Ledger::new(preview.snapshot()));
        return Ok(());
    }

    let stats = Engine::new(&classifier, &gmail, &store, &sleeper, config.engine, today).run()?;
    print_stats(&stats);
    println!("\nLedger: {}", store.path().display());
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = CsvLedgerStore::new(config.ledger_path.clone());
    let ledger = Ledger::new(store.load()?);
    if ledger.records().is_empty() {
        println!("No applications in {}.", store.path().display());
        return Ok(());
    }
    print_records(&ledger);
    Ok(())
}

fn print_stats(stats: &RunStats) {
    println!("\nResults:");
    println!("  Threads scanned:   {}", stats.threads_scanned);
    println!("  New applications:  {}", stats.inserted);
    println!("  Status updates:    {}", stats.updated);
    println!("  No change:         {}", stats.unchanged);
    println!("  Backfilled:        {}", stats.backfilled);
    println!("  Messages labelled: {}", stats.marked);
    if stats.no_signal > 0 {
        println!("  No usable signal:  {}", stats.no_signal);
    }
    if stats.backfill_missed > 0 {
        println!("  History not found: {} (will retry next run)", stats.backfill_missed);
    }
    if stats.already_processed > 0 {
        println!("  Already processed: {}", stats.already_processed);
    }
}

fn print_records(ledger: &Ledger) {
    println!("\n{:<12} {:<14} {:<25} {:<30}", "APPLIED", "STATUS", "COMPANY", "ROLE");
    println!("{}", "-".repeat(84));
    for record in ledger.records() {
        println!(
            "{:<12} {:<14} {:<25} {:<30}",
            record.applied_date.to_string(),
            record.status.to_string(),
            truncate(&record.company, 23),
            truncate(&record.role, 28)
        );
        if let Some(notes) = &record.notes {
            println!("{:<12} {}", "", notes);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments_means_default_run() {
        let cli = Cli::try_parse_from(["applytrack"]).unwrap();
        assert!(cli.command.is_none());

        let config = cli.run.into_config();
        assert_eq!(config.engine.lookback_days, 7);
        assert_eq!(config.processed_label, "JobTracker-Processed");
        assert_eq!(config.classifier_retry.attempts, 3);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "applytrack",
            "--days",
            "14",
            "--ledger",
            "/tmp/apps.csv",
            "--inbound-pause",
            "0",
            "--dry-run",
        ])
        .unwrap();
        let config = cli.run.into_config();
        assert_eq!(config.engine.lookback_days, 14);
        assert_eq!(config.ledger_path, PathBuf::from("/tmp/apps.csv"));
        assert_eq!(config.engine.inbound_pause, Duration::ZERO);
        assert!(config.dry_run);
    }

    #[test]
    fn test_run_subcommand_accepts_flags() {
        let cli = Cli::try_parse_from(["applytrack", "run", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert!(cli.run.into_config().dry_run);

        let cli = Cli::try_parse_from(["applytrack", "run", "--days", "3", "-m", "api-haiku"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run)));
        let config = cli.run.into_config();
        assert_eq!(config.engine.lookback_days, 3);
        assert_eq!(config.model, "api-haiku");
        assert!(!config.dry_run);
    }

    #[test]
    fn test_list_subcommand() {
        let cli = Cli::try_parse_from(["applytrack", "list", "--ledger", "apps.csv"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::List)));
        assert_eq!(cli.run.into_config().ledger_path, PathBuf::from("apps.csv"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long company name", 10), "a very ...");
    }
}
