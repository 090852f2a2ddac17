//! Tripwire CLI
//!
//! Command-line interface for the Tripwire alerting engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tripwire::alerting::{build_sink, AlertEngine, NotificationSink, Scanner};
use tripwire::db::{Database, MemoryStore};
use tripwire::ingest::IngestService;
use tripwire::models::{AlertStatistics, ErrorReport};
use tripwire::config::lookback;
use tripwire::Config;

/// Tripwire - alerting for application error reports
#[derive(Parser)]
#[command(name = "tripwire")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "TRIPWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use the in-memory store instead of PostgreSQL
    #[arg(long, global = true)]
    memory: bool,

    /// Output format (for commands that print results)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic scanner until interrupted
    Serve,

    /// Record one error report and evaluate it
    Ingest {
        /// Reporting application
        #[arg(long)]
        app: String,

        /// API endpoint that failed
        #[arg(long)]
        api: String,

        /// HTTP status code
        #[arg(long)]
        status: u16,

        /// Error message
        #[arg(long)]
        message: Option<String>,

        /// When the error happened (RFC 3339 or ISO local date-time, UTC)
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// Run a single scan cycle
    Scan,

    /// Show alerting health
    Health,

    /// Inspect alert history
    Alerts {
        #[command(subcommand)]
        command: AlertsCommands,
    },

    /// Delete errors and alert records past the retention period
    Cleanup,

    /// Send a test message through the configured notification channel
    TestNotification {
        /// Recipient (configured recipient if not specified)
        #[arg(long)]
        to: Option<String>,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum AlertsCommands {
    /// List recent alert records, newest first
    Recent {
        /// Time range (e.g., "30m", "1h", "24h")
        #[arg(long, default_value = "60m")]
        last: String,
    },

    /// Alert counts per kind
    Stats {
        /// Time range
        #[arg(long, default_value = "24h")]
        last: String,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = run(cli, config).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let format = cli.format;

    match cli.command {
        Commands::Serve => run_serve(config, cli.memory).await,
        Commands::Ingest {
            app,
            api,
            status,
            message,
            timestamp,
        } => {
            let report = ErrorReport {
                application_name: app,
                api_name: api,
                status_code: status,
                message,
                timestamp,
            };
            run_ingest(config, cli.memory, report, format).await
        }
        Commands::Scan => {
            let (db, engine) = open(&config, cli.memory).await?;
            let scanner = Scanner::new(engine, db, config.scheduler);
            print(format, &scanner.scan().await?, |s| {
                format!(
                    "Processed {} error(s): {} critical, {} high-frequency sent, {} failed",
                    s.processed, s.critical_sent, s.high_frequency_sent, s.failed
                )
            })
        }
        Commands::Health => run_health(config, cli.memory, format).await,
        Commands::Alerts { command } => run_alerts(config, cli.memory, command, format).await,
        Commands::Cleanup => {
            let (db, engine) = open(&config, cli.memory).await?;
            let scanner = Scanner::new(engine, db, config.scheduler);
            print(format, &scanner.cleanup().await?, |s| {
                format!(
                    "Deleted {} error(s) and {} alert record(s) older than {}",
                    s.errors_deleted, s.alerts_deleted, s.cutoff
                )
            })
        }
        Commands::TestNotification { to } => {
            let sink = build_sink(&config.notification)?;
            let recipient = to.unwrap_or_else(|| config.notification.recipient.clone());
            let delivered = sink.test_configuration(&recipient).await?;
            if delivered {
                println!("Test notification sent to {recipient} via {}", sink.channel_type());
                Ok(())
            } else {
                anyhow::bail!("{} channel did not accept the test notification", sink.channel_type())
            }
        }
        Commands::Db {
            command: DbCommands::Migrate,
        } => {
            let db = connect(&config, cli.memory).await?;
            db.migrate().await.context("running migrations")?;
            println!("Migrations applied");
            Ok(())
        }
    }
}

async fn connect(config: &Config, memory: bool) -> anyhow::Result<Database> {
    if memory {
        info!("Using in-memory store");
        return Ok(Database::in_memory(Arc::new(MemoryStore::new())));
    }
    Database::connect(config)
        .await
        .context("connecting to database")
}

async fn open(config: &Config, memory: bool) -> anyhow::Result<(Database, Arc<AlertEngine>)> {
    let db = connect(config, memory).await?;
    let sink: Arc<dyn NotificationSink> = Arc::from(build_sink(&config.notification)?);
    let engine = Arc::new(AlertEngine::new(
        &db,
        sink,
        config.alerting.clone(),
        &config.notification,
    ));
    Ok((db, engine))
}

async fn run_serve(config: Config, memory: bool) -> anyhow::Result<()> {
    let (db, engine) = open(&config, memory).await?;
    db.health_check().await.context("database health check")?;

    let scanner = Arc::new(Scanner::new(engine, db, config.scheduler.clone()));
    let handle = scanner.spawn();

    info!(timers = handle.task_count(), "Tripwire running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown();

    Ok(())
}

async fn run_ingest(
    config: Config,
    memory: bool,
    report: ErrorReport,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (db, engine) = open(&config, memory).await?;
    let service = IngestService::new(db.errors.clone(), Some(engine));
    let outcome = service.ingest(report).await?;

    #[derive(Serialize)]
    struct Ingested {
        id: uuid::Uuid,
        severity: String,
        critical_fired: bool,
        high_frequency_fired: bool,
    }

    let evaluation = outcome.evaluation.unwrap_or_default();
    let ingested = Ingested {
        id: outcome.event.id(),
        severity: outcome.event.severity().to_string(),
        critical_fired: evaluation.critical_fired,
        high_frequency_fired: evaluation.high_frequency_fired,
    };

    print(format, &ingested, |i| {
        format!(
            "Stored error {} ({}), critical alert: {}, high-frequency alert: {}",
            i.id, i.severity, i.critical_fired, i.high_frequency_fired
        )
    })
}

async fn run_health(config: Config, memory: bool, format: OutputFormat) -> anyhow::Result<()> {
    let (db, engine) = open(&config, memory).await?;
    db.health_check().await.context("database health check")?;

    let scanner = Scanner::new(engine, db, config.scheduler);
    let report = scanner.health_check().await?;

    print(format, &report, |r| {
        let mut out = format!(
            "Database:       connected\n\
             Total errors:   {}\n\
             Last hour:      {}\n\
             Alerts (24h):   {} ({} critical, {} high-frequency)\n\
             Failed (24h):   {}",
            r.total_errors,
            r.recent_errors,
            r.alerts_24h.total_count,
            r.alerts_24h.critical_count,
            r.alerts_24h.high_frequency_count,
            r.alerts_24h.failed_count,
        );
        if r.alerting_looks_quiet() {
            out.push_str("\nWarning: many errors but no alerts delivered, check alert configuration");
        }
        out
    })
}

async fn run_alerts(
    config: Config,
    memory: bool,
    command: AlertsCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let db = connect(&config, memory).await?;
    let now = Utc::now();

    match command {
        AlertsCommands::Recent { last } => {
            let since = range_start(now, &last)?;
            let records = db.alerts.find_recent(since).await?;
            print(format, &records, |records| {
                if records.is_empty() {
                    return format!("No alerts in the last {last}");
                }
                records
                    .iter()
                    .map(|r| {
                        format!(
                            "{}  {:<14}  {:<6}  {}",
                            r.sent_at.format("%Y-%m-%d %H:%M:%S"),
                            r.alert_kind.as_str(),
                            r.delivery_status.as_str(),
                            r.subject
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        AlertsCommands::Stats { last } => {
            let start = range_start(now, &last)?;
            let counts = db.alerts.count_by_kind_between(start, now).await?;
            let failed = db.alerts.count_failed_between(start, now).await?;
            let stats = AlertStatistics::from(&counts).with_failed(failed);
            print(format, &stats, |s| {
                format!(
                    "Alerts in the last {last}: {} critical, {} high-frequency, {} total delivered, {} failed",
                    s.critical_count, s.high_frequency_count, s.total_count, s.failed_count
                )
            })
        }
    }
}

fn range_start(now: DateTime<Utc>, range: &str) -> anyhow::Result<DateTime<Utc>> {
    let duration = humantime::parse_duration(range)
        .with_context(|| format!("invalid time range '{range}'"))?;
    let span = ChronoDuration::from_std(duration)
        .with_context(|| format!("time range '{range}' is too large"))?;
    Ok(lookback(now, span)?)
}

fn print<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => println!("{}", text(value)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}
