use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::{Commands, SubscriberCommands};
use dripfeed::config::{Config, LimiterMode};
use dripfeed::limiter::{LocalRateLimiter, RateLimiter, SharedRateLimiter};
use dripfeed::provider::{HttpGenerator, HttpSender, SubscriberDirectory};
use dripfeed::scheduler::Scheduler;
use dripfeed::store::records::Subscriber;
use dripfeed::store::{DeliveryStore, HistoryStore};
use dripfeed::worker::DeliveryWorker;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dripfeed")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("dripfeed.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Long-lived pieces shared by every command handler.
struct App {
    config: Config,
    store: Arc<DeliveryStore>,
    history: Arc<HistoryStore>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        if let Some(parent) = config.storage.db_path.parent() {
            fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let store = Arc::new(DeliveryStore::open(&config.storage.db_path)?);
        let history = Arc::new(HistoryStore::open(&config.storage.db_path)?);
        Ok(Self {
            config,
            store,
            history,
        })
    }

    fn limiter(&self) -> Result<Arc<dyn RateLimiter>> {
        let params = self.config.bucket_params();
        Ok(match self.config.rate_limits.mode {
            LimiterMode::Local => Arc::new(LocalRateLimiter::new(params)),
            LimiterMode::Shared => Arc::new(SharedRateLimiter::open(
                &self.config.storage.db_path,
                params,
            )?),
        })
    }

    fn worker(&self) -> Result<DeliveryWorker> {
        let generator = Arc::new(HttpGenerator::new(self.config.generator_config())?);
        let sender = Arc::new(HttpSender::new(self.config.sender_config())?);
        Ok(DeliveryWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.history),
            self.limiter()?,
            generator,
            sender,
            self.config.worker_config(),
        ))
    }
}

async fn run_application(cli: &Cli, config: Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let app = App::open(config)?;

    match &cli.command {
        Commands::Schedule { day } => handle_schedule_command(&app, *day),
        Commands::Tick => handle_tick_command(&app).await,
        Commands::Run { interval } => handle_run_command(&app, *interval).await,
        Commands::Subscriber { command } => handle_subscriber_command(&app, command),
        Commands::Status { subscriber, day } => handle_status_command(&app, subscriber, *day),
        Commands::Prune => handle_prune_command(&app),
    }
}

fn handle_schedule_command(app: &App, day: Option<NaiveDate>) -> Result<()> {
    let day = day.unwrap_or_else(|| Utc::now().date_naive());
    info!("Scheduling deliveries for {}", day);

    let subscribers = app.store.list_active()?;
    let scheduler = Scheduler::new(Arc::clone(&app.store));
    let report = scheduler.schedule_day(&subscribers, day)?;

    println!(
        "{} {} created, {} skipped of {} subscribers",
        format!("{day}:").cyan(),
        report.created.to_string().green(),
        report.skipped,
        report.total
    );
    Ok(())
}

async fn handle_tick_command(app: &App) -> Result<()> {
    let worker = app.worker()?;
    let report = worker.tick().await?;
    print_tick_report(&report);
    Ok(())
}

async fn handle_run_command(app: &App, interval_secs: u64) -> Result<()> {
    println!(
        "{} ticking every {interval_secs}s",
        "Running delivery loop,".cyan()
    );

    let scheduler = Scheduler::new(Arc::clone(&app.store));
    let worker = app.worker()?;
    let mut scheduled_day: Option<NaiveDate> = None;
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        // Schedule each UTC day once as it arrives
        let today = Utc::now().date_naive();
        if scheduled_day != Some(today) {
            let subscribers = app.store.list_active()?;
            let report = scheduler.schedule_day(&subscribers, today)?;
            info!(
                "Scheduled {}: {} created, {} skipped",
                today, report.created, report.skipped
            );
            scheduled_day = Some(today);
        }

        match worker.tick().await {
            Ok(report) => {
                if report.due > 0 {
                    print_tick_report(&report);
                }
            }
            Err(e) => {
                log::error!("Tick failed: {e}");
                eprintln!("{} {e}", "Tick failed:".red());
            }
        }
    }
}

fn handle_subscriber_command(app: &App, command: &SubscriberCommands) -> Result<()> {
    match command {
        SubscriberCommands::Add {
            id,
            phone,
            timezone,
            window_start,
            window_end,
        } => {
            let subscriber = Subscriber {
                id: id.clone(),
                phone: phone.clone(),
                timezone: timezone.clone(),
                window_start_hour: *window_start,
                window_end_hour: *window_end,
                active: true,
            };
            app.store.upsert_subscriber(&subscriber)?;
            println!("{} {id}", "Saved subscriber".green());
        }
        SubscriberCommands::List => {
            let subscribers = app.store.list_active()?;
            if subscribers.is_empty() {
                println!("{}", "No active subscribers".yellow());
            }
            for s in subscribers {
                println!(
                    "{}  {}  {}  {:02}:00-{:02}:00",
                    s.id.cyan(),
                    s.phone,
                    s.timezone,
                    s.window_start_hour,
                    s.window_end_hour
                );
            }
        }
        SubscriberCommands::Deactivate { id } => {
            let mut subscriber = app
                .store
                .get_subscriber(id)?
                .ok_or_else(|| eyre!("No subscriber with id {id}"))?;
            subscriber.active = false;
            app.store.upsert_subscriber(&subscriber)?;
            println!("{} {id}", "Deactivated".yellow());
        }
    }
    Ok(())
}

fn handle_status_command(app: &App, subscriber: &str, day: Option<NaiveDate>) -> Result<()> {
    let day = day.unwrap_or_else(|| Utc::now().date_naive());

    match app.store.status_for(subscriber, day)? {
        None => println!("{} no delivery for {subscriber} on {day}", "Status:".cyan()),
        Some(record) => {
            println!(
                "{} {} scheduled {} attempts {}",
                "Status:".cyan(),
                record.status.to_string().green(),
                record.scheduled_at,
                record.attempt_count
            );
            if let Some(err) = &record.last_error {
                println!("  last error: {}", err.red());
            }
            if let Some(sent_at) = record.sent_at {
                println!("  sent at: {sent_at}");
            }
        }
    }
    Ok(())
}

fn handle_prune_command(app: &App) -> Result<()> {
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(app.config.history.retention_days));
    let removed = app.history.prune(cutoff)?;
    println!(
        "{} {} history entries older than {}",
        "Pruned".green(),
        removed,
        cutoff.date_naive()
    );
    Ok(())
}

fn print_tick_report(report: &dripfeed::worker::TickReport) {
    println!(
        "{} due={} sent={} retrying={} failed={} throttled={} cancelled={} skipped={} errors={}",
        "Tick:".cyan(),
        report.due,
        report.sent.to_string().green(),
        report.retrying,
        report.failed.to_string().red(),
        report.throttled,
        report.cancelled,
        report.skipped,
        report.errors
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref())?;

    run_application(&cli, config).await
}
