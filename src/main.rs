//! SpeedWatch: keeps track of WebPageTest runs across invocations.
//!
//! `submit` queues tests and arms polling, `poll` (from cron) or `daemon`
//! (resident) advances outstanding tests, and completed results are
//! logged and checked against configured thresholds.
//!
//! State lives in one SQLite file under the data directory:
//! - Outstanding jobs in a fixed number of slots
//! - The active polling activation, keyed by owner
//! - An append-only result log plus cycle errors
//! - A lease so two cycles never overlap

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

mod alerts;
mod config;
mod cycle;
mod metrics;
mod scheduler;
mod service;
mod store;
mod submit;

#[cfg(test)]
mod testing;

use alerts::{AlertSink, EmailAlerts, LogAlerts};
use config::{Config, ConfigThresholds};
use cycle::{CycleOutcome, PollCycleRunner};
use metrics::METRIC_SCHEMA;
use scheduler::{ActivationId, IntervalTrigger, LedgerTrigger, PollGate, PollScheduler, Trigger};
use service::webpagetest::WebPageTestClient;
use service::TestService;
use store::{CycleLease, Store};
use submit::{JobSubmitter, SubmitReport};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $SPEEDWATCH_CONFIG, then ~/.speedwatch/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit tests for the given URLs, or for the configured targets
    Submit { urls: Vec<String> },
    /// Run one poll cycle if polling is active and due
    Poll {
        /// Run the cycle even if the activation is not due yet
        #[arg(long)]
        force: bool,
    },
    /// Stay resident and poll on an interval
    Daemon,
    /// Show outstanding jobs, polling state and recent results
    Status,
}

/// Everything a command needs, built from the loaded config.
struct App {
    config: Config,
    config_path: PathBuf,
    store: Arc<Store>,
    service: Arc<dyn TestService>,
}

impl App {
    fn load(config_path: PathBuf) -> Result<Self> {
        let config = Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

        let db_path = config.db_path();
        let store = Store::open(&db_path, config.max_outstanding_jobs)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        let service = WebPageTestClient::new(&config.service)?;
        if config.service.api_key.is_none() {
            debug!("No WebPageTest API key configured (set WPT_API_KEY)");
        }

        Ok(Self {
            config,
            config_path,
            store: Arc::new(store),
            service: Arc::new(service),
        })
    }

    fn scheduler(&self, trigger: Arc<dyn Trigger>) -> Arc<PollScheduler> {
        Arc::new(PollScheduler::new(
            Arc::clone(&self.store),
            trigger,
            self.config.owner.clone(),
            self.config.poll_interval(),
        ))
    }

    fn submitter(&self, scheduler: Arc<PollScheduler>) -> JobSubmitter {
        JobSubmitter::new(Arc::clone(&self.store), Arc::clone(&self.service), scheduler)
    }

    fn alerts(&self) -> Arc<dyn AlertSink> {
        match &self.config.alerts.smtp {
            Some(smtp) => Arc::new(EmailAlerts::new(smtp.clone(), self.config.alerts.recipients.clone())),
            None => {
                if !self.config.alerts.recipients.is_empty() {
                    warn!("Alert recipients configured without smtp settings — alerts go to the log only");
                }
                Arc::new(LogAlerts)
            }
        }
    }

    fn runner(&self, scheduler: Arc<PollScheduler>) -> PollCycleRunner {
        PollCycleRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.service),
            scheduler,
            self.store.clone(),
            self.alerts(),
            Arc::new(ConfigThresholds::new(&self.config_path)),
        )
        .with_policy(self.config.failure_policy)
        .with_lease_ttl(self.config.lease_ttl())
    }

    /// Explicit URLs win over the configured target list.
    fn targets(&self, urls: Vec<String>) -> Vec<String> {
        if urls.is_empty() {
            self.config.targets.clone()
        } else {
            urls
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let app = App::load(config_path)?;

    match cli.command {
        Command::Submit { urls } => submit(&app, urls).await,
        Command::Poll { force } => poll(&app, force).await,
        Command::Daemon => daemon(&app).await,
        Command::Status => status(&app),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "speedwatch=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ── Commands ────────────────────────────────────────────────────────

async fn submit(app: &App, urls: Vec<String>) -> Result<()> {
    let targets = app.targets(urls);
    if targets.is_empty() {
        anyhow::bail!("No URLs given and no targets configured");
    }

    let scheduler = app.scheduler(Arc::new(LedgerTrigger::new(Arc::clone(&app.store))));
    let report = app.submitter(scheduler).submit(&targets).await?;
    print_submit_report(&report);
    Ok(())
}

async fn poll(app: &App, force: bool) -> Result<()> {
    let ledger = Arc::new(LedgerTrigger::new(Arc::clone(&app.store)));
    let scheduler = app.scheduler(ledger.clone());

    if !force {
        match ledger.gate(&scheduler, Utc::now())? {
            PollGate::Run => {}
            PollGate::Idle => {
                debug!("Polling is not active — nothing to do");
                return Ok(());
            }
            PollGate::Rearm => {
                warn!("Jobs are outstanding but polling is off — re-arming");
                scheduler.ensure_active()?;
                return Ok(());
            }
            PollGate::NotDue { next_due } => {
                debug!(next_due = ?next_due, "Not due yet");
                return Ok(());
            }
            PollGate::Foreign(id) => {
                warn!(
                    activation = %id,
                    "Active polling belongs to a running daemon — use --force to poll anyway"
                );
                return Ok(());
            }
        }
    }

    let outcome = app.runner(scheduler).run_cycle().await?;
    print_cycle_outcome(&outcome);
    Ok(())
}

async fn daemon(app: &App) -> Result<()> {
    info!("⏱️  SpeedWatch v{} daemon starting", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let (trigger, mut ticks) = IntervalTrigger::new();
    let trigger = Arc::new(trigger);
    let scheduler = app.scheduler(trigger.clone());
    let runner = app.runner(Arc::clone(&scheduler));
    let submitter = app.submitter(Arc::clone(&scheduler));

    // Ids persisted by earlier processes are unknown to this trigger.
    scheduler.take_over(&LedgerTrigger::new(Arc::clone(&app.store)))?;

    let mut resubmit = app
        .config
        .submit_interval_hours
        .map(|hours| time::interval(Duration::from_secs(hours * 3600)));
    if resubmit.is_some() && app.config.targets.is_empty() {
        warn!("submit_interval_hours is set but no targets are configured");
    }

    info!(
        every_secs = app.config.poll_interval_secs,
        capacity = app.store.capacity(),
        "🚀 Daemon ready"
    );

    loop {
        tokio::select! {
            Some(id) = ticks.recv() => {
                if !scheduler.is_current(&id)? {
                    debug!(activation = %id, "Ignoring tick from a retired activation");
                    continue;
                }
                // Failures are already logged and recorded by the runner.
                if let Ok(outcome) = runner.run_cycle().await {
                    if let CycleOutcome::Ran(report) = &outcome {
                        debug!(completed = report.completed, pending = report.pending, "Tick handled");
                    }
                }
            }
            _ = next_tick(&mut resubmit) => {
                if app.config.targets.is_empty() {
                    continue;
                }
                info!(targets = app.config.targets.len(), "📡 Scheduled submission");
                if let Err(e) = submitter.submit(&app.config.targets).await {
                    error!("Scheduled submission failed: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(activations = trigger.active_count(), "Shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn next_tick(interval: &mut Option<time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn status(app: &App) -> Result<()> {
    let jobs = app.store.jobs().list_all()?;
    println!("Outstanding jobs: {}/{}", jobs.len(), app.store.capacity());
    for job in &jobs {
        println!("  {}  {}", job.key, job.handle);
    }

    let ledger = LedgerTrigger::new(Arc::clone(&app.store));
    match app.store.scheduler_state().activation(&app.config.owner)? {
        Some(id) => {
            let id = ActivationId::from(id);
            match ledger.next_due(&id)? {
                Some(due) => println!("Polling: active ({}), next due {}", id, due.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Polling: active ({}), driven by daemon", id),
            }
        }
        None => println!("Polling: off"),
    }
    if let Some(holder) = CycleLease::holder(&app.store)? {
        println!("Cycle running: {}", holder);
    }

    let records = app.store.results().recent(None, 10)?;
    if !records.is_empty() {
        println!("\nRecent results:");
        for record in &records {
            let values: Vec<String> = METRIC_SCHEMA
                .iter()
                .zip(record.metrics.iter())
                .map(|(field, value)| format!("{}={}", field.key, value))
                .collect();
            println!(
                "  {}  {}  {}",
                record.completed_at.format("%Y-%m-%d %H:%M"),
                record.target,
                values.join(" ")
            );
        }
    }

    let errors = app.store.results().recent_errors(5)?;
    if !errors.is_empty() {
        println!("\nRecent errors:");
        for entry in &errors {
            println!(
                "  {}  {}  {}",
                entry.occurred_at.format("%Y-%m-%d %H:%M"),
                entry.target.as_deref().unwrap_or("-"),
                entry.message
            );
        }
    }
    Ok(())
}

fn print_submit_report(report: &SubmitReport) {
    for job in &report.submitted {
        println!("submitted  {}  {}", job.key, job.handle);
    }
    for rejection in &report.rejected {
        println!("rejected   {}  ({})", rejection.target, rejection.reason);
    }
}

fn print_cycle_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped => println!("Another poll cycle is running; skipped"),
        CycleOutcome::Ran(report) => {
            println!(
                "completed {}, pending {}, alerts {}{}",
                report.completed,
                report.pending,
                report.alerts,
                if report.deactivated { ", polling stopped" } else { "" }
            );
            for key in &report.failed {
                println!("failed     {}", key);
            }
        }
    }
}
