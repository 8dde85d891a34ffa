//! Syncwright CLI
//!
//! Run the background service or manage configurations, jobs, conflicts
//! and the queue from the command line.

use std::collections::BTreeMap;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use syncwright::error::{Result, SyncwrightError};
use syncwright::queue::{enqueue_webhook_event, QueueJobStatus, WebhookEvent};
use syncwright::storage::{query_audit_log, AuditAction, AuditFilter};
use syncwright::sync::config::{
    create_configuration, deactivate_configuration, delete_configuration, get_configuration,
    list_configurations, set_conflict_rule,
};
use syncwright::sync::conflict::{list_conflicts, ConflictFilter};
use syncwright::sync::job::{cancel_job, get_job, list_jobs, JobFilter};
use syncwright::sync::{
    ConflictRule, CreateConfigurationInput, JobPriority, JobStatus, JobType, ResolutionAction,
    SyncDirection, SyncFrequency,
};
use syncwright::types::EntityType;
use syncwright::{AppContext, SyncwrightConfig};

#[derive(Parser)]
#[command(name = "syncwright")]
#[command(about = "Bidirectional commerce data sync")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "SYNCWRIGHT_CONFIG")]
    config: Option<String>,

    /// Database path (overrides the config file)
    #[arg(long, env = "SYNCWRIGHT_DB_PATH")]
    db_path: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "SYNCWRIGHT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, queue workers and retention sweeper
    Serve {
        /// Number of queue workers (overrides the config file)
        #[arg(long, env = "SYNCWRIGHT_WORKERS")]
        workers: Option<usize>,
        /// Do not run the periodic scheduler
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Manage sync configurations
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Start a sync job for a configuration
    Trigger {
        config_id: String,
        #[arg(short = 't', long, default_value = "incremental")]
        job_type: JobType,
        #[arg(short, long, default_value = "normal")]
        priority: JobPriority,
        /// Execute the job in this process instead of leaving it to the workers
        #[arg(long)]
        now: bool,
    },
    /// Show one job with its errors and conflicts
    Job { id: String },
    /// List jobs, newest first
    Jobs {
        #[arg(long)]
        config_id: Option<String>,
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a queued or running job
    Cancel { id: String },
    /// List conflicts
    Conflicts {
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        config_id: Option<String>,
        /// Only conflicts awaiting a decision
        #[arg(long)]
        open: bool,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Resolve a conflict by hand
    Resolve {
        conflict_id: String,
        /// source_wins or destination_wins
        action: ResolutionAction,
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Queue an inbound webhook event
    Webhook {
        adapter_id: String,
        /// Vendor event name, e.g. products/update
        event: String,
        #[arg(short = 't', long)]
        entity_type: Option<EntityType>,
        /// Raw event payload (JSON)
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Database, queue and adapter overview
    Status,
    /// Work queue maintenance
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Query the audit log
    Audit {
        #[arg(long)]
        job_id: Option<String>,
        #[arg(long)]
        config_id: Option<String>,
        #[arg(long)]
        action: Option<AuditAction>,
        #[arg(short, long, default_value = "100")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Create a configuration
    Add {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        adapter: String,
        /// Comma-separated entity types
        #[arg(long, value_delimiter = ',', required = true)]
        entities: Vec<EntityType>,
        #[arg(long, default_value = "import")]
        direction: SyncDirection,
        #[arg(long, default_value = "hourly")]
        frequency: SyncFrequency,
        /// Let timestamps order changes without recording conflicts
        #[arg(long)]
        no_auto_resolve: bool,
        /// Field rule as field=rule, repeatable
        #[arg(long = "rule", value_parser = parse_rule)]
        rules: Vec<(String, ConflictRule)>,
    },
    /// List configurations
    List {
        /// Include inactive configurations
        #[arg(long)]
        all: bool,
    },
    /// Show one configuration
    Show { id: String },
    /// Delete a configuration; queued jobs are cancelled
    Remove { id: String },
    /// Set or clear a field conflict rule and apply it to open conflicts
    SetRule {
        id: String,
        field: String,
        /// source_wins, destination_wins, manual_review or clear
        rule: String,
    },
    /// Stop scheduling a configuration
    Deactivate { id: String },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Job counts per status
    Stats,
    /// List queue jobs
    List {
        #[arg(long)]
        status: Option<QueueJobStatus>,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Delete finished jobs past the retention horizon
    Sweep,
    /// Cancel a pending or retrying job
    Cancel {
        id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Run a failed job again right away
    Retry { id: String },
}

fn parse_rule(raw: &str) -> std::result::Result<(String, ConflictRule), String> {
    let (field, rule) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected field=rule, got {}", raw))?;
    Ok((field.trim().to_string(), rule.trim().parse()?))
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("syncwright=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<SyncwrightConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncwrightConfig::from_toml_file(shellexpand::tilde(path).to_string())?,
        None => SyncwrightConfig::default(),
    };
    if let Some(db_path) = &cli.db_path {
        config.storage.db_path = db_path.clone();
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_config(&cli)?;
    if let Commands::Serve {
        workers,
        no_scheduler,
    } = &cli.command
    {
        if let Some(workers) = workers {
            config.queue.workers = *workers;
        }
        if *no_scheduler {
            config.scheduler.enabled = false;
        }
        config.validate()?;
    }

    let ctx = AppContext::open(config)?;
    let storage = ctx.storage.clone();

    match cli.command {
        Commands::Serve { .. } => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                    let _ = tx.send(true);
                }
            });
            ctx.serve(rx).await?;
        }

        Commands::Config(command) => run_config(&ctx, command)?,

        Commands::Trigger {
            config_id,
            job_type,
            priority,
            now,
        } => {
            let job_id = ctx.scheduler.trigger_sync(&config_id, job_type, priority)?;
            if now {
                let result = ctx.engine.execute_job(&job_id).await?;
                print_json(&result)?;
            } else {
                println!("Queued sync job {}", job_id);
            }
        }

        Commands::Job { id } => {
            let job = storage.with_connection(|conn| get_job(conn, &id))?;
            print_json(&job)?;
        }

        Commands::Jobs {
            config_id,
            status,
            limit,
        } => {
            let filter = JobFilter {
                configuration_id: config_id,
                status,
                limit: Some(limit),
            };
            let jobs = storage.with_connection(|conn| list_jobs(conn, &filter))?;
            for job in jobs {
                println!(
                    "{} [{}] {} {} {}% ok={} err={} conflicts={}",
                    job.id,
                    job.status.as_str(),
                    job.job_type.as_str(),
                    job.configuration_id,
                    job.counters.progress_percentage(),
                    job.counters.success_count,
                    job.counters.error_count,
                    job.counters.conflict_count
                );
            }
        }

        Commands::Cancel { id } => {
            let outcome = storage.with_transaction(|conn| cancel_job(conn, &id))?;
            print_json(&outcome)?;
        }

        Commands::Conflicts {
            job_id,
            config_id,
            open,
            limit,
        } => {
            let filter = ConflictFilter {
                job_id,
                configuration_id: config_id,
                open_only: open,
                limit: Some(limit),
            };
            let conflicts = storage.with_connection(|conn| list_conflicts(conn, &filter))?;
            print_json(&conflicts)?;
        }

        Commands::Resolve {
            conflict_id,
            action,
            by,
        } => {
            let conflict = ctx.engine.resolver().resolve(&conflict_id, action, &by)?;
            print_json(&conflict)?;
        }

        Commands::Webhook {
            adapter_id,
            event,
            entity_type,
            payload,
        } => {
            let event = WebhookEvent {
                adapter_id,
                entity_type,
                event,
                payload: serde_json::from_str(&payload)?,
                received_at: chrono::Utc::now(),
            };
            let id = enqueue_webhook_event(&ctx.queue, &event)?;
            println!("Queued webhook event {}", id);
        }

        Commands::Status => {
            print_json(&serde_json::json!({
                "version": syncwright::VERSION,
                "storage": storage.status()?,
                "queue": ctx.queue.stats()?,
                "adapters": ctx.adapters.ids(),
                "handlers": ctx.queue.handlers().job_types(),
            }))?;
        }

        Commands::Queue(QueueCommand::Stats) => print_json(&ctx.queue.stats()?)?,

        Commands::Queue(QueueCommand::List { status, limit }) => {
            for job in ctx.queue.list(status, limit)? {
                println!(
                    "{} [{}] {} priority={} retries={}/{} scheduled_for={}",
                    job.id,
                    job.status.as_str(),
                    job.job_type,
                    job.priority,
                    job.retry_count,
                    job.max_retries,
                    job.scheduled_for.to_rfc3339()
                );
            }
        }

        Commands::Queue(QueueCommand::Sweep) => {
            let removed = ctx.queue.sweep_retention()?;
            println!("Removed {} finished queue jobs", removed);
        }

        Commands::Queue(QueueCommand::Cancel { id, reason }) => {
            if !ctx.cancel_queue_job(&id, &reason)? {
                return Err(SyncwrightError::Conflict(format!(
                    "queue job {} is not pending or waiting for a retry",
                    id
                )));
            }
            print_json(&ctx.queue.get(&id)?)?;
        }

        Commands::Queue(QueueCommand::Retry { id }) => {
            if !ctx.queue.retry_now(&id)? {
                return Err(SyncwrightError::Conflict(format!("queue job {} has not failed", id)));
            }
            print_json(&ctx.queue.get(&id)?)?;
        }

        Commands::Audit {
            job_id,
            config_id,
            action,
            limit,
        } => {
            let filter = AuditFilter {
                configuration_id: config_id,
                job_id,
                action,
                since: None,
                limit: Some(limit),
            };
            let entries = storage.with_connection(|conn| query_audit_log(conn, &filter))?;
            print_json(&entries)?;
        }
    }

    Ok(())
}

fn run_config(ctx: &AppContext, command: ConfigCommand) -> Result<()> {
    let storage = &ctx.storage;
    match command {
        ConfigCommand::Add {
            owner,
            adapter,
            entities,
            direction,
            frequency,
            no_auto_resolve,
            rules,
        } => {
            if !ctx.adapters.contains(&adapter) {
                tracing::warn!(adapter_id = %adapter, "Adapter is not registered in this config file");
            }
            let input = CreateConfigurationInput {
                owner_id: owner,
                adapter_id: adapter,
                direction,
                frequency,
                entities,
                auto_resolve_conflicts: !no_auto_resolve,
                conflict_rules: rules.into_iter().collect::<BTreeMap<_, _>>(),
            };
            let config = storage.with_transaction(|conn| create_configuration(conn, &input))?;
            print_json(&config)?;
        }

        ConfigCommand::List { all } => {
            let configs = storage.with_connection(|conn| list_configurations(conn, !all))?;
            for config in configs {
                println!(
                    "{} [{}] {} {} {} last_sync_at={}",
                    config.id,
                    if config.is_active { "active" } else { "inactive" },
                    config.adapter_id,
                    config.direction.as_str(),
                    config.frequency.as_str(),
                    config
                        .last_sync_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }

        ConfigCommand::Show { id } => {
            let config = storage.with_connection(|conn| get_configuration(conn, &id))?;
            print_json(&config)?;
            if let Some(next) = config.next_due_at() {
                println!("Next due at {}", next.to_rfc3339());
            }
        }

        ConfigCommand::Remove { id } => {
            storage.with_transaction(|conn| delete_configuration(conn, &id))?;
            println!("Deleted configuration {}", id);
        }

        ConfigCommand::SetRule { id, field, rule } => {
            let rule = match rule.as_str() {
                "clear" | "none" => None,
                other => Some(other.parse::<ConflictRule>().map_err(SyncwrightError::InvalidInput)?),
            };
            let config =
                storage.with_transaction(|conn| set_conflict_rule(conn, &id, &field, rule))?;
            let resolved = ctx.engine.resolver().reapply_rules(&config)?;
            print_json(&config)?;
            println!("Resolved {} open conflicts", resolved);
        }

        ConfigCommand::Deactivate { id } => {
            let config = storage.with_transaction(|conn| deactivate_configuration(conn, &id))?;
            print_json(&config)?;
        }
    }
    Ok(())
}
