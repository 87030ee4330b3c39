//! reqpacer - Rate-limited task scheduler
//!
//! CLI entry point for the demo workload and config inspection.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use reqpacer::cli::{Cli, Command, OutputFormat, get_log_path};
use reqpacer::config::{Config, DemoConfig};
use reqpacer::demo::{self, QueryOutcome, SimulatedService};
use reqpacer::scheduler::{Scheduler, SchedulerConfig, TaskError};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Create log directory
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration; a broken file fails here before anything runs
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    match Config::locate(cli.config.as_ref()) {
        Some(path) => info!("Loaded config from: {}", path.display()),
        None => info!("No config file found, using defaults"),
    }
    info!(
        "reqpacer loaded config: max-task={}, period-ms={}",
        config.scheduler.max_task, config.scheduler.period_ms
    );

    // Dispatch command
    match cli.command {
        Some(Command::Demo {
            requests,
            workers,
            max_task,
            period_ms,
            query_ms,
        }) => {
            let scheduler_config = SchedulerConfig {
                max_task: max_task.unwrap_or(config.scheduler.max_task),
                period_ms: period_ms.unwrap_or(config.scheduler.period_ms),
            };
            let demo_config = DemoConfig {
                requests: requests.unwrap_or(config.demo.requests),
                workers: workers.unwrap_or(config.demo.workers),
                query_ms: query_ms.unwrap_or(config.demo.query_ms),
            };
            cmd_demo(scheduler_config, demo_config).await
        }
        Some(Command::ShowConfig { format }) => cmd_show_config(&config, format),
        None => {
            // Default: print help
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Run the demo workload and print each result as it completes
async fn cmd_demo(scheduler_config: SchedulerConfig, demo_config: DemoConfig) -> Result<()> {
    debug!(?scheduler_config, ?demo_config, "cmd_demo: called");
    let scheduler = Scheduler::new(scheduler_config.clone()).context("Invalid scheduler settings")?;
    let service = Arc::new(SimulatedService::new(demo_config.query_time()));

    println!(
        "Submitting {} queries from {} workers, at most {} every {}ms",
        demo_config.requests, demo_config.workers, scheduler_config.max_task, scheduler_config.period_ms
    );
    println!();

    let report = tokio::task::spawn_blocking(move || demo::run(&scheduler, service, &demo_config, print_outcome))
        .await
        .context("Demo thread failed")??;

    println!();
    println!("Demo Summary");
    println!("------------");
    println!("Succeeded: {}", report.succeeded.to_string().green());
    if report.failed > 0 {
        println!("Failed:    {}", report.failed.to_string().red());
    } else {
        println!("Failed:    {}", report.failed);
    }
    println!("Elapsed:   {:.2}s", report.elapsed.as_secs_f64());
    if let Some(rate) = report.observed_rate {
        println!("Rate:      {:.3} req/s", rate);
    }
    println!();
    println!("Ticks:            {}", report.stats.ticks);
    println!("Dispatched:       {}", report.stats.total_dispatched);
    println!("Peak batch:       {}", report.stats.peak_batch);
    println!("Peak queue depth: {}", report.stats.peak_queue_depth);
    if let Some(avg) = report.stats.avg_wait_ms() {
        println!("Avg queue wait:   {}ms", avg);
    }

    Ok(())
}

fn print_outcome(index: usize, outcome: &QueryOutcome) {
    match outcome {
        Ok(rate) => println!("{:>4} {} {:.3} req/s", index, "✓".green(), rate),
        Err(TaskError::Failed(err)) => println!("{:>4} {} {}", index, "✗".red(), err),
        Err(err) => println!("{:>4} {} {}", index, "✗".red(), err.to_string().red()),
    }
}

/// Print the effective configuration
fn cmd_show_config(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_show_config: called");
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(config)?),
    }
    Ok(())
}
