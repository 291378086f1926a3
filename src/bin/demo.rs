//! Demo binary for tickwork.
//!
//! Registers three tasks (high/normal/low priority, 2s/3s/4s intervals),
//! runs the scheduler until the duration elapses or Ctrl-C is pressed,
//! then prints the run history.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tickwork::{ScheduledTask, Scheduler, SchedulerConfig, TaskPriority};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run the tickwork demo scheduler.
#[derive(Parser)]
#[command(name = "tickwork-demo", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds.
    #[arg(short, long, default_value_t = 20)]
    duration: u64,

    /// Also register a task whose action always fails.
    #[arg(long)]
    with_failing_task: bool,

    /// Print the run history as JSON on exit.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tickwork=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => SchedulerConfig::from_file(path)?,
        None => {
            let path = SchedulerConfig::default_config_path();
            if path.exists() {
                SchedulerConfig::from_file(&path)?
            } else {
                SchedulerConfig::default()
            }
        }
    };

    let scheduler = Scheduler::new().with_config(config);
    scheduler.add_task(demo_task("high", TaskPriority::High, 2, 500))?;
    scheduler.add_task(demo_task("normal", TaskPriority::Normal, 3, 300))?;
    scheduler.add_task(demo_task("low", TaskPriority::Low, 4, 200))?;
    if cli.with_failing_task {
        scheduler.add_task(ScheduledTask::new(
            "flaky",
            TaskPriority::Normal,
            Duration::from_secs(1),
            || async { Err(anyhow::anyhow!("simulated failure")) },
        ))?;
    }

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    info!(duration_secs = cli.duration, "press Ctrl-C to stop early");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let summary = handle.stop().await?;
    info!(
        passes = summary.passes,
        dispatched = summary.dispatched,
        in_flight = summary.in_flight_at_stop,
        "scheduler stopped by cancellation"
    );

    let history = scheduler.history();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        for task in scheduler.tasks() {
            println!(
                "{:<8} {:<7} runs={:<3} failures={}",
                task.name(),
                task.priority(),
                task.run_count(),
                task.failure_streak()
            );
        }
    }

    Ok(())
}

fn demo_task(name: &str, priority: TaskPriority, interval_secs: u64, work_ms: u64) -> ScheduledTask {
    let label = name.to_owned();
    ScheduledTask::new(
        name,
        priority,
        Duration::from_secs(interval_secs),
        move || {
            let label = label.clone();
            async move {
                info!(task = %label, at = %chrono::Local::now().format("%H:%M:%S"), "running");
                tokio::time::sleep(Duration::from_millis(work_ms)).await;
                Ok(())
            }
        },
    )
}
