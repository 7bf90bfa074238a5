use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use browser_pilot::brain::{OpenAiClient, OpenAiExecutor, OpenAiPlanner};
use browser_pilot::{
    AgentConfig, ChromeBrowser, HistoryStore, RunLayout, RunStatus, StepScheduler, Task,
};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Drive a browser through a multi-step task with an executor and a planner model.
#[derive(Parser, Debug)]
#[command(name = "agent", version, about)]
struct Cli {
    /// Task to accomplish
    #[arg(long, conflicts_with = "task_file")]
    task: Option<String>,

    /// Read the task from a file
    #[arg(long)]
    task_file: Option<PathBuf>,

    /// Operating guidelines handed to both models
    #[arg(long)]
    guidelines_file: Option<PathBuf>,

    /// Text appended to the executor's system prompt
    #[arg(long)]
    system_extension_file: Option<PathBuf>,

    /// Text appended to the planner's system prompt
    #[arg(long)]
    planner_extension_file: Option<PathBuf>,

    /// Do not send screenshots to the models
    #[arg(long)]
    no_vision: bool,

    /// Resume from a history_step_<n>.json or latest_history.json file
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long)]
    max_steps: Option<u32>,

    /// Consult the planner every N steps (0 disables it)
    #[arg(long)]
    planner_interval: Option<u32>,

    /// Remote debugging endpoint of a running Chrome. Start it with
    /// --disable-web-security --disable-site-isolation-trials so that
    /// cross-origin frames can be read.
    #[arg(long)]
    cdp_url: Option<String>,

    /// Directory that receives run_YYYYMMDD_HHMMSS folders
    #[arg(long, default_value = "runs")]
    output_dir: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) -> Result<()> {
    let level: tracing::Level = level.parse().context("Invalid log level")?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {what} from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    // 1. Configuration: defaults, then AGENT_* variables, then flags
    let mut config = AgentConfig::from_env();
    if let Some(max_steps) = cli.max_steps {
        config.max_steps = max_steps;
    }
    if let Some(interval) = cli.planner_interval {
        config.planner_interval = interval;
    }
    if let Some(cdp_url) = cli.cdp_url.clone() {
        config.cdp_url = cdp_url;
    }
    if cli.no_vision {
        config.use_vision = false;
    }

    // 2. Task and run root, from the resumed history or from the flags
    let resume = match &cli.resume {
        Some(path) => Some(
            HistoryStore::load(path).with_context(|| format!("loading history {}", path.display()))?,
        ),
        None => None,
    };
    let mut task = match (&resume, &cli.task, &cli.task_file) {
        (_, Some(goal), _) => Task::new(goal.clone(), String::new()),
        (_, None, Some(path)) => Task::new(read_text(path, "task")?.trim(), String::new()),
        (Some(dump), None, None) => dump.task.clone(),
        (None, None, None) => bail!("either --task, --task-file or --resume is required"),
    };
    if let Some(path) = &cli.guidelines_file {
        task.guidelines = read_text(path, "guidelines")?;
    }
    if let Some(path) = &cli.system_extension_file {
        task.extend_system_message = Some(read_text(path, "system prompt extension")?);
    }
    if let Some(path) = &cli.planner_extension_file {
        task.extend_planner_system_message = Some(read_text(path, "planner prompt extension")?);
    }
    let layout = match &cli.resume {
        Some(path) => RunLayout::of_history_file(path),
        None => RunLayout::fresh(&cli.output_dir),
    };
    info!(root = %layout.root.display(), resume = cli.resume.is_some(), "starting run");

    // 3. Collaborators
    let executor = OpenAiExecutor::new(OpenAiClient::from_env(&config, &config.executor_model)?);
    let planner = OpenAiPlanner::new(OpenAiClient::from_env(&config, &config.planner_model)?);
    let history = HistoryStore::create(layout, &task)?;
    let browser = ChromeBrowser::connect(&config)
        .await
        .context("connecting to Chrome")?;

    let mut scheduler = StepScheduler::new(
        config,
        browser,
        Arc::new(executor),
        Arc::new(planner),
        history,
    );

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            cancel.cancel();
        }
    });

    // 4. Run and report
    let result = scheduler.run(&task, resume).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match result.status {
        RunStatus::Done if result.success => Ok(()),
        RunStatus::Cancelled => Ok(()),
        status => {
            if let Some(path) = &result.history_path {
                info!(history = %path.display(), "resume with --resume");
            }
            bail!("run ended {status:?}: {}", result.message)
        }
    }
}
