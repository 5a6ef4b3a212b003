use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use screencrawl::agents::AgentSettings;
use screencrawl::agents::classifier::AgentClassifier;
use screencrawl::agents::navigator::AgentNavigator;
use screencrawl::agents::planner::AgentPlanBuilder;
use screencrawl::core::classifier::KeywordClassifier;
use screencrawl::error::CrawlResult;
use screencrawl::exit_codes;
use screencrawl::explore::DeviceExplorer;
use screencrawl::explore::navigator::HeuristicNavigator;
use screencrawl::io::app_map::{AppMap, AppMapDevice};
use screencrawl::io::config::{CrawlConfig, load_config};
use screencrawl::io::executor::CommandExecutor;
use screencrawl::io::init::{CrawlPaths, InitOptions, init_workspace};
use screencrawl::io::session_store::SessionStore;
use screencrawl::logging;
use screencrawl::planner::{OutlinePlanBuilder, PlanBuilder};
use screencrawl::sessions::{Collaborators, SessionRegistry, StatusSummary};

#[derive(Parser)]
#[command(
    name = "screencrawl",
    version,
    about = "Goal-directed screen exploration for mobile apps"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.screencrawl/` with default config and a description outline.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Build the coverage plan and print it as JSON.
    Plan {
        app_id: String,
        #[command(flatten)]
        source: PlanSource,
    },
    /// Run one exploration session against an app map and print its status.
    Run {
        app_id: String,
        /// JSON app map standing in for the device.
        #[arg(long)]
        app_map: PathBuf,
        #[command(flatten)]
        source: PlanSource,
        /// Override `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Print the persisted status of a session.
    Status { session_id: String },
}

#[derive(clap::Args)]
struct PlanSource {
    /// App description; defaults to `.screencrawl/description.md`.
    #[arg(long)]
    description: Option<PathBuf>,
    /// Use the configured agent command instead of the offline builders.
    #[arg(long)]
    agent: bool,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => {
            let paths = init_workspace(&root, InitOptions { force })?;
            println!("{}", paths.crawl_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Plan { app_id, source } => cmd_plan(&root, &app_id, &source),
        Command::Run {
            app_id,
            app_map,
            source,
            max_iterations,
        } => cmd_run(&root, &app_id, &app_map, &source, max_iterations),
        Command::Status { session_id } => cmd_status(&root, &session_id),
    }
}

fn cmd_plan(root: &Path, app_id: &str, source: &PlanSource) -> Result<i32> {
    let paths = CrawlPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let description = read_description(&paths, source)?;
    let plan = if source.agent {
        agent_planner(&paths, &config).build(app_id, &description)?
    } else {
        OutlinePlanBuilder.build(app_id, &description)?
    };
    println!("{}", serde_json::to_string_pretty(&plan).context("serialize plan")?);
    Ok(exit_codes::OK)
}

fn cmd_run(
    root: &Path,
    app_id: &str,
    app_map: &Path,
    source: &PlanSource,
    max_iterations: Option<u32>,
) -> Result<i32> {
    let paths = CrawlPaths::new(root);
    let mut config = load_config(&paths.config_path)?;
    if let Some(max_iterations) = max_iterations {
        config.max_iterations = max_iterations;
        config.validate()?;
    }
    let description = read_description(&paths, source)?;
    let map = AppMap::load(app_map)?;
    let store = SessionStore::new(config.artifacts_root(root));

    let use_agent = source.agent;
    let factory = |_app_id: &str| -> CrawlResult<Collaborators> {
        let device = AppMapDevice::new(map.clone());
        Ok(if use_agent {
            let settings = AgentSettings::from_config(&paths.root, &paths.state_dir, &config);
            Collaborators {
                planner: Box::new(agent_planner(&paths, &config)),
                explorer: Box::new(DeviceExplorer::new(
                    device,
                    AgentNavigator::new(executor(&config), settings.clone()),
                    config.turn_budget,
                )),
                classifier: Box::new(AgentClassifier::new(executor(&config), settings)),
            }
        } else {
            Collaborators {
                planner: Box::new(OutlinePlanBuilder),
                explorer: Box::new(DeviceExplorer::new(
                    device,
                    HeuristicNavigator::new(),
                    config.turn_budget,
                )),
                classifier: Box::new(KeywordClassifier),
            }
        })
    };

    let registry = SessionRegistry::new(factory, store, config.policy());
    let session_id = registry.start_session(app_id, &description, config.budget())?;
    eprintln!("session {session_id}");
    let outcome = registry.wait(&session_id)?;
    let status = registry.get_status(&session_id)?;
    print_status(&status)?;
    if let Some(path) = &outcome.record_path {
        eprintln!("record {}", path.display());
    }
    Ok(exit_codes::for_status(outcome.status))
}

fn cmd_status(root: &Path, session_id: &str) -> Result<i32> {
    let paths = CrawlPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let store = SessionStore::new(config.artifacts_root(root));
    let Some(record) = store.load_session(session_id)? else {
        bail!("session not found: {session_id}");
    };
    let status = StatusSummary::from_record(&record);
    print_status(&status)?;
    Ok(exit_codes::for_status(status.status))
}

fn read_description(paths: &CrawlPaths, source: &PlanSource) -> Result<String> {
    let path = source
        .description
        .clone()
        .unwrap_or_else(|| paths.description_path.clone());
    fs::read_to_string(&path).with_context(|| format!("read description {}", path.display()))
}

fn executor(config: &CrawlConfig) -> CommandExecutor {
    CommandExecutor::new(config.agent.command.clone())
}

fn agent_planner(paths: &CrawlPaths, config: &CrawlConfig) -> AgentPlanBuilder<CommandExecutor> {
    AgentPlanBuilder::new(
        executor(config),
        AgentSettings::from_config(&paths.root, &paths.state_dir, config),
    )
}

fn print_status(status: &StatusSummary) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(status).context("serialize status")?
    );
    Ok(())
}
