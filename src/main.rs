mod console;

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate_core::config::AppConfig;
use tollgate_core::error::TollgateError;
use tollgate_core::event::EventBus;
use tollgate_engine::{ApprovalBroker, GraphEngine, SessionManager};
use tollgate_pipeline::{initial_state, FlyerOutcome, FlyerPipeline, JsonFileSink, PipelineOptions};

#[derive(Parser)]
#[command(name = "tollgate", version, about = "Workflow engine with human approval gates")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tollgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the flyer pipeline once, answering approvals in the terminal
    Run {
        /// Event description (read from stdin if omitted)
        #[arg(trailing_var_arg = true)]
        description: Vec<String>,
    },
    /// Start the WebSocket/HTTP approval gateway
    Serve,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tollgate=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "tollgate", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run { description } => {
            let mut text = description.join(" ");
            if text.trim().is_empty() {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            let text = text.trim();
            if text.is_empty() {
                anyhow::bail!("an event description is required");
            }
            run_once(&config, text).await?;
        }
        Commands::Serve => {
            let event_bus = Arc::new(EventBus::default());
            let broker = Arc::new(ApprovalBroker::new(event_bus.clone()));
            let engine = build_engine(&config, event_bus.clone(), broker.clone())?;
            let gateway_config = config.gateway.clone().unwrap_or_default();
            info!(bind = %gateway_config.bind, "Starting approval gateway");

            let server = tollgate_gateway::GatewayServer::new(
                gateway_config,
                Arc::new(engine),
                event_bus,
                Arc::new(SessionManager::new()),
                broker,
            );
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    match AppConfig::load(path) {
        Ok(config) => Ok(config),
        Err(TollgateError::ConfigNotFound(p)) => {
            warn!(path = %p, "Config file not found, using defaults");
            Ok(AppConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn build_engine(
    config: &AppConfig,
    event_bus: Arc<EventBus>,
    broker: Arc<ApprovalBroker>,
) -> anyhow::Result<GraphEngine> {
    let generator = tollgate_llm::create_generator(&config.model);
    let engine = FlyerPipeline::new(generator, broker)
        .options(PipelineOptions::from_config(config))
        .sink(Arc::new(JsonFileSink::new(config.output_dir())))
        .event_bus(event_bus)
        .build()?;
    Ok(engine)
}

async fn run_once(config: &AppConfig, description: &str) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::default());
    let broker = Arc::new(ApprovalBroker::new(event_bus.clone()));
    let engine = build_engine(config, event_bus, broker.clone())?;

    let listener = console::spawn_listener(broker).await;
    let result = engine.run(initial_state(description)).await;
    listener.abort();

    match result {
        Ok(result) => {
            eprintln!(
                "\n[done: {} steps in {}ms]",
                result.steps_executed, result.total_elapsed_ms
            );
            match FlyerOutcome::from_state(&result.state) {
                FlyerOutcome::Composed { flyer, location } => {
                    println!("{}", serde_json::to_string_pretty(&flyer)?);
                    if let Some(location) = location {
                        eprintln!("[saved: {}]", location);
                    }
                }
                FlyerOutcome::Abandoned { decisions } => {
                    eprintln!("[no flyer composed]");
                    for (artifact, decision) in decisions {
                        eprintln!("  {}: {}", artifact, decision);
                    }
                }
            }
            Ok(())
        }
        Err(failure) => {
            error!(step_id = %failure.step_id, error = %failure.error, "Flyer run failed");
            Err(failure.into())
        }
    }
}
