//! neo4j-connect - connector CLI
//!
//! The runtime is embedded as a library by the broker client that owns
//! consumption and production; the CLI covers the operational surface
//! around it:
//!
//! ```bash
//! # Validate a configuration file
//! neo4j-connect -c connect.yaml validate
//!
//! # Check graph connectivity and handler construction
//! neo4j-connect -c connect.yaml check
//!
//! # Print the configuration JSON schema
//! neo4j-connect schema
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neo4j_connect::engine::GraphClient;
use neo4j_connect::metrics::PipelineMetrics;
use neo4j_connect::{ConnectConfig, Neo4jClient, TopicRegistry};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "neo4j-connect")]
#[command(version, about = "Bridge between broker topics and Neo4j")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "connect.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// Check graph connectivity and handler construction
    Check,
    /// Print the configuration JSON schema
    Schema,
}

fn init_tracing(verbose: bool, log_level: &str) {
    let default = if verbose { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("neo4j_connect={default},info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Schema) {
        let schema = schemars::schema_for!(ConnectConfig);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = ConnectConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(cli.verbose, &config.settings.log_level);

    match cli.command {
        Commands::Validate => {
            if let Some(sink) = &config.sink {
                let strategies = sink.strategies()?;
                for (topic, strategy) in &strategies {
                    info!(topic = %topic, strategy = strategy.id(), "assignment");
                }
                info!(topics = strategies.len(), "sink configuration is valid");
            }
            if config.source.is_some() {
                info!("source configuration is valid");
            }
            if config.sink.is_none() && config.source.is_none() {
                warn!("configuration declares neither a sink nor a source");
            }
            println!("configuration ok");
        }
        Commands::Check => {
            if let Some(sink) = &config.sink {
                let registry = TopicRegistry::from_config(sink, PipelineMetrics::shared())?;
                info!(topics = registry.len(), "handlers materialized");
            }
            let client = Neo4jClient::connect(&config.neo4j).await?;
            client
                .verify_connectivity()
                .await
                .map_err(|e| anyhow::anyhow!("graph connectivity check failed: {e}"))?;
            info!(uri = %config.neo4j.uri, "graph reachable");
            println!("check ok");
        }
        Commands::Schema => unreachable!(),
    }

    Ok(())
}
