//! Pipelens CLI - pipeline/graph conversions and supervised runs

use std::fs;
use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;

use pipelens::graph::Graph;
use pipelens::orchestrator::PipelineRunner;
use pipelens::resources::{Resources, StaticMediaLibrary, StaticModelCatalog};
use pipelens::view::{apply_simple_view_changes, to_simple_view, ViewConfig};
use pipelens::{Describer, Parser};

#[derive(ClapParser)]
#[command(name = "pipelens")]
#[command(about = "Pipeline graph editing and execution backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a pipeline description into graph JSON
    Parse {
        /// Pipeline description; positional arguments are joined with spaces
        #[arg(required = true)]
        description: Vec<String>,
    },

    /// Convert a graph JSON file back into a pipeline description
    Describe {
        /// Path to a graph JSON file, or '-' for stdin
        file: String,
    },

    /// Derive the simplified view of a graph JSON file
    SimpleView {
        /// Path to a graph JSON file, or '-' for stdin
        file: String,
    },

    /// Merge simple-view edits back onto the advanced graph
    Merge {
        /// Edited simple-view graph JSON
        modified: String,
        /// Pre-edit simple-view graph JSON
        original: String,
        /// Full advanced graph JSON
        advanced: String,
    },

    /// Run a pipeline description and report throughput metrics
    Run {
        /// Maximum runtime in seconds (0 runs until end-of-stream)
        #[arg(long, default_value_t = 0.0)]
        max_runtime: f64,

        /// Expected number of streams for metric extraction
        #[arg(long, default_value_t = 1)]
        streams: u32,

        #[arg(required = true)]
        description: Vec<String>,
    },

    /// Validate a pipeline description with a bounded run
    Validate {
        /// Maximum runtime in seconds (must be >= 1)
        #[arg(long, default_value_t = 10.0)]
        max_runtime: f64,

        #[arg(required = true)]
        description: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run_command(cli.command).await {
        eprintln!("{} {err:#}", "Error:".red().bold());
        std::process::exit(1);
    }
}

/// CLI resource lookups: directory configuration comes from the environment;
/// model and video inventories are empty unless a deployment wires them in.
fn cli_resources() -> Resources {
    Resources::from_env(
        Arc::new(StaticModelCatalog::new()),
        Arc::new(StaticMediaLibrary::new()),
    )
}

fn read_graph(file: &str) -> Result<Graph> {
    let json = if file == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read graph from stdin")?;
        buf
    } else {
        fs::read_to_string(file).with_context(|| format!("Failed to read graph file {file}"))?
    };
    serde_json::from_str(&json).with_context(|| format!("Failed to parse graph JSON from {file}"))
}

async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Parse { description } => {
            let resources = cli_resources();
            let graph = Parser::new(&resources).parse(&description.join(" "))?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }

        Commands::Describe { file } => {
            let resources = cli_resources();
            let graph = read_graph(&file)?;
            println!("{}", Describer::new(&resources).describe(&graph)?);
        }

        Commands::SimpleView { file } => {
            let graph = read_graph(&file)?;
            let simple = to_simple_view(&graph, &ViewConfig::from_env());
            println!("{}", serde_json::to_string_pretty(&simple)?);
        }

        Commands::Merge {
            modified,
            original,
            advanced,
        } => {
            let merged = apply_simple_view_changes(
                &read_graph(&modified)?,
                &read_graph(&original)?,
                &read_graph(&advanced)?,
            )?;
            println!("{}", serde_json::to_string_pretty(&merged)?);
        }

        Commands::Run {
            max_runtime,
            streams,
            description,
        } => {
            let runner = PipelineRunner::normal(max_runtime);
            let metrics = runner.run(&description.join(" "), streams).await?;
            println!(
                "total: {:.2} fps, streams: {}, per-stream: {:.2} fps",
                metrics.total_fps, metrics.num_streams, metrics.per_stream_fps
            );
        }

        Commands::Validate {
            max_runtime,
            description,
        } => {
            let runner = PipelineRunner::validation(max_runtime)?;
            let outcome = runner.validate(&description.join(" ")).await?;
            if outcome.is_valid {
                println!("{}", "Pipeline is valid".green());
            } else {
                println!("{}", "Pipeline is invalid".red());
                for error in &outcome.errors {
                    println!("  - {error}");
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
