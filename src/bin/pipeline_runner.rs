//! Pipeline runner subprocess
//!
//! Parses and runs one pipeline description to completion. Designed to be
//! spawned by the orchestrator: informational logs go to stdout, error lines
//! go to stderr with a fixed prefix the orchestrator parses verbatim.
//!
//! Exit code 0 means the run succeeded (end-of-stream or a clean max-runtime
//! stop); 1 means parse failure, runtime error, or invalid arguments.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pipelens::engine::create_engine;
use pipelens::exec::{emit_error_line, run_pipeline, validate_arguments, RunMode};

#[derive(Parser)]
#[command(name = "pipeline-runner")]
#[command(about = "Run a media pipeline description for a configurable duration")]
#[command(version)]
struct Args {
    /// Execution mode: 'normal' runs for production use, 'validation' runs
    /// for a limited time to verify correctness.
    #[arg(long, default_value = "normal")]
    mode: String,

    /// Maximum runtime in seconds. > 0 stops the pipeline after this
    /// duration; 0 runs until end-of-stream.
    #[arg(long, default_value_t = 0.0, value_name = "SECONDS")]
    max_runtime: f64,

    /// Execution engine to use.
    #[arg(long, default_value = "sim")]
    engine: String,

    /// Minimum log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Pipeline description; all positional arguments are joined with spaces.
    #[arg(required = true)]
    pipeline: Vec<String>,
}

fn main() {
    let args = Args::parse();

    // Informational logs go to stdout; the error channel on stderr is
    // reserved for prefixed diagnostic lines.
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode: RunMode = match args.mode.parse() {
        Ok(mode) => mode,
        Err(err) => {
            emit_error_line(&err.to_string());
            std::process::exit(1);
        }
    };

    if let Err(err) = validate_arguments(mode, args.max_runtime) {
        emit_error_line(&err.to_string());
        std::process::exit(1);
    }

    let engine = match create_engine(&args.engine) {
        Ok(engine) => engine,
        Err(err) => {
            emit_error_line(&format!("Failed to initialize engine: {err}"));
            std::process::exit(1);
        }
    };

    let description = args.pipeline.join(" ");
    let success = run_pipeline(engine.as_ref(), &description, args.max_runtime, mode);

    std::process::exit(if success { 0 } else { 1 });
}
