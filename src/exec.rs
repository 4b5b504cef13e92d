//! Pipeline execution state machine
//!
//! Drives a single run end to end: parse with diagnostic interception, then
//! a bounded wait loop over the engine's message bus. The terminal condition
//! is whichever comes first of a bus error (run fails), end-of-stream (run
//! succeeds), or the max-runtime timer (run succeeds with reason
//! "max_runtime"). After the loop the pipeline is always forced to the
//! stopped state and late bus messages are drained; an error discovered only
//! during the drain still flips the outcome to failure.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{BusMessage, DiagnosticCollector, Engine, EnginePipeline};
use crate::error::RunnerError;

/// Fixed prefix on every error line the runner emits to stderr. The process
/// orchestrator recognizes diagnostic lines by this prefix verbatim;
/// differently-prefixed lines are ignored.
pub const ERROR_LINE_PREFIX: &str = "pipeline_runner - ERROR - ";

/// Bus poll granularity for the wait loop.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Execution mode of the runner subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Production runs; metrics are extracted by the orchestrator.
    Normal,
    /// Bounded runs that verify a description is runnable.
    Validation,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Normal => f.write_str("normal"),
            RunMode::Validation => f.write_str("validation"),
        }
    }
}

impl FromStr for RunMode {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(RunMode::Normal),
            "validation" => Ok(RunMode::Validation),
            other => Err(RunnerError::InvalidMode {
                mode: other.to_string(),
            }),
        }
    }
}

/// Why a run stopped, when it did not simply reach end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Error,
    MaxRuntime,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Error => f.write_str("error"),
            StopReason::MaxRuntime => f.write_str("max_runtime"),
        }
    }
}

/// Final classification of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub ok: bool,
    pub reason: Option<StopReason>,
}

/// Reject invalid mode/max-runtime combinations before anything starts.
///
/// A max-runtime of zero means "run until end-of-stream, no enforced cap",
/// which validation mode cannot accept.
pub fn validate_arguments(mode: RunMode, max_runtime: f64) -> Result<(), RunnerError> {
    if max_runtime < 0.0 {
        return Err(RunnerError::NegativeMaxRuntime { value: max_runtime });
    }
    if mode == RunMode::Validation && max_runtime == 0.0 {
        return Err(RunnerError::InvalidMaxRuntime { value: max_runtime });
    }
    Ok(())
}

/// Emit one error line on the runner's diagnostic channel.
///
/// Newlines are folded into spaces so the orchestrator's line parsing stays
/// simple.
pub fn emit_error_line(message: &str) {
    eprintln!("{ERROR_LINE_PREFIX}{}", single_line(message));
}

fn single_line(message: &str) -> String {
    message.replace(['\r', '\n'], " ")
}

/// Parse `description` with error interception.
///
/// The diagnostic collector is installed only for the duration of this call.
/// Parsing fails when the engine errors or when any error-severity diagnostic
/// was recorded; in the latter case a returned pipeline object is torn down
/// and discarded.
pub fn parse_pipeline(engine: &dyn Engine, description: &str) -> Option<Box<dyn EnginePipeline>> {
    debug!(%description, "parsing pipeline");
    let diagnostics = DiagnosticCollector::new();

    let parsed = engine.parse(description, &diagnostics);

    for message in diagnostics.messages() {
        emit_error_line(&message);
    }

    match parsed {
        Err(err) => {
            emit_error_line(&format!("Failed to parse pipeline: {err}"));
            None
        }
        Ok(mut pipeline) => {
            if diagnostics.error_seen() {
                emit_error_line(
                    "Pipeline description is invalid: engine reported errors during parsing.",
                );
                if let Err(err) = pipeline.stop() {
                    warn!(%err, "error while cleaning up invalid pipeline after parse");
                }
                return None;
            }
            info!("pipeline parsed successfully");
            Some(pipeline)
        }
    }
}

#[derive(Default)]
struct RunFlags {
    error_seen: AtomicBool,
    eos_seen: AtomicBool,
    max_runtime_triggered: AtomicBool,
}

/// Run an already-parsed pipeline for up to `max_runtime_secs` seconds.
///
/// With a positive max-runtime a dedicated timer thread arms the stop; zero
/// disables the cap entirely. Only one of error / end-of-stream / max-runtime
/// wins the run; the others are re-checked during the unconditional post-loop
/// drain so a late error is never missed.
pub fn run_pipeline_for_duration(
    pipeline: &mut dyn EnginePipeline,
    max_runtime_secs: f64,
) -> RunOutcome {
    let flags = Arc::new(RunFlags::default());

    if let Err(err) = pipeline.play() {
        emit_error_line(&format!("Failed to start pipeline: {err}"));
        return RunOutcome {
            ok: false,
            reason: Some(StopReason::Error),
        };
    }

    if max_runtime_secs > 0.0 {
        let timer_flags = Arc::clone(&flags);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs_f64(max_runtime_secs));
            if timer_flags.error_seen.load(Ordering::SeqCst)
                || timer_flags.eos_seen.load(Ordering::SeqCst)
            {
                return;
            }
            info!(max_runtime_secs, "max runtime elapsed; stopping pipeline");
            timer_flags
                .max_runtime_triggered
                .store(true, Ordering::SeqCst);
        });
    }

    loop {
        if flags.max_runtime_triggered.load(Ordering::SeqCst) {
            break;
        }
        match pipeline.wait_message(POLL_INTERVAL) {
            Some(BusMessage::Error { message, debug }) => {
                emit_error_line(&format!("Pipeline runtime error: {message} (debug: {debug})"));
                flags.error_seen.store(true, Ordering::SeqCst);
                break;
            }
            Some(BusMessage::Eos) => {
                info!("pipeline reached end-of-stream");
                flags.eos_seen.store(true, Ordering::SeqCst);
                break;
            }
            Some(BusMessage::Warning { message }) => {
                warn!(%message, "pipeline warning");
            }
            Some(BusMessage::StateChanged { old, new }) => {
                debug!(?old, ?new, "pipeline state changed");
            }
            None => continue,
        }
    }

    if let Err(err) = pipeline.stop() {
        warn!(%err, "error while stopping pipeline after run");
    }

    // Surface anything the bus still holds; a late error flips the outcome.
    while let Some(message) = pipeline.try_pop_message() {
        match message {
            BusMessage::Error { message, debug } => {
                emit_error_line(&format!("Pipeline error: {message} (debug: {debug})"));
                flags.error_seen.store(true, Ordering::SeqCst);
            }
            BusMessage::Eos => info!("pipeline reached end-of-stream"),
            BusMessage::Warning { message } => warn!(%message, "pipeline warning"),
            BusMessage::StateChanged { old, new } => {
                debug!(?old, ?new, "pipeline state changed")
            }
        }
    }

    if flags.error_seen.load(Ordering::SeqCst) {
        RunOutcome {
            ok: false,
            reason: Some(StopReason::Error),
        }
    } else if flags.max_runtime_triggered.load(Ordering::SeqCst) {
        RunOutcome {
            ok: true,
            reason: Some(StopReason::MaxRuntime),
        }
    } else {
        RunOutcome { ok: true, reason: None }
    }
}

/// Parse and run `description`, returning whether the run succeeded.
///
/// This is the whole job of the `pipeline-runner` subprocess: parse failures,
/// runtime errors and late shutdown errors all fail the run; end-of-stream or
/// a clean max-runtime stop succeed.
pub fn run_pipeline(
    engine: &dyn Engine,
    description: &str,
    max_runtime_secs: f64,
    mode: RunMode,
) -> bool {
    info!(%mode, max_runtime_secs, %description, "running pipeline");

    let Some(mut pipeline) = parse_pipeline(engine, description) else {
        emit_error_line("Pipeline run failed: pipeline parsing error.");
        return false;
    };

    let outcome = run_pipeline_for_duration(pipeline.as_mut(), max_runtime_secs);

    // Final cleanup; stop is idempotent.
    if let Err(err) = pipeline.stop() {
        warn!(%err, "error while cleaning up pipeline");
    }

    if !outcome.ok {
        let reason = outcome
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        emit_error_line(&format!(
            "Pipeline run failed: pipeline runtime error (reason: {reason})."
        ));
        return false;
    }

    match outcome.reason {
        Some(StopReason::MaxRuntime) => info!(
            "pipeline run succeeded: ran for the configured max-runtime and shut down cleanly"
        ),
        _ => info!("pipeline run succeeded: pipeline completed"),
    }
    true
}
