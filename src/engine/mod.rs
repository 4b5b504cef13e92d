//! Execution-engine boundary
//!
//! The media runtime is an external collaborator: it accepts a description
//! string and reports errors and end-of-stream on a message bus. This module
//! defines that boundary as traits plus a factory, so the execution state
//! machine and the runner binary stay engine-agnostic. [`sim::SimEngine`]
//! is the deterministic implementation used by the runner binary and tests.

pub mod sim;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use thiserror::Error;

pub use sim::SimEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("state change error: {0}")]
    State(String),
}

/// Pipeline lifecycle states exposed at this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Playing,
}

/// Asynchronous notification posted by the engine while a pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Error { message: String, debug: String },
    Warning { message: String },
    Eos,
    StateChanged { old: PipelineState, new: PipelineState },
}

/// Collects engine diagnostics for the duration of one parse call.
///
/// Installed only around parsing; an error-severity diagnostic recorded here
/// fails the parse even when the engine still hands back a pipeline object.
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    error_seen: AtomicBool,
    messages: Mutex<Vec<String>>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.error_seen.store(true, Ordering::SeqCst);
        self.messages
            .lock()
            .expect("diagnostic lock poisoned")
            .push(message.into());
    }

    pub fn error_seen(&self) -> bool {
        self.error_seen.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .expect("diagnostic lock poisoned")
            .clone()
    }
}

/// An execution engine that can turn a description into a runnable pipeline.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Parse `description` into a pipeline. Error-severity diagnostics
    /// emitted during parsing are recorded on `diagnostics`; the caller
    /// decides whether a returned pipeline is still acceptable.
    fn parse(
        &self,
        description: &str,
        diagnostics: &DiagnosticCollector,
    ) -> Result<Box<dyn EnginePipeline>, EngineError>;
}

/// A parsed pipeline owned by the caller.
pub trait EnginePipeline: Send {
    fn play(&mut self) -> Result<(), EngineError>;

    /// Force the pipeline to the stopped state. Safe to call repeatedly.
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Block up to `timeout` for the next bus message.
    fn wait_message(&mut self, timeout: Duration) -> Option<BusMessage>;

    /// Drain one pending bus message without blocking.
    fn try_pop_message(&mut self) -> Option<BusMessage>;
}

/// Create an engine by name. Only the simulation engine is built in; real
/// runtimes register here.
pub fn create_engine(name: &str) -> Result<Box<dyn Engine>> {
    match name {
        "sim" => Ok(Box::new(SimEngine::new())),
        other => bail!("Unknown engine: {other}. Available: sim"),
    }
}
