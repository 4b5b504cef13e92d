//! Deterministic simulation engine
//!
//! Interprets a pipeline description just far enough to reproduce the
//! observable behavior of a real media runtime: parse diagnostics for unknown
//! elements, end-of-stream after a bounded buffer count, runtime errors, and
//! throughput-counter lines on stdout. Timing is compressed: a frame takes
//! milliseconds, not a frame interval of real video.
//!
//! Simulation-only elements:
//! - `errsrc`        - posts a runtime error on the bus (after `error-after`
//!                     frames, default 5)
//! - `stallsrc`      - produces no output and never reaches end-of-stream
//! - `errparse`      - parses "successfully" but emits an error-severity
//!                     parse diagnostic, like a failed caps negotiation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{BusMessage, DiagnosticCollector, Engine, EngineError, EnginePipeline, PipelineState};

/// Elements the simulation accepts. Everything else is a parse error.
const KNOWN_ELEMENTS: &[&str] = &[
    "filesrc",
    "multifilesrc",
    "videotestsrc",
    "fakesrc",
    "urisourcebin",
    "errsrc",
    "stallsrc",
    "errparse",
    "decodebin",
    "videoconvert",
    "videoscale",
    "capsfilter",
    "queue",
    "tee",
    "gvadetect",
    "gvaclassify",
    "gvainference",
    "gvawatermark",
    "gvafpscounter",
    "gvapython",
    "fakesink",
    "filesink",
    "autovideosink",
];

const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(5);

/// Frames between throughput reports when a counter element is present.
const FPS_REPORT_EVERY: u64 = 20;

#[derive(Debug, Clone, Default)]
struct SimBehavior {
    /// Frames until end-of-stream; `None` runs forever.
    num_buffers: Option<u64>,
    /// Frames until a runtime error is posted.
    error_after: Option<u64>,
    /// Produce no output and never finish.
    stall: bool,
    /// Emit FpsCounter lines on stdout.
    fps_counter: bool,
    num_streams: u32,
}

/// Simulation engine.
pub struct SimEngine {
    frame_interval: Duration,
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }

    /// Override the per-frame tick, mainly to slow the simulation down in
    /// orchestrator timeout tests.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    fn analyze(
        &self,
        description: &str,
        diagnostics: &DiagnosticCollector,
    ) -> Result<SimBehavior, EngineError> {
        let mut behavior = SimBehavior::default();

        for raw_segment in description.split('!') {
            let segment = raw_segment.trim();
            if segment.is_empty() {
                continue;
            }
            // Caps constraints are accepted as-is.
            if segment.contains(',') {
                continue;
            }

            let mut words = segment.split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };
            // A lone branch endpoint reference ("t.") links, nothing to run.
            if first.ends_with('.') && segment.split_whitespace().count() == 1 {
                continue;
            }

            let name = first;
            if !KNOWN_ELEMENTS.contains(&name) {
                let message = format!("no element \"{name}\"");
                diagnostics.record_error(message.clone());
                return Err(EngineError::Parse(message));
            }

            let mut props: Vec<(&str, &str)> = Vec::new();
            for word in words {
                if word.ends_with('.') {
                    continue;
                }
                if let Some((k, v)) = word.split_once('=') {
                    props.push((k, v));
                }
            }

            let is_source = name.ends_with("src") || name == "urisourcebin";
            if is_source {
                behavior.num_streams += 1;
            }

            match name {
                "errsrc" => {
                    let after = props
                        .iter()
                        .find(|(k, _)| *k == "error-after")
                        .and_then(|(_, v)| v.parse().ok())
                        .unwrap_or(5);
                    behavior.error_after = Some(after);
                }
                "stallsrc" => behavior.stall = true,
                "errparse" => {
                    diagnostics.record_error(format!(
                        "could not negotiate format for element \"{name}\""
                    ));
                }
                "gvafpscounter" => behavior.fps_counter = true,
                _ => {}
            }

            if is_source {
                if let Some(buffers) = props
                    .iter()
                    .find(|(k, _)| *k == "num-buffers")
                    .and_then(|(_, v)| v.parse::<i64>().ok())
                {
                    if buffers >= 0 {
                        let buffers = buffers as u64;
                        behavior.num_buffers = Some(
                            behavior
                                .num_buffers
                                .map_or(buffers, |existing| existing.min(buffers)),
                        );
                    }
                }
            }
        }

        if behavior.num_streams == 0 {
            behavior.num_streams = 1;
        }
        Ok(behavior)
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for SimEngine {
    fn name(&self) -> &str {
        "sim"
    }

    fn parse(
        &self,
        description: &str,
        diagnostics: &DiagnosticCollector,
    ) -> Result<Box<dyn EnginePipeline>, EngineError> {
        debug!(%description, "sim engine parsing description");
        let behavior = self.analyze(description, diagnostics)?;
        Ok(Box::new(SimPipeline::new(behavior, self.frame_interval)))
    }
}

struct SimPipeline {
    behavior: SimBehavior,
    frame_interval: Duration,
    bus_tx: Sender<BusMessage>,
    bus_rx: Receiver<BusMessage>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    state: PipelineState,
}

impl SimPipeline {
    fn new(behavior: SimBehavior, frame_interval: Duration) -> Self {
        let (bus_tx, bus_rx) = std::sync::mpsc::channel();
        Self {
            behavior,
            frame_interval,
            bus_tx,
            bus_rx,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
            state: PipelineState::Stopped,
        }
    }
}

impl EnginePipeline for SimPipeline {
    fn play(&mut self) -> Result<(), EngineError> {
        if self.state == PipelineState::Playing {
            return Ok(());
        }
        self.state = PipelineState::Playing;

        let _ = self.bus_tx.send(BusMessage::StateChanged {
            old: PipelineState::Stopped,
            new: PipelineState::Playing,
        });

        let behavior = self.behavior.clone();
        let tick = self.frame_interval;
        let bus = self.bus_tx.clone();
        let stop = Arc::clone(&self.stop_flag);

        self.worker = Some(std::thread::spawn(move || {
            run_simulation(behavior, tick, bus, stop)
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| EngineError::State("simulation worker panicked".to_string()))?;
        }
        if self.state != PipelineState::Stopped {
            self.state = PipelineState::Stopped;
            let _ = self.bus_tx.send(BusMessage::StateChanged {
                old: PipelineState::Playing,
                new: PipelineState::Stopped,
            });
        }
        Ok(())
    }

    fn wait_message(&mut self, timeout: Duration) -> Option<BusMessage> {
        self.bus_rx.recv_timeout(timeout).ok()
    }

    fn try_pop_message(&mut self) -> Option<BusMessage> {
        self.bus_rx.try_recv().ok()
    }
}

impl Drop for SimPipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_simulation(
    behavior: SimBehavior,
    tick: Duration,
    bus: Sender<BusMessage>,
    stop: Arc<AtomicBool>,
) {
    if behavior.stall {
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        return;
    }

    let started = Instant::now();
    let mut frames: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(tick);
        frames += 1;

        if let Some(after) = behavior.error_after {
            if frames >= after {
                let _ = bus.send(BusMessage::Error {
                    message: "Internal data stream error.".to_string(),
                    debug: format!("streaming stopped after {frames} buffers"),
                });
                return;
            }
        }

        if behavior.fps_counter && frames % FPS_REPORT_EVERY == 0 {
            print_fps_line("average", frames, started.elapsed(), behavior.num_streams);
        }

        if let Some(buffers) = behavior.num_buffers {
            if frames >= buffers {
                if behavior.fps_counter {
                    print_fps_line("overall", frames, started.elapsed(), behavior.num_streams);
                }
                let _ = bus.send(BusMessage::Eos);
                return;
            }
        }
    }
}

/// Throughput report in the fixed counter format the orchestrator parses.
fn print_fps_line(window: &str, frames: u64, elapsed: Duration, num_streams: u32) {
    let secs = elapsed.as_secs_f64().max(0.001);
    let per_stream = frames as f64 / secs;
    let total = per_stream * num_streams as f64;
    println!(
        "FpsCounter({window} {secs:.2}sec): total={total:.2} fps, \
         number-streams={num_streams}, per-stream={per_stream:.2} fps"
    );
}
