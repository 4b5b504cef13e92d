//! Subprocess orchestration for pipeline runs
//!
//! Spawns the `pipeline-runner` binary and supervises it under competing
//! timeouts. Validation mode waits for completion below a hard kill deadline
//! and classifies the run from the exit code plus prefixed stderr lines.
//! Normal mode polls combined output for throughput-counter lines, publishes
//! live samples to a shared fps file, watches for output inactivity, and
//! honors cooperative cancellation.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

use crate::error::RunnerError;
use crate::exec::{RunMode, ERROR_LINE_PREFIX};

/// Shared file consumers watch for the most recent per-stream throughput.
pub const DEFAULT_FPS_FILE_PATH: &str = "/tmp/pipelens/fps.txt";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Margin added to max-runtime for the validation kill deadline.
const HARD_TIMEOUT_MARGIN_SECS: f64 = 60.0;

/// Grace period between SIGTERM and SIGKILL for hung subprocesses.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

static OVERALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"FpsCounter\(overall ([\d.]+)sec\): total=([\d.]+) fps, number-streams=(\d+), per-stream=([\d.]+) fps",
    )
    .expect("overall pattern is valid")
});

static AVERAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"FpsCounter\(average ([\d.]+)sec\): total=([\d.]+) fps, number-streams=(\d+), per-stream=([\d.]+) fps",
    )
    .expect("average pattern is valid")
});

static LAST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"FpsCounter\(last ([\d.]+)sec\): total=([\d.]+) fps, number-streams=(\d+), per-stream=([\d.]+) fps",
    )
    .expect("last pattern is valid")
});

/// Throughput metrics extracted from one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunMetrics {
    pub total_fps: f64,
    pub per_stream_fps: f64,
    pub num_streams: u32,
}

impl RunMetrics {
    fn zero() -> Self {
        Self {
            total_fps: 0.0,
            per_stream_fps: 0.0,
            num_streams: 0,
        }
    }
}

/// Result of a validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct FpsSample {
    total_fps: f64,
    num_streams: u32,
    per_stream_fps: f64,
}

fn parse_sample(re: &Regex, line: &str) -> Option<FpsSample> {
    let caps = re.captures(line)?;
    Some(FpsSample {
        total_fps: caps[2].parse().ok()?,
        num_streams: caps[3].parse().ok()?,
        per_stream_fps: caps[4].parse().ok()?,
    })
}

/// Filter the runner's stderr down to its prefixed diagnostic lines.
///
/// Lines are recognized strictly by [`ERROR_LINE_PREFIX`]; unprefixed or
/// differently-prefixed lines are ignored.
fn parse_error_lines(raw_stderr: &str) -> Vec<String> {
    raw_stderr
        .lines()
        .filter_map(|line| line.strip_prefix(ERROR_LINE_PREFIX))
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs pipeline descriptions through the `pipeline-runner` subprocess.
pub struct PipelineRunner {
    mode: RunMode,
    max_runtime: f64,
    poll_interval: Duration,
    fps_file_path: PathBuf,
    inactivity_timeout: Duration,
    hard_timeout: Duration,
    runner_binary: PathBuf,
    cancelled: Arc<AtomicBool>,
}

impl PipelineRunner {
    /// Create a runner for normal (production) execution. A max-runtime of
    /// zero runs until end-of-stream.
    pub fn normal(max_runtime: f64) -> Self {
        Self::new(RunMode::Normal, max_runtime)
    }

    /// Create a runner for validation. Requires `max_runtime > 0`; the hard
    /// kill deadline defaults to max-runtime plus 60 seconds.
    pub fn validation(max_runtime: f64) -> Result<Self, RunnerError> {
        if max_runtime <= 0.0 {
            return Err(RunnerError::InvalidMaxRuntime { value: max_runtime });
        }
        Ok(Self::new(RunMode::Validation, max_runtime))
    }

    fn new(mode: RunMode, max_runtime: f64) -> Self {
        Self {
            mode,
            max_runtime,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fps_file_path: PathBuf::from(DEFAULT_FPS_FILE_PATH),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            hard_timeout: Duration::from_secs_f64(max_runtime + HARD_TIMEOUT_MARGIN_SECS),
            runner_binary: default_runner_binary(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_fps_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fps_file_path = path.into();
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Override the validation kill deadline.
    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = timeout;
        self
    }

    /// Point at a specific `pipeline-runner` binary.
    pub fn with_runner_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.runner_binary = path.into();
        self
    }

    pub fn hard_timeout(&self) -> Duration {
        self.hard_timeout
    }

    /// Request cancellation of the current run. Cooperative: the poll loop
    /// observes the flag once per interval, terminates the subprocess and
    /// reports no error for that termination. Has no effect in validation
    /// mode, where runs are bounded by the hard timeout.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run `description` in validation mode.
    ///
    /// The subprocess gets the configured max-runtime; this side enforces the
    /// hard kill deadline. On expiry the partial diagnostic output is still
    /// parsed and a synthetic timeout error is appended. The run is valid iff
    /// the exit code is zero and no prefixed error lines were captured.
    pub async fn validate(&self, description: &str) -> Result<ValidationOutcome, RunnerError> {
        if self.mode != RunMode::Validation {
            return Err(RunnerError::InvalidMode {
                mode: self.mode.to_string(),
            });
        }

        let binary = self.runner_binary.clone();
        let max_runtime = self.max_runtime;
        let hard_timeout = self.hard_timeout;
        let description = description.to_string();
        debug!(?binary, max_runtime, ?hard_timeout, "starting validation subprocess");

        let (exit_code, _stdout, stderr, timed_out) =
            tokio::task::spawn_blocking(move || -> Result<_, RunnerError> {
                let mut child = std::process::Command::new(&binary)
                    .args(["--mode", "validation", "--max-runtime"])
                    .arg(max_runtime.to_string())
                    .arg(&description)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(RunnerError::Spawn)?;

                // Drain both pipes on their own threads so a chatty pipeline
                // cannot fill a pipe buffer and stall the child while we wait.
                let stdout_pipe = child.stdout.take();
                let stderr_pipe = child.stderr.take();
                let stdout_reader = std::thread::spawn(move || read_lossy(stdout_pipe));
                let stderr_reader = std::thread::spawn(move || read_lossy(stderr_pipe));

                let (code, timed_out) = match child.wait_timeout(hard_timeout)? {
                    Some(status) => (status.code(), false),
                    None => {
                        warn!(
                            hard_timeout_secs = hard_timeout.as_secs_f64(),
                            "pipeline runner exceeded hard timeout, killing process"
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                        (None, true)
                    }
                };

                let stdout = stdout_reader.join().unwrap_or_default();
                let stderr = stderr_reader.join().unwrap_or_default();
                Ok((code, stdout, stderr, timed_out))
            })
            .await
            .map_err(|e| RunnerError::Internal(format!("validation task panicked: {e}")))??;

        debug!(?exit_code, timed_out, "pipeline runner finished");

        let mut errors = parse_error_lines(&stderr);
        if timed_out {
            errors.push(
                "Pipeline validation timed out: the runner did not finish within the allowed \
                 time and had to be terminated."
                    .to_string(),
            );
        }

        let is_valid = !timed_out && exit_code == Some(0) && errors.is_empty();
        Ok(ValidationOutcome { is_valid, errors })
    }

    /// Run `description` in normal mode and extract throughput metrics.
    ///
    /// On every exit path the fps file is finally reset to zero to signal
    /// "not running".
    pub async fn run(
        &self,
        description: &str,
        total_streams: u32,
    ) -> Result<RunMetrics, RunnerError> {
        if self.mode != RunMode::Normal {
            return Err(RunnerError::InvalidMode {
                mode: self.mode.to_string(),
            });
        }

        let result = self.run_inner(description, total_streams).await;
        self.write_fps(0.0);
        result
    }

    async fn run_inner(
        &self,
        description: &str,
        total_streams: u32,
    ) -> Result<RunMetrics, RunnerError> {
        info!(
            runner = ?self.runner_binary,
            max_runtime = self.max_runtime,
            "starting pipeline subprocess"
        );

        let mut child = tokio::process::Command::new(&self.runner_binary)
            .args(["--mode", "normal", "--max-runtime"])
            .arg(self.max_runtime.to_string())
            .arg(description)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(RunnerError::Spawn)?;

        #[derive(Clone, Copy, PartialEq)]
        enum Channel {
            Stdout,
            Stderr,
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(Channel, String)>();

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send((Channel::Stdout, line)).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send((Channel::Stderr, line)).is_err() {
                        break;
                    }
                }
            });
        }
        // Reader tasks hold the only remaining senders; the channel closes
        // when both pipes hit EOF.
        drop(tx);

        let mut stdout_lines: Vec<String> = Vec::new();
        let mut stderr_lines: Vec<String> = Vec::new();
        let mut last_activity = Instant::now();

        loop {
            if self.is_cancelled() {
                info!("process cancelled, terminating");
                terminate(&mut child);
                break;
            }

            match tokio::time::timeout(self.poll_interval, rx.recv()).await {
                Ok(Some((channel, line))) => {
                    last_activity = Instant::now();
                    match channel {
                        Channel::Stdout => {
                            self.publish_average_sample(&line, total_streams);
                            stdout_lines.push(line);
                        }
                        Channel::Stderr => stderr_lines.push(line),
                    }
                }
                // Both pipes closed; the process is exiting.
                Ok(None) => break,
                Err(_) => {
                    if !self.is_cancelled() && last_activity.elapsed() > self.inactivity_timeout {
                        error!(
                            inactivity_secs = self.inactivity_timeout.as_secs(),
                            "no new logs on stdout/stderr; terminating pipeline as potentially hung"
                        );
                        terminate_with_grace(&mut child).await;
                        return Err(RunnerError::InactivityTimeout {
                            seconds: self.inactivity_timeout.as_secs(),
                        });
                    }
                }
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code();

        let metrics = extract_metrics(&stdout_lines, total_streams);

        if exit_code != Some(0) {
            let stderr_joined = stderr_lines.join("\n");
            error!(?exit_code, "pipeline failed");
            debug!(stdout = %stdout_lines.join("\n"), stderr = %stderr_joined, "subprocess output");
            // Cancellation is not an error condition.
            if !self.is_cancelled() {
                return Err(RunnerError::ExecutionFailed {
                    stderr: stderr_joined.trim().to_string(),
                });
            }
        }

        info!(
            total_fps = metrics.total_fps,
            per_stream_fps = metrics.per_stream_fps,
            num_streams = metrics.num_streams,
            "pipeline run finished"
        );
        Ok(metrics)
    }

    /// Publish a live "average" sample matching the configured stream count;
    /// the most recent value always overwrites.
    fn publish_average_sample(&self, line: &str, total_streams: u32) {
        let Some(sample) = parse_sample(&AVERAGE_RE, line) else {
            return;
        };
        info!(
            total_fps = sample.total_fps,
            num_streams = sample.num_streams,
            per_stream_fps = sample.per_stream_fps,
            "average fps sample"
        );
        if sample.num_streams != total_streams {
            return;
        }
        self.write_fps(sample.per_stream_fps);
    }

    fn write_fps(&self, fps: f64) {
        if let Some(parent) = self.fps_file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&self.fps_file_path, format!("{fps:?}\n")) {
            warn!(path = ?self.fps_file_path, %err, "failed to write fps file");
        }
    }
}

/// Pick the reported metrics from the captured stdout.
///
/// An "overall" sample for the requested stream count wins outright; absent
/// that, the closest "average" sample by stream-count distance; absent that,
/// the most recent "last" sample; absent everything, zero.
fn extract_metrics(stdout_lines: &[String], total_streams: u32) -> RunMetrics {
    let mut averages: HashMap<u32, FpsSample> = HashMap::new();
    let mut most_recent_last: Option<FpsSample> = None;

    for line in stdout_lines {
        if let Some(sample) = parse_sample(&OVERALL_RE, line) {
            if sample.num_streams == total_streams {
                return RunMetrics {
                    total_fps: sample.total_fps,
                    per_stream_fps: sample.per_stream_fps,
                    num_streams: sample.num_streams,
                };
            }
        }
        if let Some(sample) = parse_sample(&AVERAGE_RE, line) {
            averages.insert(sample.num_streams, sample);
        }
        if let Some(sample) = parse_sample(&LAST_RE, line) {
            most_recent_last = Some(sample);
        }
    }

    let average = averages.get(&total_streams).copied().or_else(|| {
        let mut counts: Vec<u32> = averages.keys().copied().collect();
        counts.sort_unstable();
        counts
            .into_iter()
            .min_by_key(|count| count.abs_diff(total_streams))
            .and_then(|count| averages.get(&count).copied())
    });

    let chosen = average.or(most_recent_last);
    match chosen {
        Some(sample) => RunMetrics {
            total_fps: sample.total_fps,
            per_stream_fps: sample.per_stream_fps,
            num_streams: sample.num_streams,
        },
        None => RunMetrics::zero(),
    }
}

fn read_lossy<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Locate the runner binary next to the current executable, falling back to
/// PATH lookup.
fn default_runner_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("pipeline-runner")))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("pipeline-runner"))
}

/// Request termination without waiting (SIGTERM on unix).
fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        return;
    }
    let _ = child.start_kill();
}

/// Terminate with a grace period, then force-kill.
async fn terminate_with_grace(child: &mut tokio::process::Child) {
    terminate(child);
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("process did not terminate gracefully after inactivity; killing it");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(kind: &str, total: f64, streams: u32, per_stream: f64) -> String {
        format!(
            "FpsCounter({kind} 1.00sec): total={total:.2} fps, \
             number-streams={streams}, per-stream={per_stream:.2} fps"
        )
    }

    #[test]
    fn error_lines_require_exact_prefix() {
        let stderr = format!(
            "{}no element \"foo\"\nsome noise\nother - ERROR - ignored\n{}   \n",
            ERROR_LINE_PREFIX, ERROR_LINE_PREFIX
        );
        let errors = parse_error_lines(&stderr);
        assert_eq!(errors, vec!["no element \"foo\""]);
    }

    #[test]
    fn overall_match_for_requested_streams_wins() {
        let lines = vec![
            line("average", 100.0, 2, 50.0),
            line("overall", 120.0, 2, 60.0),
            line("last", 90.0, 2, 45.0),
        ];
        let metrics = extract_metrics(&lines, 2);
        assert_eq!(metrics.total_fps, 120.0);
        assert_eq!(metrics.per_stream_fps, 60.0);
        assert_eq!(metrics.num_streams, 2);
    }

    #[test]
    fn overall_for_other_stream_count_is_ignored() {
        let lines = vec![line("overall", 120.0, 4, 30.0), line("average", 100.0, 2, 50.0)];
        let metrics = extract_metrics(&lines, 2);
        assert_eq!(metrics.total_fps, 100.0);
    }

    #[test]
    fn closest_average_is_used_when_no_exact_match() {
        let lines = vec![line("average", 100.0, 1, 100.0), line("average", 160.0, 4, 40.0)];
        let metrics = extract_metrics(&lines, 2);
        // Stream count 1 is closer to 2 than 4 is.
        assert_eq!(metrics.num_streams, 1);
        assert_eq!(metrics.total_fps, 100.0);
    }

    #[test]
    fn latest_average_per_stream_count_overwrites_earlier() {
        let lines = vec![line("average", 100.0, 2, 50.0), line("average", 110.0, 2, 55.0)];
        let metrics = extract_metrics(&lines, 2);
        assert_eq!(metrics.total_fps, 110.0);
    }

    #[test]
    fn last_sample_is_the_final_fallback() {
        let lines = vec![line("last", 80.0, 3, 26.7), line("last", 85.0, 3, 28.3)];
        let metrics = extract_metrics(&lines, 1);
        assert_eq!(metrics.total_fps, 85.0);
    }

    #[test]
    fn no_samples_yield_zero() {
        let metrics = extract_metrics(&["plain log line".to_string()], 1);
        assert_eq!(metrics, RunMetrics::zero());
    }

    #[test]
    fn validation_hard_timeout_defaults_to_max_runtime_plus_margin() {
        let runner = PipelineRunner::validation(5.0).unwrap();
        assert_eq!(runner.hard_timeout(), Duration::from_secs(65));

        let runner = PipelineRunner::validation(5.0)
            .unwrap()
            .with_hard_timeout(Duration::from_secs(7));
        assert_eq!(runner.hard_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn validation_requires_positive_max_runtime() {
        assert!(matches!(
            PipelineRunner::validation(0.0),
            Err(RunnerError::InvalidMaxRuntime { .. })
        ));
    }

    #[tokio::test]
    async fn mode_mismatch_is_rejected() {
        let normal = PipelineRunner::normal(1.0);
        assert!(matches!(
            normal.validate("fakesrc ! fakesink").await,
            Err(RunnerError::InvalidMode { .. })
        ));

        let validation = PipelineRunner::validation(1.0).unwrap();
        assert!(matches!(
            validation.run("fakesrc ! fakesink", 1).await,
            Err(RunnerError::InvalidMode { .. })
        ));
    }
}
