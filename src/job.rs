//! One analysis job: spawn, demultiplex output into progress events, enforce the
//! runtime watchdog, and hand the buffers to the resolver.
//!
//! A job owns its buffers exclusively. Both pipes are read from a single task via
//! `select!`, so there is exactly one writer and the resolver runs only after both
//! pipes hit EOF and the child has been reaped.

use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tracing::{info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::JobError;
use crate::launcher;
use crate::progress::{classify, EventClock, LineAssembler, ProgressEvent, Stream, STEP_SYSTEM};
use crate::request::AnalysisRequest;
use crate::resolver::{self, AnalysisResult, JobOutput};

const READ_CHUNK: usize = 8 * 1024;

/// Callback invoked once per progress event, in emission order.
pub type ProgressSink = Box<dyn FnMut(&ProgressEvent) + Send>;

/// Wall-clock bounds of a finished job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTiming {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Successful job: resolved result plus timing.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub result: AnalysisResult,
    pub timing: JobTiming,
}

/// Accumulated state of a running job.
pub struct Job {
    clock: EventClock,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_lines: LineAssembler,
    stderr_lines: LineAssembler,
    progress: Vec<ProgressEvent>,
    sink: Option<ProgressSink>,
}

impl Job {
    pub fn new(sink: Option<ProgressSink>) -> Self {
        Self {
            clock: EventClock::default(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_lines: LineAssembler::new(),
            stderr_lines: LineAssembler::new(),
            progress: Vec::new(),
            sink,
        }
    }

    fn emit(&mut self, step: String, message: String) {
        let ev = ProgressEvent {
            step,
            message,
            timestamp: self.clock.now(),
        };
        if let Some(sink) = self.sink.as_mut() {
            sink(&ev);
        }
        self.progress.push(ev);
    }

    /// Synthetic `system` event.
    pub fn notice(&mut self, message: impl Into<String>) {
        self.emit(STEP_SYSTEM.to_string(), message.into());
    }

    fn emit_line(&mut self, stream: Stream, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        trace!(target: "job", stream = stream.as_str(), %line, "output line");
        counter!("analysis_progress_events_total", "stream" => stream.as_str()).increment(1);
        let (step, message) = classify(stream, line);
        self.emit(step, message);
    }

    /// Buffer a raw chunk and emit an event per completed line.
    pub fn on_chunk(&mut self, stream: Stream, chunk: &[u8]) {
        let lines = match stream {
            Stream::Stdout => {
                self.stdout.extend_from_slice(chunk);
                self.stdout_lines.push(chunk)
            }
            Stream::Stderr => {
                self.stderr.extend_from_slice(chunk);
                self.stderr_lines.push(chunk)
            }
        };
        for line in lines {
            self.emit_line(stream, &line);
        }
    }

    /// End of one pipe: classify whatever partial line is left.
    pub fn on_eof(&mut self, stream: Stream) {
        let tail = match stream {
            Stream::Stdout => self.stdout_lines.finish(),
            Stream::Stderr => self.stderr_lines.finish(),
        };
        if let Some(line) = tail {
            self.emit_line(stream, &line);
        }
    }

    pub fn progress(&self) -> &[ProgressEvent] {
        &self.progress
    }

    pub fn into_output(self, exit_code: Option<i32>) -> JobOutput {
        JobOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            progress: self.progress,
        }
    }
}

/// Read both pipes until EOF, then reap the child.
async fn pump(job: &mut Job, child: &mut Child) -> Result<Option<i32>, JobError> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            r = stdout.read(&mut out_buf), if out_open => match r? {
                0 => {
                    out_open = false;
                    job.on_eof(Stream::Stdout);
                }
                n => job.on_chunk(Stream::Stdout, &out_buf[..n]),
            },
            r = stderr.read(&mut err_buf), if err_open => match r? {
                0 => {
                    err_open = false;
                    job.on_eof(Stream::Stderr);
                }
                n => job.on_chunk(Stream::Stderr, &err_buf[..n]),
            },
        }
    }

    let status = child.wait().await?;
    Ok(status.code())
}

/// Run an analysis to completion and resolve its result.
pub async fn run_analysis(cfg: &BridgeConfig, req: &AnalysisRequest) -> Result<CompletedJob, JobError> {
    run_analysis_with_progress(cfg, req, None).await
}

/// Like [`run_analysis`], invoking `sink` for every progress event as it happens.
pub async fn run_analysis_with_progress(
    cfg: &BridgeConfig,
    req: &AnalysisRequest,
    sink: Option<ProgressSink>,
) -> Result<CompletedJob, JobError> {
    let started_at = Utc::now();
    let clock = Instant::now();

    let outcome = execute(cfg, req, sink).await;

    let elapsed = clock.elapsed();
    histogram!("analysis_job_duration_ms").record(elapsed.as_millis() as f64);
    let label = match &outcome {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    counter!("analysis_jobs_finished_total", "outcome" => label).increment(1);

    let result = outcome?;
    info!(
        target: "job",
        ticker = %req.ticker,
        recommendation = %result.recommendation,
        events = result.progress_messages.len(),
        duration_ms = elapsed.as_millis() as u64,
        "analysis resolved"
    );
    Ok(CompletedJob {
        result,
        timing: JobTiming {
            started_at,
            completed_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
        },
    })
}

async fn execute(
    cfg: &BridgeConfig,
    req: &AnalysisRequest,
    sink: Option<ProgressSink>,
) -> Result<AnalysisResult, JobError> {
    let mut handle = launcher::launch(cfg, req)?;
    counter!("analysis_jobs_started_total").increment(1);

    let mut job = Job::new(sink);
    job.notice(format!(
        "Starting analysis for {} ({} horizon, {} risk profile)",
        req.ticker, req.horizon, req.risk_profile
    ));

    let exit_code = match tokio::time::timeout(cfg.max_runtime, pump(&mut job, &mut handle.child)).await {
        Ok(r) => r?,
        Err(_) => {
            warn!(
                target: "job",
                ticker = %req.ticker,
                pid = ?handle.pid,
                limit_secs = cfg.max_runtime.as_secs(),
                "analysis exceeded max runtime, killing"
            );
            if let Err(e) = handle.child.kill().await {
                warn!(target: "job", error = %e, "failed to kill analysis process");
            }
            return Err(JobError::Timeout {
                limit: cfg.max_runtime,
            });
        }
    };

    info!(target: "job", ticker = %req.ticker, pid = ?handle.pid, code = ?exit_code, "analysis process exited");
    resolver::resolve(job.into_output(exit_code), &cfg.project_root)
}
