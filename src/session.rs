//! Streaming session: bridges one job to one event-stream client.
//!
//! States: `Open -> (Draining | Abandoned) -> Closed`. Two facts are tracked
//! separately because they diverge: whether the transport is still writable and
//! whether the terminal event went out. A client disconnect never cancels the job;
//! its result is discarded when it arrives.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{JobError, TransportError};
use crate::job::{run_analysis_with_progress, CompletedJob, ProgressSink};
use crate::progress::ProgressEvent;
use crate::request::AnalysisRequest;

/// One unit written to the client.
#[derive(Debug)]
pub enum SseFrame {
    Progress(ProgressEvent),
    KeepAlive,
    Complete(Box<CompletedJob>),
    Error(String),
}

impl SseFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SseFrame::Complete(_) | SseFrame::Error(_))
    }
}

/// Write side of the client connection. The read side is the response body.
#[derive(Debug, Clone)]
pub struct SseTransport {
    tx: UnboundedSender<SseFrame>,
}

impl SseTransport {
    pub fn channel() -> (Self, UnboundedReceiver<SseFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// False once the response body has been dropped.
    pub fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, frame: SseFrame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Draining,
    Abandoned,
    Closed,
}

/// Ways the client side can appear to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    /// Request side finished. Not authoritative while the response is writable.
    /// Axum exposes no such hook, so `drive` never raises it; hosts that do can
    /// feed it through [`StreamSession::on_signal`].
    RequestClosed,
    ResponseClosed,
    WriteFailed,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub abandoned: bool,
    pub terminal_sent: bool,
    pub progress_forwarded: usize,
}

pub struct StreamSession {
    label: String,
    transport: Option<SseTransport>,
    transport_writable: bool,
    terminal_sent: bool,
    abandoned: bool,
    state: SessionState,
    keepalive: Option<Interval>,
    forwarded: usize,
}

impl StreamSession {
    /// Must be called inside a Tokio runtime (owns the keep-alive timer).
    pub fn new(transport: SseTransport, keepalive_every: Duration, label: impl Into<String>) -> Self {
        let mut keepalive = interval_at(Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            label: label.into(),
            transport: Some(transport),
            transport_writable: true,
            terminal_sent: false,
            abandoned: false,
            state: SessionState::Open,
            keepalive: Some(keepalive),
            forwarded: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            abandoned: self.abandoned,
            terminal_sent: self.terminal_sent,
            progress_forwarded: self.forwarded,
        }
    }

    fn write(&mut self, frame: SseFrame) -> bool {
        let Some(t) = self.transport.as_ref() else {
            return false;
        };
        match t.send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(target: "session", session = %self.label, error = %e, "write failed");
                self.mark_gone(TransportSignal::WriteFailed);
                false
            }
        }
    }

    /// Forward a progress event; dropped unless the session is open.
    pub fn forward(&mut self, ev: ProgressEvent) {
        if !self.is_open() {
            return;
        }
        if self.write(SseFrame::Progress(ev)) {
            self.forwarded += 1;
        }
    }

    pub fn keep_alive(&mut self) {
        if self.is_open() && self.transport_writable && !self.terminal_sent {
            self.write(SseFrame::KeepAlive);
        }
    }

    pub fn on_signal(&mut self, signal: TransportSignal) {
        if !self.is_open() {
            return;
        }
        if signal == TransportSignal::RequestClosed
            && self.transport.as_ref().is_some_and(SseTransport::is_writable)
        {
            debug!(target: "session", session = %self.label, "request closed but response still writable; ignoring");
            return;
        }
        self.mark_gone(signal);
    }

    fn mark_gone(&mut self, signal: TransportSignal) {
        if self.abandoned {
            return;
        }
        self.transport_writable = false;
        self.abandoned = true;
        self.keepalive = None;
        self.transport = None;
        if self.state == SessionState::Open {
            self.state = SessionState::Abandoned;
        }
        counter!("analysis_sessions_abandoned_total").increment(1);
        info!(target: "session", session = %self.label, ?signal, "client went away; analysis keeps running");
    }

    /// Deliver the job's outcome. At most one terminal frame is ever written.
    pub fn finish(&mut self, outcome: Result<CompletedJob, JobError>) {
        if self.is_open() && !self.transport.as_ref().is_some_and(SseTransport::is_writable) {
            self.mark_gone(TransportSignal::ResponseClosed);
        }
        match self.state {
            SessionState::Open => {
                self.state = SessionState::Draining;
                self.keepalive = None;
                let frame = match outcome {
                    Ok(done) => SseFrame::Complete(Box::new(done)),
                    Err(e) => {
                        warn!(target: "session", session = %self.label, error = %e, "analysis failed");
                        SseFrame::Error(e.to_string())
                    }
                };
                if self.write(frame) {
                    self.terminal_sent = true;
                }
            }
            SessionState::Abandoned => match outcome {
                Ok(_) => info!(target: "session", session = %self.label, "discarding result of abandoned session"),
                Err(e) => info!(target: "session", session = %self.label, error = %e, "discarding failure of abandoned session"),
            },
            SessionState::Draining | SessionState::Closed => return,
        }
        self.close();
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        self.keepalive = None;
        self.transport = None;
        self.transport_writable = false;
    }

    /// Pump progress, keep-alives and transport signals until the job resolves.
    pub async fn drive(
        mut self,
        progress: UnboundedReceiver<ProgressEvent>,
        mut job: JoinHandle<Result<CompletedJob, JobError>>,
    ) -> SessionSummary {
        let mut progress = Some(progress);
        loop {
            tokio::select! {
                biased;
                Some(ev) = recv_progress(&mut progress), if self.is_open() => self.forward(ev),
                joined = &mut job => {
                    if let Some(rx) = progress.as_mut() {
                        while let Ok(ev) = rx.try_recv() {
                            self.forward(ev);
                        }
                    }
                    let outcome = joined.unwrap_or_else(|e| {
                        Err(JobError::Io(std::io::Error::other(format!("analysis task failed: {e}"))))
                    });
                    self.finish(outcome);
                    break;
                }
                _ = transport_closed(&self.transport), if self.is_open() => {
                    self.on_signal(TransportSignal::ResponseClosed)
                }
                _ = tick(&mut self.keepalive), if self.is_open() => self.keep_alive(),
            }
            if self.state == SessionState::Abandoned {
                // stop buffering lines nobody will read
                progress = None;
            }
        }
        self.summary()
    }
}

async fn recv_progress(rx: &mut Option<UnboundedReceiver<ProgressEvent>>) -> Option<ProgressEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn transport_closed(t: &Option<SseTransport>) {
    match t {
        Some(t) => t.closed().await,
        None => pending().await,
    }
}

async fn tick(iv: &mut Option<Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => pending().await,
    }
}

/// Start a job with a streaming session attached; returns the frames for the response body.
pub fn spawn_streaming(cfg: Arc<BridgeConfig>, req: AnalysisRequest) -> UnboundedReceiver<SseFrame> {
    let (transport, frames) = SseTransport::channel();
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let sink: ProgressSink = Box::new(move |ev: &ProgressEvent| {
        // receiver is gone once the session is abandoned
        let _ = progress_tx.send(ev.clone());
    });

    let session = StreamSession::new(transport, cfg.keepalive_interval, req.ticker.clone());
    let job = tokio::spawn(async move { run_analysis_with_progress(&cfg, &req, Some(sink)).await });
    tokio::spawn(session.drive(progress_rx, job));
    frames
}
