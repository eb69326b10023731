//! Progress events, stdout summaries and the end-of-run report.
//!
//! Workers never print. They send [`ProgressEvent`]s through a
//! [`SummaryReporter`]; a separate task formats them and forwards them to
//! the user's [`ProgressCallback`], keeping I/O off the data path.

use crate::recorder::StreamSummary;
use crate::{Error, Result};
use log::error;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle events of a run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A session was established (client) or accepted (server)
    SessionStarted { session: usize },
    /// A stream finished its target
    StreamCompleted(StreamSummary),
    /// A stream failed; its siblings keep going
    StreamFailed {
        session: usize,
        stream: usize,
        error: String,
    },
    /// A whole session could not be established
    SessionFailed { session: usize, error: String },
    /// Every worker has been joined
    RunCompleted {
        completed: usize,
        failed: usize,
        total_bytes: u64,
    },
}

/// Receives progress events.
///
/// Implemented for any `Fn(ProgressEvent) + Send + Sync` closure.
///
/// # Examples
///
/// ```
/// use streamload::{ProgressCallback, ProgressEvent};
///
/// struct CountFailures;
///
/// impl ProgressCallback for CountFailures {
///     fn on_progress(&self, event: ProgressEvent) {
///         if let ProgressEvent::StreamFailed { stream, .. } = event {
///             eprintln!("stream {} failed", stream);
///         }
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Debug, Clone)]
pub enum ReportMessage {
    Event(ProgressEvent),
    Complete,
}

/// Cheap, cloneable handle for emitting events.
#[derive(Clone)]
pub struct SummaryReporter {
    sender: mpsc::UnboundedSender<ReportMessage>,
}

impl SummaryReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn event(&self, event: ProgressEvent) {
        let _ = self.sender.send(ReportMessage::Event(event));
    }

    pub fn complete(&self) {
        let _ = self.sender.send(ReportMessage::Complete);
    }
}

/// Drains reporter messages until completion.
///
/// Per-stream summaries go to stdout unless `quiet` is set; every event
/// is handed to `callback`.
pub async fn run_reporter_task(
    mut receiver: mpsc::UnboundedReceiver<ReportMessage>,
    quiet: bool,
    callback: Option<Arc<dyn ProgressCallback>>,
) {
    while let Some(msg) = receiver.recv().await {
        let event = match msg {
            ReportMessage::Event(event) => event,
            ReportMessage::Complete => break,
        };
        if !quiet {
            print_event(&event);
        }
        if let Some(cb) = &callback {
            cb.on_progress(event);
        }
    }
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::StreamCompleted(summary) => println!("{}", summary),
        ProgressEvent::StreamFailed {
            session,
            stream,
            error,
        } => println!("[{:2}/{:2}] FAILED: {}", session + 1, stream + 1, error),
        ProgressEvent::SessionFailed { session, error } => {
            println!("[{:2}/--] session FAILED: {}", session + 1, error)
        }
        ProgressEvent::RunCompleted {
            completed,
            failed,
            total_bytes,
        } => {
            println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
            println!(
                "{} streams completed, {} failed, {:.2} MBytes total",
                completed,
                failed,
                *total_bytes as f64 / 1_000_000.0
            );
        }
        ProgressEvent::SessionStarted { .. } => {}
    }
}

/// What happened to one stream.
#[derive(Debug)]
pub struct StreamOutcome {
    pub session: usize,
    pub stream: usize,
    pub result: Result<StreamSummary>,
}

/// Outcome of every stream and session of a run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub streams: Vec<StreamOutcome>,
    pub session_errors: Vec<(usize, Error)>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn summaries(&self) -> impl Iterator<Item = &StreamSummary> {
        self.streams.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn completed(&self) -> usize {
        self.summaries().count()
    }

    pub fn failed(&self) -> usize {
        self.streams.iter().filter(|o| o.result.is_err()).count() + self.session_errors.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.summaries().map(|s| s.bytes).sum()
    }

    /// Summary of one stream, if it completed.
    pub fn summary(&self, session: usize, stream: usize) -> Option<&StreamSummary> {
        self.streams
            .iter()
            .find(|o| o.session == session && o.stream == stream)
            .and_then(|o| o.result.as_ref().ok())
    }

    /// The completed summaries, or the first failure.
    ///
    /// Every failure is logged before the first one is returned.
    pub fn into_result(self) -> Result<Vec<StreamSummary>> {
        for (session, e) in &self.session_errors {
            error!("Session {} failed: {}", session, e);
        }
        for o in &self.streams {
            if let Err(e) = &o.result {
                error!("Session {} stream {} failed: {}", o.session, o.stream, e);
            }
        }

        if let Some((_, e)) = self.session_errors.into_iter().next() {
            return Err(e);
        }
        let mut summaries = Vec::with_capacity(self.streams.len());
        for o in self.streams {
            summaries.push(o.result?);
        }
        Ok(summaries)
    }
}

/// Thread-safe sink workers push their outcomes into.
#[derive(Debug, Clone, Default)]
pub struct ReportCollector {
    inner: Arc<Mutex<RunReport>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stream(&self, session: usize, stream: usize, result: Result<StreamSummary>) {
        self.inner.lock().streams.push(StreamOutcome {
            session,
            stream,
            result,
        });
    }

    pub fn record_session_error(&self, session: usize, error: Error) {
        self.inner.lock().session_errors.push((session, error));
    }

    /// Takes the collected report, sorted by session then stream.
    pub fn take(&self, elapsed: Duration) -> RunReport {
        let mut report = std::mem::take(&mut *self.inner.lock());
        report.streams.sort_by_key(|o| (o.session, o.stream));
        report.session_errors.sort_by_key(|(s, _)| *s);
        report.elapsed = elapsed;
        report
    }
}
