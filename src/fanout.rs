//! Shared plumbing for the client and server fan-out.

use crate::clock::Clock;
use crate::config::{Config, Mode};
use crate::recorder::{log_path, StreamLog};
use crate::reporter::{ProgressEvent, ReportCollector, SummaryReporter};
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything a session or stream worker needs, cloned into each task.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
    pub retry: RetryPolicy,
    pub reporter: SummaryReporter,
    pub collector: ReportCollector,
    pub file_logs: bool,
}

impl RunContext {
    pub fn stream_log(&self, mode: Mode, session: usize, stream: usize) -> StreamLog {
        if self.file_logs {
            StreamLog::create(log_path(
                &self.config.log_dir,
                mode,
                self.config.transport(),
                session,
                stream,
            ))
        } else {
            StreamLog::in_memory()
        }
    }

    /// Files a stream's outcome and announces it.
    pub fn finish_stream(
        &self,
        session: usize,
        stream: usize,
        result: Result<crate::recorder::StreamSummary>,
    ) {
        match &result {
            Ok(summary) => self
                .reporter
                .event(ProgressEvent::StreamCompleted(summary.clone())),
            Err(e) => {
                log::error!("Session {} stream {} failed: {}", session, stream, e);
                self.reporter.event(ProgressEvent::StreamFailed {
                    session,
                    stream,
                    error: e.to_string(),
                });
            }
        }
        self.collector.record_stream(session, stream, result);
    }

    pub fn fail_session(&self, session: usize, error: Error) {
        log::error!("Session {} failed: {}", session, error);
        self.reporter.event(ProgressEvent::SessionFailed {
            session,
            error: error.to_string(),
        });
        self.collector.record_session_error(session, error);
    }
}

/// Join set that remembers which index each task was spawned for, so a
/// panicked worker can still be attributed.
pub(crate) struct IndexedJoinSet<T> {
    set: JoinSet<(usize, T)>,
    pending: BTreeSet<usize>,
    panics: Vec<String>,
}

impl<T: Send + 'static> IndexedJoinSet<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            pending: BTreeSet::new(),
            panics: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, index: usize, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.pending.insert(index);
        self.set.spawn(async move { (index, task.await) });
    }

    /// Next finished task as `(index, output)`.
    ///
    /// Tasks that panicked are reported last, as [`Error::Join`], once
    /// every other task has been joined.
    pub async fn join_next(&mut self) -> Option<(usize, Result<T>)> {
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((index, value)) => {
                    self.pending.remove(&index);
                    return Some((index, Ok(value)));
                }
                Err(e) => self.panics.push(e.to_string()),
            }
        }
        let index = self.pending.pop_first()?;
        let reason = self
            .panics
            .pop()
            .unwrap_or_else(|| "worker task lost".to_string());
        Some((index, Err(Error::Join(reason))))
    }
}
