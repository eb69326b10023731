use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Mode};
use crate::fanout::{IndexedJoinSet, RunContext};
use crate::receiver::Receiver;
use crate::reporter::{
    run_reporter_task, ProgressCallback, ProgressEvent, ReportCollector, RunReport,
    SummaryReporter,
};
use crate::retry::RetryPolicy;
use crate::transport::{self, Acceptor, BoxedSession, BoxedStream};
use crate::{Error, Result};
use log::{debug, info};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receiving side of an experiment.
///
/// Accepts `TotalSession` sessions, reads `TotalStream` streams from each
/// until every stream's `FileSize` has arrived, then returns the report.
/// Streams carry no header: the n-th stream accepted on a session is
/// stream n, which is the order the client opened them in.
///
/// # Examples
///
/// ```no_run
/// use streamload::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::from_file("server.json")?;
/// let server = Server::new(config)?;
///
/// let report = server.run().await?;
/// println!("{} streams received", report.completed());
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Arc<Config>,
    acceptor: Option<Arc<dyn Acceptor>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    callback: Option<Arc<dyn ProgressCallback>>,
    quiet: bool,
    file_logs: bool,
    cancellation_token: CancellationToken,
}

impl Server {
    /// Creates a server; the listener is bound when [`Server::run`] starts.
    pub fn new(config: Config) -> Result<Self> {
        config.validate(Mode::Server)?;
        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            config: Arc::new(config),
            acceptor: None,
            clock: Arc::new(SystemClock::new()),
            retry,
            callback: None,
            quiet: false,
            file_logs: true,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Accepts sessions from an already bound transport.
    pub fn with_acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_file_logs(mut self, enabled: bool) -> Self {
        self.file_logs = enabled;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Accepts and measures every configured session.
    ///
    /// Binding failures are returned as `Err`; everything after that is
    /// collected in the report.
    pub async fn run(&self) -> Result<RunReport> {
        let acceptor = match &self.acceptor {
            Some(acceptor) => acceptor.clone(),
            None => Arc::from(transport::acceptor(&self.config).await?),
        };

        let started = Instant::now();
        let (reporter, receiver) = SummaryReporter::new();
        let reporter_task = tokio::spawn(run_reporter_task(
            receiver,
            self.quiet,
            self.callback.clone(),
        ));

        let ctx = RunContext {
            config: self.config.clone(),
            clock: self.clock.clone(),
            cancel: self.cancellation_token.clone(),
            retry: self.retry.clone(),
            reporter: reporter.clone(),
            collector: ReportCollector::new(),
            file_logs: self.file_logs,
        };

        info!(
            "Waiting for {} session(s) x {} stream(s) on {}",
            self.config.sessions(),
            self.config.streams_per_session(),
            self.config.addr
        );

        let mut sessions = IndexedJoinSet::new();
        for s in 0..self.config.sessions() {
            let what = format!("Session {} accept", s);
            let accepted = ctx
                .retry
                .run(&what, &ctx.cancel, |_| acceptor.accept())
                .await;
            match accepted {
                Ok(session) => {
                    ctx.reporter.event(ProgressEvent::SessionStarted { session: s });
                    sessions.spawn(s, serve_session(ctx.clone(), s, session));
                }
                Err(Error::Cancelled) => {
                    for pending in s..self.config.sessions() {
                        ctx.fail_session(pending, Error::Cancelled);
                    }
                    break;
                }
                Err(e) => ctx.fail_session(s, e),
            }
        }
        while let Some((s, joined)) = sessions.join_next().await {
            if let Err(e) = joined {
                ctx.fail_session(s, e);
            }
        }

        let report = ctx.collector.take(started.elapsed());
        reporter.event(ProgressEvent::RunCompleted {
            completed: report.completed(),
            failed: report.failed(),
            total_bytes: report.total_bytes(),
        });
        reporter.complete();
        reporter_task
            .await
            .map_err(|e| Error::Join(e.to_string()))?;
        Ok(report)
    }
}

async fn serve_session(ctx: RunContext, s: usize, session: BoxedSession) {
    let streams = ctx.config.streams_per_session();
    let mut workers = IndexedJoinSet::new();

    for k in 0..streams {
        let accepted = tokio::select! {
            res = session.accept_stream() => res,
            _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        };
        match accepted {
            Ok(stream) => workers.spawn(k, receive_stream(ctx.clone(), s, k, stream)),
            Err(e) => {
                // Nothing after a failed accept will arrive on this session.
                for missing in k + 1..streams {
                    ctx.finish_stream(
                        s,
                        missing,
                        Err(Error::Connection(format!(
                            "session {} ended before stream {} was opened",
                            s, missing
                        ))),
                    );
                }
                ctx.finish_stream(s, k, Err(e));
                break;
            }
        }
    }

    while let Some((k, joined)) = workers.join_next().await {
        ctx.finish_stream(s, k, joined.and_then(|res| res));
    }
    session.close().await;
    debug!("Session {} closed", s);
}

async fn receive_stream(
    ctx: RunContext,
    s: usize,
    k: usize,
    stream: BoxedStream,
) -> Result<crate::recorder::StreamSummary> {
    let target = ctx.config.target_bytes(k).ok_or(Error::UnknownStream(k))?;
    Receiver::new(
        s,
        k,
        stream,
        ctx.config.pkt_size,
        target,
        ctx.clock.clone(),
        ctx.stream_log(Mode::Server, s, k),
        ctx.cancel.clone(),
    )
    .with_io_timeout(ctx.config.io_timeout())
    .run()
    .await
}
