use crate::clock::{Clock, IntervalTicker, SystemClock};
use crate::config::{Config, Mode, TransportMode};
use crate::credit::ByteCreditBuffer;
use crate::fanout::{IndexedJoinSet, RunContext};
use crate::flusher::TransportFlusher;
use crate::recorder::StreamSummary;
use crate::reporter::{
    run_reporter_task, ProgressCallback, ProgressEvent, ReportCollector, RunReport,
    SummaryReporter,
};
use crate::retry::RetryPolicy;
use crate::scheduler::SlotScheduler;
use crate::shaper::TrafficShaper;
use crate::transport::{self, BoxedStream, Connector};
use crate::{Error, Result};
use log::{debug, info};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type CallbackRef = Arc<dyn ProgressCallback>;

/// Load generating client.
///
/// Opens `TotalSession` sessions, each carrying `TotalStream` concurrently
/// shaped streams, and waits until every stream has delivered its target
/// or failed. A failed stream never stops its siblings; the returned
/// [`RunReport`] lists every outcome.
///
/// # Examples
///
/// ```no_run
/// use streamload::{Client, Config, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::from_file("client.json")?;
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| {
///         if let ProgressEvent::StreamCompleted(summary) = event {
///             println!("{:.2} Mbps", summary.mbps);
///         }
///     });
///
/// let report = client.run().await?;
/// report.into_result()?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    callback: Option<CallbackRef>,
    quiet: bool,
    file_logs: bool,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a client for the transport the configuration selects.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is not valid for a client or
    /// the transport cannot be set up.
    pub fn new(config: Config) -> Result<Self> {
        config.validate(Mode::Client)?;
        let connector = transport::connector(&config)?;
        Self::with_connector(config, Arc::from(connector))
    }

    /// Creates a client over an explicit transport.
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate(Mode::Client)?;
        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            config: Arc::new(config),
            connector,
            clock: Arc::new(SystemClock::new()),
            retry,
            callback: None,
            quiet: false,
            file_logs: true,
            cancellation_token: CancellationToken::new(),
        })
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

    /// Suppresses the per-stream summary lines on stdout.
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// When disabled, transfer records stay in memory instead of `LogDir`.
    pub fn with_file_logs(mut self, enabled: bool) -> Self {
        self.file_logs = enabled;
        self
    }

    /// Token that stops every session and stream of the run when cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs every session to completion.
    ///
    /// Only setup problems are returned as `Err`; stream and session
    /// failures are collected in the report.
    pub async fn run(&self) -> Result<RunReport> {
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
            "Starting {} session(s) x {} stream(s) to {} over {:?}",
            self.config.sessions(),
            self.config.streams_per_session(),
            self.config.addr,
            self.config.transport()
        );

        let mut sessions = IndexedJoinSet::new();
        for s in 0..self.config.sessions() {
            sessions.spawn(s, run_session(ctx.clone(), self.connector.clone(), s));
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

async fn run_session(ctx: RunContext, connector: Arc<dyn Connector>, s: usize) {
    let connector = &*connector;
    let what = format!("Session {} connect", s);
    let session = match ctx
        .retry
        .run(&what, &ctx.cancel, |_| connector.connect())
        .await
    {
        Ok(session) => session,
        Err(e) => return ctx.fail_session(s, e),
    };
    ctx.reporter.event(ProgressEvent::SessionStarted { session: s });

    let streams = ctx.config.streams_per_session();
    let credit = Arc::new(ByteCreditBuffer::new(streams));
    let mut workers = IndexedJoinSet::new();

    for k in 0..streams {
        let what = format!("Session {} stream {} open", s, k);
        let opened = ctx
            .retry
            .run(&what, &ctx.cancel, |_| session.open_stream())
            .await;
        match opened {
            Ok(stream) => {
                workers.spawn(k, run_stream(ctx.clone(), s, k, stream, credit.clone()));
            }
            Err(e) => ctx.finish_stream(s, k, Err(e)),
        }
    }

    while let Some((k, joined)) = workers.join_next().await {
        ctx.finish_stream(s, k, joined.and_then(|res| res));
    }
    session.close().await;
    debug!("Session {} closed", s);
}

/// One shaped stream: a slot scheduler plus the flusher draining its
/// credit onto the transport.
async fn run_stream(
    ctx: RunContext,
    s: usize,
    k: usize,
    stream: BoxedStream,
    credit: Arc<ByteCreditBuffer>,
) -> Result<StreamSummary> {
    let config = &ctx.config;
    let target = config.target_bytes(k).ok_or(Error::UnknownStream(k))?;
    let shaper = TrafficShaper::for_stream(config, k)?;
    let slot = config.slot_duration()?;

    // Cancelled on every exit path so a background flusher never outlives
    // its scheduler.
    let cancel = ctx.cancel.child_token();
    let _stop_flusher = cancel.clone().drop_guard();

    let mut flusher = TransportFlusher::new(
        k,
        stream,
        config.pkt_size,
        credit.clone(),
        ctx.clock.clone(),
        ctx.stream_log(Mode::Client, s, k),
        cancel.clone(),
    )
    .with_io_timeout(config.io_timeout());
    let mut scheduler = SlotScheduler::new(
        s,
        k,
        target,
        shaper,
        IntervalTicker::new(slot),
        ctx.clock.clone(),
        credit,
        cancel,
    )
    .with_drain_poll(config.drain_poll());

    match config.transport() {
        TransportMode::Tcp => {
            let mut summary = scheduler.run_inline(&mut flusher).await?;
            flusher.finish().await?;
            summary.chunks = flusher.outcome().chunks;
            Ok(summary)
        }
        TransportMode::Quic => {
            let mut flush_task = tokio::spawn(flusher.run());
            let mut summary = tokio::select! {
                res = scheduler.run() => res?,
                res = &mut flush_task => {
                    return Err(match res {
                        Ok(Err(e)) => e,
                        Ok(Ok(_)) => Error::Join(format!("stream {} flusher stopped early", k)),
                        Err(e) => Error::Join(e.to_string()),
                    });
                }
            };
            let (outcome, _log) = flush_task
                .await
                .map_err(|e| Error::Join(e.to_string()))??;
            summary.chunks = outcome.chunks;
            Ok(summary)
        }
    }
}
