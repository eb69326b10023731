//! Fixed-period slot loop driving one shaped stream.

use crate::clock::{Clock, Ticker};
use crate::credit::ByteCreditBuffer;
use crate::flusher::SlotSink;
use crate::recorder::{Direction, LogRecord, RateRecorder, StreamSummary};
use crate::shaper::TrafficShaper;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`SlotScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Ticking and authorizing bytes
    Sending,
    /// Target authorized; waiting for the flusher to empty the credit
    Draining,
    Done,
}

/// Runs the slot loop of one stream.
///
/// Every tick samples the shaper, clips the draw to the bytes the stream
/// still owes and adds it to the stream's credit. Once the whole target is
/// authorized the scheduler stops ticking, waits until the credit reads
/// zero and reports the stream's summary.
pub struct SlotScheduler<T> {
    session: usize,
    stream: usize,
    target: u64,
    shaper: TrafficShaper,
    ticker: T,
    clock: Arc<dyn Clock>,
    credit: Arc<ByteCreditBuffer>,
    drain_poll: Duration,
    cancel: CancellationToken,
    state: SchedulerState,
    sent: u64,
    slots: u64,
}

impl<T: Ticker> SlotScheduler<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: usize,
        stream: usize,
        target: u64,
        shaper: TrafficShaper,
        ticker: T,
        clock: Arc<dyn Clock>,
        credit: Arc<ByteCreditBuffer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            stream,
            target,
            shaper,
            ticker,
            clock,
            credit,
            drain_poll: Duration::from_millis(100),
            cancel,
            state: SchedulerState::Idle,
            sent: 0,
            slots: 0,
        }
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll = poll;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Bytes authorized so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Multiplexed mode: a separate flusher task drains the credit.
    pub async fn run(&mut self) -> Result<StreamSummary> {
        self.run_with(None).await
    }

    /// TCP mode: each slot's bytes are written before the next tick, so
    /// there is nothing left to drain.
    pub async fn run_inline(&mut self, sink: &mut dyn SlotSink) -> Result<StreamSummary> {
        self.run_with(Some(sink)).await
    }

    async fn run_with(&mut self, mut sink: Option<&mut dyn SlotSink>) -> Result<StreamSummary> {
        if self.state != SchedulerState::Idle {
            return Err(Error::Config(format!(
                "stream {} scheduler already started",
                self.stream
            )));
        }

        let mut rate = RateRecorder::starting_at(self.clock.now_micros());
        self.state = SchedulerState::Sending;
        info!(
            "Session {} stream {}: sending {} bytes, {} process, {:.1} packets/slot expected",
            self.session,
            self.stream,
            self.target,
            self.shaper.name(),
            self.shaper.expected_packets()
        );
        if self.target > 0 && self.shaper.expected_packets() < 0.5 {
            warn!(
                "Session {} stream {}: {:.2} packets expected per slot, stream may never finish",
                self.session,
                self.stream,
                self.shaper.expected_packets()
            );
        }

        while self.sent < self.target {
            tokio::select! {
                _ = self.ticker.tick() => {}
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            }
            self.slots += 1;

            let bytes = self.shaper.bytes_for_slot(self.target - self.sent);
            if bytes == 0 {
                continue;
            }
            self.credit.incr(self.stream, bytes as f64)?;
            if let Some(sink) = sink.as_deref_mut() {
                sink.flush_slot(bytes).await?;
            }
            self.sent += bytes;
            rate.record(&LogRecord::new(self.clock.now_micros(), bytes));
            debug!(
                "Session {} stream {} slot {}: +{} bytes, {}/{}",
                self.session, self.stream, self.slots, bytes, self.sent, self.target
            );
        }

        self.state = SchedulerState::Draining;
        if sink.is_none() {
            self.drain().await?;
        }
        self.credit.close(self.stream)?;
        self.credit.log(self.stream)?;

        rate.finish_at(self.clock.now_micros());
        self.state = SchedulerState::Done;
        Ok(StreamSummary::from_recorder(
            self.session,
            self.stream,
            Direction::Sent,
            self.target,
            self.slots,
            &rate,
        ))
    }

    /// Polls until the flusher has emptied this stream's credit.
    async fn drain(&mut self) -> Result<()> {
        loop {
            if self.credit.read(self.stream)? < 1.0 {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.drain_poll) => {}
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}
