//! Time sources for slot ticking and log timestamps.
//!
//! Workers take a [`Clock`] for log timestamps and a [`Ticker`] for slot
//! boundaries, so tests can drive slots one at a time without real sleeps.
//! Other waits, such as the drain poll and I/O deadlines, use tokio's timer
//! directly and follow the paused test clock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Source of microsecond timestamps for log records.
pub trait Clock: Send + Sync {
    /// Microseconds since the Unix epoch.
    fn now_micros(&self) -> u64;
}

/// Wall clock anchored once at construction and advanced monotonically.
///
/// Built on tokio's `Instant`, so it follows the paused test clock too.
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor_micros: u64,
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_micros: chrono::Utc::now().timestamp_micros().max(0) as u64,
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        self.anchor_micros + self.origin.elapsed().as_micros() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Periodic slot boundary.
#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next slot boundary.
    async fn tick(&mut self);
}

/// Fixed-period ticker backed by `tokio::time::interval`.
///
/// The first tick fires one period after construction. Ticks missed by a
/// slow worker are skipped rather than bursted.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Ticker fired by hand through a [`TickHandle`].
///
/// When paired with a [`ManualClock`], every tick also advances the clock
/// by one slot, so timestamps line up with slot boundaries.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
    clock: Option<(ManualClock, Duration)>,
}

/// Sending side of a [`ManualTicker`].
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl TickHandle {
    pub fn tick(&self) {
        let _ = self.tx.send(());
    }

    pub fn tick_n(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }
}

impl ManualTicker {
    pub fn new() -> (Self, TickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx, clock: None }, TickHandle { tx })
    }

    pub fn with_clock(clock: ManualClock, slot: Duration) -> (Self, TickHandle) {
        let (mut ticker, handle) = Self::new();
        ticker.clock = Some((clock, slot));
        (ticker, handle)
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        match self.rx.recv().await {
            Some(()) => {
                if let Some((clock, slot)) = &self.clock {
                    clock.advance(*slot);
                }
            }
            // Every handle is gone: no tick will ever come.
            None => std::future::pending::<()>().await,
        }
    }
}
