//! Per-stream byte credit.
//!
//! The slot scheduler adds credit as the shaper authorizes bytes; the
//! flusher removes it as bytes reach the transport. Each stream index has
//! its own lock, so streams never contend with each other and every
//! operation on one index is linearizable.

use crate::{Error, Result};
use log::info;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CreditSlot {
    pending: f64,
    credited: f64,
    drained: f64,
    peak: f64,
    increments: u64,
    closed: bool,
}

/// Snapshot of one stream's credit accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditSummary {
    pub stream: usize,
    pub pending: f64,
    pub credited: f64,
    pub drained: f64,
    pub peak: f64,
    pub increments: u64,
}

/// Credit counters for every stream of one session.
///
/// # Examples
///
/// ```
/// use streamload::credit::ByteCreditBuffer;
///
/// let credit = ByteCreditBuffer::new(2);
/// credit.incr(1, 3000.0).unwrap();
/// credit.incr(1, -1000.0).unwrap();
/// assert_eq!(credit.read(1).unwrap(), 2000.0);
/// assert_eq!(credit.read(0).unwrap(), 0.0);
/// ```
#[derive(Debug)]
pub struct ByteCreditBuffer {
    slots: Vec<Mutex<CreditSlot>>,
    changed: Vec<Notify>,
}

impl ByteCreditBuffer {
    pub fn new(streams: usize) -> Self {
        Self {
            slots: (0..streams).map(|_| Mutex::new(CreditSlot::default())).collect(),
            changed: (0..streams).map(|_| Notify::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, stream: usize) -> Result<&Mutex<CreditSlot>> {
        self.slots.get(stream).ok_or(Error::UnknownStream(stream))
    }

    /// Overwrites the pending credit.
    pub fn write(&self, stream: usize, value: f64) -> Result<()> {
        {
            let mut slot = self.slot(stream)?.lock();
            slot.pending = value;
            slot.peak = slot.peak.max(value);
        }
        self.changed[stream].notify_waiters();
        Ok(())
    }

    /// Adds `delta` (negative to drain) and returns the new pending value.
    pub fn incr(&self, stream: usize, delta: f64) -> Result<f64> {
        let pending = {
            let mut slot = self.slot(stream)?.lock();
            slot.pending += delta;
            if delta >= 0.0 {
                slot.credited += delta;
            } else {
                slot.drained -= delta;
            }
            slot.peak = slot.peak.max(slot.pending);
            slot.increments += 1;
            slot.pending
        };
        self.changed[stream].notify_waiters();
        Ok(pending)
    }

    pub fn read(&self, stream: usize) -> Result<f64> {
        Ok(self.slot(stream)?.lock().pending)
    }

    /// Marks that no further credit will be added for this stream.
    pub fn close(&self, stream: usize) -> Result<()> {
        self.slot(stream)?.lock().closed = true;
        self.changed[stream].notify_waiters();
        Ok(())
    }

    pub fn is_closed(&self, stream: usize) -> Result<bool> {
        Ok(self.slot(stream)?.lock().closed)
    }

    pub fn summary(&self, stream: usize) -> Result<CreditSummary> {
        let slot = self.slot(stream)?.lock();
        Ok(CreditSummary {
            stream,
            pending: slot.pending,
            credited: slot.credited,
            drained: slot.drained,
            peak: slot.peak,
            increments: slot.increments,
        })
    }

    /// Emits the stream's accounting to the log and returns it.
    pub fn log(&self, stream: usize) -> Result<CreditSummary> {
        let summary = self.summary(stream)?;
        info!(
            "Stream {} credit: {:.0} credited, {:.0} drained, {:.0} pending, peak {:.0} over {} updates",
            stream,
            summary.credited,
            summary.drained,
            summary.pending,
            summary.peak,
            summary.increments
        );
        Ok(summary)
    }

    /// Waits until `ready` holds for the stream's state.
    ///
    /// `ready` sees the pending credit and the closed flag and is
    /// re-evaluated after every change to that stream.
    pub async fn wait_until<F>(&self, stream: usize, mut ready: F) -> Result<f64>
    where
        F: FnMut(f64, bool) -> bool,
    {
        let notify = self.changed.get(stream).ok_or(Error::UnknownStream(stream))?;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (pending, closed) = {
                let slot = self.slot(stream)?.lock();
                (slot.pending, slot.closed)
            };
            if ready(pending, closed) {
                return Ok(pending);
            }
            notified.await;
        }
    }
}
