//! Drains authorized byte credit onto the transport.
//!
//! In TCP mode the scheduler calls [`TransportFlusher::flush_slot`] from
//! inside each tick. In QUIC mode the flusher runs as its own task
//! ([`TransportFlusher::run`]) and wakes whenever the stream's credit
//! changes. Either way every successful write removes its size from the
//! credit and appends one log record.

use crate::clock::Clock;
use crate::credit::ByteCreditBuffer;
use crate::deadline::guarded;
use crate::recorder::{LogRecord, StreamLog};
use crate::Result;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Bytes and writes a flusher put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub bytes: u64,
    pub chunks: u64,
}

/// Synchronous per-slot sink used by the TCP scheduler.
#[async_trait]
pub trait SlotSink: Send {
    /// Writes `bytes` before returning.
    async fn flush_slot(&mut self, bytes: u64) -> Result<()>;
}

pub struct TransportFlusher<W> {
    stream: usize,
    writer: W,
    pkt_size: usize,
    payload: Vec<u8>,
    credit: Arc<ByteCreditBuffer>,
    clock: Arc<dyn Clock>,
    log: StreamLog,
    io_timeout: Option<Duration>,
    cancel: CancellationToken,
    outcome: FlushOutcome,
}

impl<W> TransportFlusher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: usize,
        writer: W,
        pkt_size: usize,
        credit: Arc<ByteCreditBuffer>,
        clock: Arc<dyn Clock>,
        log: StreamLog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            writer,
            pkt_size,
            payload: vec![0u8; pkt_size],
            credit,
            clock,
            log,
            io_timeout: None,
            cancel,
            outcome: FlushOutcome::default(),
        }
    }

    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn outcome(&self) -> FlushOutcome {
        self.outcome
    }

    /// Records kept in memory by the stream's log.
    pub fn log(&self) -> &StreamLog {
        &self.log
    }

    async fn write_chunk(&mut self, len: usize) -> Result<()> {
        // Stamped when the write is issued, not when it completes
        let timestamp = self.clock.now_micros();
        let write = self.writer.write_all(&self.payload[..len]);
        guarded(self.stream, self.io_timeout, &self.cancel, write).await?;

        let record = LogRecord::new(timestamp, len as u64);
        self.log.append(record);
        self.credit.incr(self.stream, -(len as f64))?;
        self.outcome.bytes += len as u64;
        self.outcome.chunks += 1;
        Ok(())
    }

    /// Background drain loop for multiplexed streams.
    ///
    /// Returns once the credit is closed and less than one byte remains.
    pub async fn run(mut self) -> Result<(FlushOutcome, StreamLog)> {
        loop {
            let wait = self
                .credit
                .wait_until(self.stream, |pending, closed| pending >= 1.0 || closed);
            let pending = tokio::select! {
                res = wait => res?,
                _ = self.cancel.cancelled() => return Err(crate::Error::Cancelled),
            };
            if pending < 1.0 {
                break;
            }
            let chunk = (self.pkt_size as f64).min(pending.floor()) as usize;
            self.write_chunk(chunk).await?;
        }
        self.finish().await?;
        Ok((self.outcome, self.log))
    }

    /// Flushes and closes the sending side.
    pub async fn finish(&mut self) -> Result<()> {
        guarded(self.stream, self.io_timeout, &self.cancel, self.writer.shutdown()).await?;
        self.log.flush();
        debug!(
            "Stream {} flushed {} bytes in {} writes",
            self.stream, self.outcome.bytes, self.outcome.chunks
        );
        Ok(())
    }

    pub fn into_parts(self) -> (FlushOutcome, StreamLog) {
        (self.outcome, self.log)
    }
}

#[async_trait]
impl<W> SlotSink for TransportFlusher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn flush_slot(&mut self, bytes: u64) -> Result<()> {
        let mut remaining = bytes;
        while remaining > 0 {
            let chunk = remaining.min(self.pkt_size as u64) as usize;
            self.write_chunk(chunk).await?;
            remaining -= chunk as u64;
        }
        Ok(())
    }
}
