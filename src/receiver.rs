//! Server-side reader for one stream.

use crate::clock::Clock;
use crate::deadline::guarded;
use crate::recorder::{Direction, LogRecord, RateRecorder, StreamLog, StreamSummary};
use crate::{Error, Result};
use log::debug;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Reads packet-size chunks until the stream's target has arrived.
///
/// Each non-empty read is logged with its actual size. Elapsed time runs
/// from the first non-empty read to the last, and the achieved rate uses
/// the same formula as the sender.
pub struct Receiver<R> {
    session: usize,
    stream: usize,
    reader: R,
    pkt_size: usize,
    target: u64,
    clock: Arc<dyn Clock>,
    log: StreamLog,
    io_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<R> Receiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: usize,
        stream: usize,
        reader: R,
        pkt_size: usize,
        target: u64,
        clock: Arc<dyn Clock>,
        log: StreamLog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            stream,
            reader,
            pkt_size,
            target,
            clock,
            log,
            io_timeout: None,
            cancel,
        }
    }

    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub async fn run(self) -> Result<StreamSummary> {
        self.run_with_log().await.map(|(summary, _)| summary)
    }

    /// Like [`Receiver::run`], also handing back the stream's log.
    pub async fn run_with_log(mut self) -> Result<(StreamSummary, StreamLog)> {
        let mut buf = vec![0u8; self.pkt_size.max(1)];
        let mut rate = RateRecorder::new();
        let mut received = 0u64;

        debug!(
            "Session {} stream {}: expecting {} bytes",
            self.session, self.stream, self.target
        );

        while received < self.target {
            let want = buf.len().min((self.target - received) as usize);
            let read = self.reader.read(&mut buf[..want]);
            let n = match guarded(self.stream, self.io_timeout, &self.cancel, read).await {
                Ok(0) => {
                    return Err(Error::PeerClosed {
                        stream: self.stream,
                        received,
                        target: self.target,
                    })
                }
                Ok(n) => n,
                Err(Error::StreamIo { source, .. })
                    if matches!(
                        source.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };

            let record = LogRecord::new(self.clock.now_micros(), n as u64);
            self.log.append(record);
            rate.record(&record);
            received += n as u64;
        }
        self.log.flush();

        let summary = StreamSummary::from_recorder(
            self.session,
            self.stream,
            Direction::Received,
            self.target,
            0,
            &rate,
        );
        debug!("{}", summary);
        Ok((summary, self.log))
    }
}
