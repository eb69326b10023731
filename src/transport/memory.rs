//! In-process transport over tokio duplex pipes.
//!
//! Sessions and streams behave like the network transports (streams are
//! accepted in the order they were opened, a closed peer reads as EOF) but
//! never touch a socket.

use super::{Acceptor, BoxedSession, BoxedStream, Connector, Session};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

/// Default pipe capacity per stream.
pub const DEFAULT_BUFFER: usize = 256 * 1024;

/// Connected pair: sessions dialled on the connector come out of the
/// acceptor.
pub fn pair(buffer: usize) -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            tx,
            buffer,
            refuse: AtomicUsize::new(0),
        },
        MemoryAcceptor {
            rx: Mutex::new(rx),
        },
    )
}

pub struct MemorySession {
    outgoing: mpsc::UnboundedSender<DuplexStream>,
    incoming: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    buffer: usize,
}

impl MemorySession {
    fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: a_tx,
                incoming: Mutex::new(b_rx),
                buffer,
            },
            Self {
                outgoing: b_tx,
                incoming: Mutex::new(a_rx),
                buffer,
            },
        )
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn open_stream(&self) -> Result<BoxedStream> {
        let (local, remote) = tokio::io::duplex(self.buffer);
        self.outgoing
            .send(remote)
            .map_err(|_| Error::Connection("peer session closed".to_string()))?;
        Ok(Box::new(local))
    }

    async fn accept_stream(&self) -> Result<BoxedStream> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .map(|s| Box::new(s) as BoxedStream)
            .ok_or_else(|| Error::Connection("peer session closed".to_string()))
    }

    async fn close(&self) {}
}

pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<MemorySession>,
    buffer: usize,
    refuse: AtomicUsize,
}

impl MemoryConnector {
    /// Makes the next `n` connection attempts fail as if refused.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<BoxedSession> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let (local, remote) = MemorySession::pair(self.buffer);
        self.tx
            .send(remote)
            .map_err(|_| Error::Connection("no acceptor".to_string()))?;
        Ok(Box::new(local))
    }
}

pub struct MemoryAcceptor {
    rx: Mutex<mpsc::UnboundedReceiver<MemorySession>>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> Result<BoxedSession> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .map(|s| Box::new(s) as BoxedSession)
            .ok_or_else(|| Error::Connection("connector dropped".to_string()))
    }
}
