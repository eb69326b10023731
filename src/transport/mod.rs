//! Transport adapters.
//!
//! The load engine only needs to establish sessions, open or accept
//! streams on them and move bytes. Each transport implements the three
//! traits below; streams are plain `AsyncRead + AsyncWrite` objects.

pub mod memory;
pub mod quic;
pub mod tcp;
pub mod tls;

use crate::config::{Config, TransportMode};
use crate::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream carried by a session.
pub trait DataStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DataStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn DataStream>;

/// A live connection multiplexing zero or more streams.
#[async_trait]
pub trait Session: Send + Sync {
    /// Opens the next outgoing stream.
    async fn open_stream(&self) -> Result<BoxedStream>;

    /// Waits for the peer's next stream, in the order the peer opened them.
    async fn accept_stream(&self) -> Result<BoxedStream>;

    /// Ends the session once its streams are done.
    async fn close(&self);
}

pub type BoxedSession = Box<dyn Session>;

/// Client side: dials the configured address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedSession>;
}

/// Server side: yields sessions as peers arrive.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> Result<BoxedSession>;
}

/// Connector for the transport selected by `config`.
pub fn connector(config: &Config) -> Result<Box<dyn Connector>> {
    Ok(match config.transport() {
        TransportMode::Tcp => Box::new(tcp::TlsConnector::new(config)?),
        TransportMode::Quic => Box::new(quic::QuicConnector::new(config)?),
    })
}

/// Acceptor bound to the configured address for the selected transport.
pub async fn acceptor(config: &Config) -> Result<Box<dyn Acceptor>> {
    Ok(match config.transport() {
        TransportMode::Tcp => Box::new(tcp::TlsListener::bind(config).await?),
        TransportMode::Quic => Box::new(quic::QuicListener::bind(config).await?),
    })
}

/// Resolves `host:port` to the first matching socket address.
pub(crate) async fn resolve(addr: &str) -> Result<std::net::SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| crate::Error::Connection(format!("cannot resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| crate::Error::Connection(format!("{} resolved to no address", addr)))
}
