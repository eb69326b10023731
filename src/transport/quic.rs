//! QUIC transport on quinn. One connection per session, one
//! bidirectional stream per shaped stream.

use super::tls::{client_config, server_config, CertBundle};
use super::{resolve, Acceptor, BoxedSession, BoxedStream, Connector, Session};
use crate::{Config, Error, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::io;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const ALPN: &[u8] = b"streamload";

/// How long a client waits for the server to close a finished session.
const CLOSE_GRACE: Duration = Duration::from_secs(10);

const KEEP_ALIVE: Duration = Duration::from_secs(5);

fn conn_err(e: impl std::fmt::Display) -> Error {
    Error::Connection(e.to_string())
}

/// One bidirectional QUIC stream.
pub struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    finished: bool,
}

impl QuicStream {
    fn new((send, recv): (quinn::SendStream, quinn::RecvStream)) -> Self {
        Self {
            send,
            recv,
            finished: false,
        }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.send).poll_write(cx, data) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                e.to_string(),
            ))),
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.finished {
            self.finished = true;
            // Already closed means the goal is reached.
            let _ = self.send.finish();
        }
        Poll::Ready(Ok(()))
    }
}

/// A live QUIC connection.
pub struct QuicSession {
    connection: quinn::Connection,
    initiator: bool,
}

#[async_trait]
impl Session for QuicSession {
    async fn open_stream(&self) -> Result<BoxedStream> {
        let pair = self.connection.open_bi().await.map_err(conn_err)?;
        Ok(Box::new(QuicStream::new(pair)))
    }

    async fn accept_stream(&self) -> Result<BoxedStream> {
        let pair = self.connection.accept_bi().await.map_err(conn_err)?;
        Ok(Box::new(QuicStream::new(pair)))
    }

    async fn close(&self) {
        if self.initiator {
            // Closing now would discard data still in flight. The server
            // closes once it has read every stream to its target.
            if tokio::time::timeout(CLOSE_GRACE, self.connection.closed())
                .await
                .is_err()
            {
                debug!(
                    "Server at {} did not close within {:?}",
                    self.connection.remote_address(),
                    CLOSE_GRACE
                );
            }
        }
        self.connection.close(quinn::VarInt::from_u32(0), b"done");
    }
}

pub struct QuicConnector {
    client: quinn::ClientConfig,
    v4: Mutex<Option<quinn::Endpoint>>,
    v6: Mutex<Option<quinn::Endpoint>>,
    addr: String,
    server_name: String,
}

impl QuicConnector {
    pub fn new(config: &Config) -> Result<Self> {
        let tls = client_config(&[&rustls::version::TLS13], &[ALPN])?;
        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(conn_err)?;
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(KEEP_ALIVE));
        let mut client = quinn::ClientConfig::new(Arc::new(crypto));
        client.transport_config(Arc::new(transport));

        Ok(Self {
            client,
            v4: Mutex::new(None),
            v6: Mutex::new(None),
            addr: config.addr.clone(),
            server_name: config.server_name.clone(),
        })
    }

    /// Client endpoint whose socket family matches `remote`. Sessions to
    /// the same family share one UDP socket.
    fn endpoint_for(&self, remote: &SocketAddr) -> Result<quinn::Endpoint> {
        let (slot, bind): (_, SocketAddr) = if remote.is_ipv6() {
            (&self.v6, (Ipv6Addr::UNSPECIFIED, 0).into())
        } else {
            (&self.v4, (Ipv4Addr::UNSPECIFIED, 0).into())
        };
        let mut slot = slot.lock();
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.clone());
        }
        let mut endpoint = quinn::Endpoint::client(bind).map_err(conn_err)?;
        endpoint.set_default_client_config(self.client.clone());
        debug!("QUIC client endpoint bound to {}", endpoint.local_addr()?);
        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self) -> Result<BoxedSession> {
        let remote = resolve(&self.addr).await?;
        let connection = self
            .endpoint_for(&remote)?
            .connect(remote, &self.server_name)
            .map_err(conn_err)?
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", remote, e)))?;
        info!("QUIC session established with {}", remote);
        Ok(Box::new(QuicSession {
            connection,
            initiator: true,
        }))
    }
}

pub struct QuicListener {
    endpoint: quinn::Endpoint,
}

impl QuicListener {
    pub async fn bind(config: &Config) -> Result<Self> {
        let bundle = CertBundle::from_config(config)?;
        let tls = server_config(&bundle, &[&rustls::version::TLS13], &[ALPN])?;
        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).map_err(conn_err)?;

        let mut transport = quinn::TransportConfig::default();
        let streams = config.total_stream.max(1).min(u32::MAX as usize) as u32;
        transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(streams));
        let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server.transport_config(Arc::new(transport));

        let addr = resolve(&config.addr).await?;
        let endpoint = quinn::Endpoint::server(server, addr)
            .map_err(|e| Error::Connection(format!("bind {}: {}", addr, e)))?;
        info!("Listening for QUIC on {}", endpoint.local_addr()?);
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }
}

#[async_trait]
impl Acceptor for QuicListener {
    async fn accept(&self) -> Result<BoxedSession> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| Error::Connection("QUIC endpoint closed".to_string()))?;
        let connection = incoming.await.map_err(conn_err)?;
        debug!("QUIC session from {}", connection.remote_address());
        Ok(Box::new(QuicSession {
            connection,
            initiator: false,
        }))
    }
}
