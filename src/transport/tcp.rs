//! TLS over TCP. One connection carries exactly one stream.

use super::tls::{client_config, server_config, CertBundle};
use super::{resolve, Acceptor, BoxedSession, BoxedStream, Connector, Session};
use crate::{Config, Error, Result};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Session wrapping a single TLS connection.
///
/// The connection itself is the session's only stream; asking for a
/// second one is an error.
pub struct TlsSession {
    stream: Mutex<Option<BoxedStream>>,
}

impl TlsSession {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }

    fn take(&self) -> Result<BoxedStream> {
        self.stream.lock().take().ok_or_else(|| {
            Error::Connection("a TLS session carries a single stream".to_string())
        })
    }
}

#[async_trait]
impl Session for TlsSession {
    async fn open_stream(&self) -> Result<BoxedStream> {
        self.take()
    }

    async fn accept_stream(&self) -> Result<BoxedStream> {
        self.take()
    }

    async fn close(&self) {
        // The stream owner shuts the connection down; drop anything unclaimed.
        self.stream.lock().take();
    }
}

pub struct TlsConnector {
    addr: String,
    server_name: ServerName<'static>,
    connector: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(config: &Config) -> Result<Self> {
        let tls = client_config(rustls::ALL_VERSIONS, &[])?;
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|e| Error::Config(format!("ServerName {:?}: {}", config.server_name, e)))?;
        Ok(Self {
            addr: config.addr.clone(),
            server_name,
            connector: tokio_rustls::TlsConnector::from(Arc::new(tls)),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedSession> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", self.addr, e)))?;
        tcp.set_nodelay(true)?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        info!("Connected to {} over TLS/TCP", self.addr);
        Ok(Box::new(TlsSession::new(Box::new(tls))))
    }
}

pub struct TlsListener {
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsListener {
    pub async fn bind(config: &Config) -> Result<Self> {
        let bundle = CertBundle::from_config(config)?;
        let tls = server_config(&bundle, rustls::ALL_VERSIONS, &[])?;
        let addr = resolve(&config.addr).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connection(format!("bind {}: {}", addr, e)))?;
        info!("Listening for TLS/TCP on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(tls)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Acceptor for TlsListener {
    async fn accept(&self) -> Result<BoxedSession> {
        let (tcp, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::Connection(format!("accept: {}", e)))?;
        tcp.set_nodelay(true)?;
        let tls = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| Error::Tls(format!("handshake with {}: {}", peer, e)))?;
        debug!("TLS session from {}", peer);
        Ok(Box::new(TlsSession::new(Box::new(tls))))
    }
}
