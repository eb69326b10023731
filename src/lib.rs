//! streamload - shaped multi-session, multi-stream network load generator
//!
//! A client opens one or more sessions over QUIC (or a single TLS/TCP
//! connection), each carrying several concurrent streams. Every stream
//! delivers a fixed payload while its offered rate follows a statistical
//! arrival process (fixed, Poisson, log-normal or uniform) evaluated once
//! per time slot. A server mirrors the client and measures what actually
//! arrived. Both sides write a `timestamp<TAB>bytes` line per chunk so
//! offered and achieved load can be compared offline.
//!
//! # Features
//!
//! - Per-slot traffic shaping with four arrival processes
//! - Byte-credit accounting between the shaper and the transport writer
//! - QUIC (quinn), TLS over TCP (tokio-rustls) and in-memory transports
//! - Per-stream failure isolation with a run report
//! - Injectable clocks and tickers for deterministic tests

pub mod client;
pub mod clock;
pub mod config;
pub mod credit;
mod deadline;
pub mod error;
mod fanout;
pub mod flusher;
pub mod receiver;
pub mod recorder;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod shaper;
pub mod transport;

pub use client::Client;
pub use config::{Config, DistributionKind, DistributionSpec, Mode, StreamSpec, TransportMode};
pub use error::{Error, ErrorKind, Result};
pub use recorder::{LogRecord, StreamSummary};
pub use reporter::{ProgressCallback, ProgressEvent, RunReport};
pub use retry::RetryPolicy;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
