use thiserror::Error;

/// Broad classes of failure, used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed configuration. Fatal, never retried.
    Config,
    /// Dial/accept/open failure. Retryable under a bounded policy.
    Establishment,
    /// Read/write failure in the middle of a transfer. Fails one stream.
    StreamIo,
    /// Log file failure. Degrades to a warning.
    Log,
    /// Run was cancelled from outside.
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown distribution type: {0:?}")]
    UnknownDistribution(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Stream {stream} I/O error: {source}")]
    StreamIo {
        stream: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream {stream} closed by peer after {received} of {target} bytes")]
    PeerClosed {
        stream: usize,
        received: u64,
        target: u64,
    },

    #[error("Stream {stream} timed out after {millis} ms")]
    Timeout { stream: usize, millis: u64 },

    #[error("Log file error: {0}")]
    Log(String),

    #[error("No credit counter for stream index {0}")]
    UnknownStream(usize),

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Json(_)
            | Error::Config(_)
            | Error::UnknownDistribution(_)
            | Error::UnknownStream(_) => ErrorKind::Config,
            Error::Io(_) | Error::Connection(_) | Error::Tls(_) => ErrorKind::Establishment,
            Error::StreamIo { .. }
            | Error::PeerClosed { .. }
            | Error::Timeout { .. }
            | Error::Join(_) => ErrorKind::StreamIo,
            Error::Log(_) => ErrorKind::Log,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only establishment failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Establishment
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_not_retryable() {
        let err = Error::UnknownDistribution("zipf".to_string());
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        let err = Error::Connection("connection refused".to_string());
        assert!(err.is_retryable());

        let io = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(io.is_retryable());
    }

    #[test]
    fn test_stream_errors_stay_local() {
        let err = Error::PeerClosed {
            stream: 2,
            received: 10,
            target: 100,
        };
        assert_eq!(err.kind(), ErrorKind::StreamIo);
        assert!(!err.is_retryable());
    }
}
