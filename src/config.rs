use crate::shaper::ArrivalProcess;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Transport used to carry the shaped streams.
///
/// Selected by the `TCP` flag of the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    /// One TLS connection over TCP carrying a single stream
    Tcp,
    /// QUIC sessions, each multiplexing several streams
    Quic,
}

/// Which side of the experiment a configuration is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Accepts sessions and measures received streams
    Server,
    /// Opens sessions and sends shaped streams
    Client,
}

/// Arrival process selected by the `Type` field of a distribution block.
///
/// The names are matched exactly as they appear in configuration files:
/// `fixed`, `poisson`, `LogNormal` and `uniform`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionKind {
    Fixed,
    Poisson,
    LogNormal,
    Uniform,
}

impl DistributionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionKind::Fixed => "fixed",
            DistributionKind::Poisson => "poisson",
            DistributionKind::LogNormal => "LogNormal",
            DistributionKind::Uniform => "uniform",
        }
    }
}

impl FromStr for DistributionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(DistributionKind::Fixed),
            "poisson" => Ok(DistributionKind::Poisson),
            "LogNormal" => Ok(DistributionKind::LogNormal),
            "uniform" => Ok(DistributionKind::Uniform),
            other => Err(Error::UnknownDistribution(other.to_string())),
        }
    }
}

impl fmt::Display for DistributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one stream's arrival process.
///
/// Rates are in Mbps. `Variance` is the log-normal shape parameter; `Min`
/// and `Max` bound the uniform process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DistributionSpec {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub variance: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

impl DistributionSpec {
    pub fn new(kind: DistributionKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            rate: 0.0,
            variance: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    /// Parses the `Type` field.
    pub fn kind(&self) -> Result<DistributionKind> {
        self.kind.parse()
    }

    /// Checks that the parameters make sense for the declared type.
    pub fn validate(&self) -> Result<DistributionKind> {
        let kind = self.kind()?;
        let finite_non_negative = |name: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "{} distribution: {} must be a non-negative number, got {}",
                    kind, name, v
                )))
            }
        };

        match kind {
            DistributionKind::Fixed | DistributionKind::Poisson => {
                finite_non_negative("Rate", self.rate)?;
            }
            DistributionKind::LogNormal => {
                finite_non_negative("Rate", self.rate)?;
                finite_non_negative("Variance", self.variance)?;
            }
            DistributionKind::Uniform => {
                finite_non_negative("Min", self.min)?;
                finite_non_negative("Max", self.max)?;
                if self.min > self.max {
                    return Err(Error::Config(format!(
                        "uniform distribution: Min ({}) is greater than Max ({})",
                        self.min, self.max
                    )));
                }
            }
        }

        Ok(kind)
    }
}

/// Target size and arrival process of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamSpec {
    /// Payload to transfer, in megabytes (10^6 bytes)
    pub file_size: f64,

    /// Arrival process; only read by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<DistributionSpec>,
}

impl StreamSpec {
    /// A stream entry with no arrival process, as the server reads it.
    pub fn receive_only(file_size_mb: f64) -> Self {
        Self {
            file_size: file_size_mb,
            distribution: None,
        }
    }

    pub fn fixed(file_size_mb: f64, rate_mbps: f64) -> Self {
        let mut dist = DistributionSpec::new(DistributionKind::Fixed);
        dist.rate = rate_mbps;
        Self::with_distribution(file_size_mb, dist)
    }

    pub fn poisson(file_size_mb: f64, rate_mbps: f64) -> Self {
        let mut dist = DistributionSpec::new(DistributionKind::Poisson);
        dist.rate = rate_mbps;
        Self::with_distribution(file_size_mb, dist)
    }

    pub fn log_normal(file_size_mb: f64, rate_mbps: f64, sigma: f64) -> Self {
        let mut dist = DistributionSpec::new(DistributionKind::LogNormal);
        dist.rate = rate_mbps;
        dist.variance = sigma;
        Self::with_distribution(file_size_mb, dist)
    }

    pub fn uniform(file_size_mb: f64, min_mbps: f64, max_mbps: f64) -> Self {
        let mut dist = DistributionSpec::new(DistributionKind::Uniform);
        dist.min = min_mbps;
        dist.max = max_mbps;
        Self::with_distribution(file_size_mb, dist)
    }

    pub fn with_distribution(file_size_mb: f64, distribution: DistributionSpec) -> Self {
        Self {
            file_size: file_size_mb,
            distribution: Some(distribution),
        }
    }

    /// Target payload in bytes.
    pub fn target_bytes(&self) -> u64 {
        (self.file_size * 1e6).round().max(0.0) as u64
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_backoff_ms() -> u64 {
    200
}

fn default_drain_poll_ms() -> u64 {
    100
}

/// Experiment configuration shared by client and server.
///
/// Loaded once from a JSON file with PascalCase field names (`Addr`,
/// `PktSize`, `TotalSession`, ...) and read-only afterwards.
/// The builder methods exist for programmatic use and tests.
///
/// # Examples
///
/// ```
/// use streamload::{Config, StreamSpec};
/// use std::time::Duration;
///
/// let config = Config::new("127.0.0.1:4242")
///     .with_packet_size(1000)
///     .with_time_slot(Duration::from_millis(100))
///     .with_stream(StreamSpec::fixed(1.0, 8.0));
///
/// assert_eq!(config.total_stream, 1);
/// assert_eq!(config.target_bytes(0), Some(1_000_000));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Transport endpoint, `host:port`
    pub addr: String,

    /// Chunk size for every write and read, in bytes
    pub pkt_size: usize,

    /// Number of sessions to open (client) or accept (server)
    pub total_session: usize,

    /// Number of streams per session
    pub total_stream: usize,

    /// Slot duration in milliseconds (client only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_slot: Option<u64>,

    /// TLS over TCP instead of QUIC
    #[serde(rename = "TCP", default)]
    pub tcp: bool,

    /// Per-stream targets, indexed by stream number
    pub info_stream: Vec<StreamSpec>,

    /// Directory receiving the per-stream log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// PEM certificate chain for the TCP/TLS server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    /// PEM private key for the TCP/TLS server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// TLS server name presented by the client
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Deadline for a single transport read or write, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_timeout_ms: Option<u64>,

    /// Attempts allowed to establish a session
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Initial backoff between establishment attempts, in milliseconds
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// Poll period while waiting for queued credit to drain, in milliseconds
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,

    /// Fixed seed for the shapers; time-seeded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Config {
    /// Creates a single-session configuration with no streams yet.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            pkt_size: 1000,
            total_session: 1,
            total_stream: 0,
            time_slot: None,
            tcp: false,
            info_stream: Vec::new(),
            log_dir: default_log_dir(),
            cert_file: None,
            key_file: None,
            server_name: default_server_name(),
            io_timeout_ms: None,
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            drain_poll_ms: default_drain_poll_ms(),
            seed: None,
        }
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// The result is not validated; call [`Config::validate`] for the role
    /// the process plays.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parses a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_packet_size(mut self, pkt_size: usize) -> Self {
        self.pkt_size = pkt_size;
        self
    }

    pub fn with_sessions(mut self, sessions: usize) -> Self {
        self.total_session = sessions;
        self
    }

    pub fn with_time_slot(mut self, slot: Duration) -> Self {
        self.time_slot = Some(slot.as_millis() as u64);
        self
    }

    pub fn with_tcp(mut self, tcp: bool) -> Self {
        self.tcp = tcp;
        self
    }

    /// Appends a stream and bumps `TotalStream` to match.
    pub fn with_stream(mut self, spec: StreamSpec) -> Self {
        self.info_stream.push(spec);
        self.total_stream = self.info_stream.len();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn transport(&self) -> TransportMode {
        if self.tcp {
            TransportMode::Tcp
        } else {
            TransportMode::Quic
        }
    }

    /// Slot duration; only meaningful for the client.
    pub fn slot_duration(&self) -> Result<Duration> {
        match self.time_slot {
            Some(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(Error::Config(
                "TimeSlot must be a positive number of milliseconds".to_string(),
            )),
        }
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms.max(1))
    }

    pub fn stream(&self, index: usize) -> Option<&StreamSpec> {
        self.info_stream.get(index)
    }

    pub fn target_bytes(&self, index: usize) -> Option<u64> {
        self.stream(index).map(StreamSpec::target_bytes)
    }

    /// Number of streams each session actually carries.
    ///
    /// TCP mode carries exactly one stream regardless of `TotalStream`.
    pub fn streams_per_session(&self) -> usize {
        match self.transport() {
            TransportMode::Tcp => 1,
            TransportMode::Quic => self.total_stream,
        }
    }

    /// Number of sessions actually established.
    pub fn sessions(&self) -> usize {
        match self.transport() {
            TransportMode::Tcp => 1,
            TransportMode::Quic => self.total_session,
        }
    }

    /// Rejects configurations that cannot run in the given role.
    pub fn validate(&self, mode: Mode) -> Result<()> {
        if self.addr.trim().is_empty() {
            return Err(Error::Config("Addr must not be empty".to_string()));
        }
        if self.pkt_size == 0 {
            return Err(Error::Config("PktSize must be greater than zero".to_string()));
        }
        if self.total_session == 0 {
            return Err(Error::Config(
                "TotalSession must be greater than zero".to_string(),
            ));
        }
        if self.total_stream == 0 {
            return Err(Error::Config(
                "TotalStream must be greater than zero".to_string(),
            ));
        }
        if self.info_stream.len() < self.streams_per_session() {
            return Err(Error::Config(format!(
                "InfoStream has {} entries but {} streams are configured",
                self.info_stream.len(),
                self.streams_per_session()
            )));
        }
        for (i, spec) in self.info_stream.iter().enumerate() {
            if !spec.file_size.is_finite() || spec.file_size < 0.0 {
                return Err(Error::Config(format!(
                    "InfoStream[{}]: FileSize must be a non-negative number",
                    i
                )));
            }
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(Error::Config(
                "CertFile and KeyFile must be given together".to_string(),
            ));
        }

        if mode == Mode::Client {
            let slot = self.slot_duration()?;
            for (i, spec) in self
                .info_stream
                .iter()
                .take(self.streams_per_session())
                .enumerate()
            {
                let dist = spec.distribution.as_ref().ok_or_else(|| {
                    Error::Config(format!("InfoStream[{}]: missing Distribution", i))
                })?;
                let process = ArrivalProcess::from_spec(dist, self.pkt_size, slot)?;
                if spec.target_bytes() > 0 && process.never_emits() {
                    return Err(Error::Config(format!(
                        "InfoStream[{}]: {} rate rounds to zero {}-byte packets per {} ms slot",
                        i,
                        process.kind().as_str(),
                        self.pkt_size,
                        slot.as_millis()
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_JSON: &str = r#"{
        "Addr": "localhost:4242",
        "PktSize": 1000,
        "TotalSession": 2,
        "TotalStream": 2,
        "TimeSlot": 100,
        "TCP": false,
        "InfoStream": [
            { "FileSize": 1, "Distribution": { "Type": "fixed", "Rate": 8 } },
            { "FileSize": 0.5, "Distribution": { "Type": "LogNormal", "Rate": 4, "Variance": 0.3 } }
        ]
    }"#;

    #[test]
    fn test_parse_client_file_format() {
        let config = Config::from_json(CLIENT_JSON).unwrap();
        assert_eq!(config.addr, "localhost:4242");
        assert_eq!(config.pkt_size, 1000);
        assert_eq!(config.total_session, 2);
        assert_eq!(config.time_slot, Some(100));
        assert_eq!(config.transport(), TransportMode::Quic);
        assert_eq!(config.target_bytes(1), Some(500_000));
        assert_eq!(config.log_dir, PathBuf::from("tmp"));
        assert_eq!(config.connect_attempts, 5);

        let dist = config.info_stream[1].distribution.as_ref().unwrap();
        assert_eq!(dist.kind().unwrap(), DistributionKind::LogNormal);
        assert_eq!(dist.variance, 0.3);

        config.validate(Mode::Client).unwrap();
    }

    #[test]
    fn test_server_config_needs_no_distribution() {
        let json = r#"{
            "Addr": "0.0.0.0:4242",
            "PktSize": 1000,
            "TotalSession": 1,
            "TotalStream": 1,
            "TCP": true,
            "InfoStream": [ { "FileSize": 2 } ]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.transport(), TransportMode::Tcp);
        config.validate(Mode::Server).unwrap();
        assert!(config.validate(Mode::Client).is_err());
    }

    #[test]
    fn test_unknown_distribution_is_rejected() {
        let config = Config::new("127.0.0.1:1")
            .with_time_slot(Duration::from_millis(10))
            .with_stream(StreamSpec::with_distribution(
                1.0,
                DistributionSpec {
                    kind: "zipf".to_string(),
                    rate: 1.0,
                    variance: 0.0,
                    min: 0.0,
                    max: 0.0,
                },
            ));

        match config.validate(Mode::Client) {
            Err(Error::UnknownDistribution(name)) => assert_eq!(name, "zipf"),
            other => panic!("expected unknown distribution error, got {:?}", other),
        }
    }

    #[test]
    fn test_distribution_names_are_case_sensitive() {
        assert!("Poisson".parse::<DistributionKind>().is_err());
        assert!("lognormal".parse::<DistributionKind>().is_err());
        assert_eq!(
            "LogNormal".parse::<DistributionKind>().unwrap(),
            DistributionKind::LogNormal
        );
    }

    #[test]
    fn test_uniform_bounds_are_checked() {
        let spec = StreamSpec::uniform(1.0, 10.0, 2.0);
        let err = spec.distribution.unwrap().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rates_below_half_a_packet_are_rejected() {
        // 0.03 Mbps is 0.375 packets of 1000 B per 100 ms slot
        let config = Config::new("127.0.0.1:1")
            .with_packet_size(1000)
            .with_time_slot(Duration::from_millis(100))
            .with_stream(StreamSpec::fixed(1.0, 0.03));
        match config.validate(Mode::Client) {
            Err(Error::Config(msg)) => assert!(msg.contains("InfoStream[0]"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
        assert!(config.validate(Mode::Server).is_ok());

        // Same rate over a longer slot rounds up to one packet
        let longer = config.clone().with_time_slot(Duration::from_millis(200));
        longer.validate(Mode::Client).unwrap();

        let zero_poisson = Config::new("127.0.0.1:1")
            .with_time_slot(Duration::from_millis(100))
            .with_stream(StreamSpec::poisson(1.0, 0.0));
        assert!(zero_poisson.validate(Mode::Client).is_err());

        let low_uniform = Config::new("127.0.0.1:1")
            .with_packet_size(1000)
            .with_time_slot(Duration::from_millis(100))
            .with_stream(StreamSpec::uniform(1.0, 0.0, 0.03));
        assert!(low_uniform.validate(Mode::Client).is_err());

        // Nothing to send is fine at any rate
        let empty = Config::new("127.0.0.1:1")
            .with_time_slot(Duration::from_millis(100))
            .with_stream(StreamSpec::fixed(0.0, 0.0));
        empty.validate(Mode::Client).unwrap();
    }

    #[test]
    fn test_missing_slot_rejected_for_client() {
        let config = Config::new("127.0.0.1:1").with_stream(StreamSpec::fixed(1.0, 8.0));
        assert!(config.validate(Mode::Client).is_err());
        assert!(config.validate(Mode::Server).is_ok());
    }

    #[test]
    fn test_too_few_stream_entries() {
        let mut config = Config::new("127.0.0.1:1")
            .with_time_slot(Duration::from_millis(10))
            .with_stream(StreamSpec::fixed(1.0, 8.0));
        config.total_stream = 3;
        assert!(config.validate(Mode::Client).is_err());

        // TCP mode only ever uses stream 0
        config.tcp = true;
        assert!(config.validate(Mode::Client).is_ok());
        assert_eq!(config.streams_per_session(), 1);
    }

    #[test]
    fn test_target_bytes_rounding() {
        assert_eq!(StreamSpec::fixed(1.5, 1.0).target_bytes(), 1_500_000);
        assert_eq!(StreamSpec::fixed(0.000002, 1.0).target_bytes(), 2);
        assert_eq!(StreamSpec::receive_only(0.0).target_bytes(), 0);
    }
}
