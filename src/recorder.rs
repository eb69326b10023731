//! Transfer logs and achieved-rate measurement.
//!
//! Every chunk written or read becomes one [`LogRecord`], appended to the
//! stream's log file as a `timestamp_us<TAB>bytes` line. The
//! [`RateRecorder`] turns the same records into the per-stream summary.

use crate::config::{Mode, TransportMode};
use crate::{Error, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One observed transfer: when it happened and how many bytes moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_us: u64,
    pub bytes: u64,
}

impl LogRecord {
    pub fn new(timestamp_us: u64, bytes: u64) -> Self {
        Self {
            timestamp_us,
            bytes,
        }
    }

    /// Parses one `timestamp<TAB>bytes` log line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.trim_end().split('\t');
        let (ts, bytes) = match (fields.next(), fields.next(), fields.next()) {
            (Some(ts), Some(bytes), None) => (ts, bytes),
            _ => return Err(Error::Log(format!("malformed log line {:?}", line))),
        };
        let timestamp_us = ts
            .parse()
            .map_err(|_| Error::Log(format!("bad timestamp in {:?}", line)))?;
        let bytes = bytes
            .parse()
            .map_err(|_| Error::Log(format!("bad byte count in {:?}", line)))?;
        Ok(Self::new(timestamp_us, bytes))
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.timestamp_us, self.bytes)
    }
}

/// Log file path for one stream.
///
/// Session and stream numbers are 1-based in file names. TCP mode has a
/// single connection and a single file per side.
pub fn log_path(
    dir: &Path,
    mode: Mode,
    transport: TransportMode,
    session: usize,
    stream: usize,
) -> PathBuf {
    let side = match mode {
        Mode::Client => "Client",
        Mode::Server => "Server",
    };
    let name = match transport {
        TransportMode::Tcp => format!("log{}TCP.log", side),
        TransportMode::Quic => format!("log{}_{}_{}.log", side, session + 1, stream + 1),
    };
    dir.join(name)
}

/// Reads a whole log file back, for offline analysis.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
    let file = File::open(path.as_ref())?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(LogRecord::parse_line(&line)?);
    }
    Ok(records)
}

/// Append-only per-stream log.
///
/// Backed by a file when one could be opened; falls back to keeping the
/// records in memory when the file cannot be created or written, so a bad
/// log directory never aborts a transfer.
pub struct StreamLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    memory: Vec<LogRecord>,
}

impl StreamLog {
    /// Opens (truncating) the log file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| File::create(&path));

        match opened {
            Ok(file) => {
                debug!("Logging transfers to {}", path.display());
                Self {
                    path: Some(path),
                    writer: Some(BufWriter::new(file)),
                    memory: Vec::new(),
                }
            }
            Err(e) => {
                warn!(
                    "Cannot open log file {}: {}; keeping records in memory",
                    path.display(),
                    e
                );
                Self {
                    path: Some(path),
                    writer: None,
                    memory: Vec::new(),
                }
            }
        }
    }

    /// Log that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            writer: None,
            memory: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True when records are held in memory instead of a file.
    pub fn is_in_memory(&self) -> bool {
        self.writer.is_none()
    }

    pub fn append(&mut self, record: LogRecord) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writeln!(writer, "{}", record) {
                self.degrade(e);
            } else {
                return;
            }
        }
        self.memory.push(record);
    }

    /// Records held in memory (all of them for an in-memory log).
    pub fn records(&self) -> &[LogRecord] {
        &self.memory
    }

    /// Flushes buffered lines to disk.
    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                self.degrade(e);
            }
        }
    }

    fn degrade(&mut self, e: std::io::Error) {
        warn!(
            "Writing log file {} failed: {}; keeping further records in memory",
            self.path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            e
        );
        self.writer = None;
    }
}

impl Drop for StreamLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Measures achieved throughput from observed transfers.
///
/// The window starts either at an explicit instant (sender: the start of
/// shaping) or at the first non-empty record (receiver), and ends at the
/// last record or an explicit finish time.
#[derive(Debug, Clone, Default)]
pub struct RateRecorder {
    start_us: Option<u64>,
    end_us: Option<u64>,
    bytes: u64,
    chunks: u64,
}

impl RateRecorder {
    /// Window opened by the first non-empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Window opened at a known instant.
    pub fn starting_at(start_us: u64) -> Self {
        Self {
            start_us: Some(start_us),
            ..Self::default()
        }
    }

    pub fn record(&mut self, record: &LogRecord) {
        if record.bytes == 0 {
            return;
        }
        if self.start_us.is_none() {
            self.start_us = Some(record.timestamp_us);
        }
        self.end_us = Some(self.end_us.map_or(record.timestamp_us, |e| e.max(record.timestamp_us)));
        self.bytes += record.bytes;
        self.chunks += 1;
    }

    /// Closes the window at a known instant.
    pub fn finish_at(&mut self, end_us: u64) {
        self.end_us = Some(end_us);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn elapsed_micros(&self) -> u64 {
        match (self.start_us, self.end_us) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        }
    }

    /// Bits per microsecond, i.e. Mbps.
    pub fn mbps(&self) -> f64 {
        let elapsed = self.elapsed_micros();
        if elapsed > 0 {
            (self.bytes as f64 * 8.0) / elapsed as f64
        } else {
            0.0
        }
    }
}

/// Which side of the transfer a summary describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// Final figures for one completed stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub session: usize,
    pub stream: usize,
    pub direction: Direction,
    pub bytes: u64,
    pub target_bytes: u64,
    pub chunks: u64,
    /// Slots ticked by the shaper; zero on the receiving side
    pub slots: u64,
    pub elapsed: Duration,
    pub mbps: f64,
}

impl StreamSummary {
    pub fn from_recorder(
        session: usize,
        stream: usize,
        direction: Direction,
        target_bytes: u64,
        slots: u64,
        recorder: &RateRecorder,
    ) -> Self {
        Self {
            session,
            stream,
            direction,
            bytes: recorder.bytes(),
            target_bytes,
            chunks: recorder.chunks(),
            slots,
            elapsed: Duration::from_micros(recorder.elapsed_micros()),
            mbps: recorder.mbps(),
        }
    }
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.direction {
            Direction::Sent => "sent",
            Direction::Received => "received",
        };
        let (val, unit) = if self.bytes >= 1_000_000_000 {
            (self.bytes as f64 / 1_000_000_000.0, "GBytes")
        } else if self.bytes >= 1_000_000 {
            (self.bytes as f64 / 1_000_000.0, "MBytes")
        } else {
            (self.bytes as f64 / 1_000.0, "KBytes")
        };
        write!(
            f,
            "[{:2}/{:2}] {} {:7.2} {} in {:8.3} s at {:8.3} Mbits/sec",
            self.session + 1,
            self.stream + 1,
            verb,
            val,
            unit,
            self.elapsed.as_secs_f64(),
            self.mbps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        std::env::temp_dir().join(format!("streamload-{}-{}-{}", name, std::process::id(), nanos))
    }

    #[test]
    fn test_log_paths() {
        let dir = Path::new("tmp");
        assert_eq!(
            log_path(dir, Mode::Client, TransportMode::Quic, 0, 2),
            PathBuf::from("tmp/logClient_1_3.log")
        );
        assert_eq!(
            log_path(dir, Mode::Server, TransportMode::Quic, 1, 0),
            PathBuf::from("tmp/logServer_2_1.log")
        );
        assert_eq!(
            log_path(dir, Mode::Server, TransportMode::Tcp, 0, 0),
            PathBuf::from("tmp/logServerTCP.log")
        );
    }

    #[test]
    fn test_parse_line() {
        let rec = LogRecord::parse_line("1700000000123456\t1000\n").unwrap();
        assert_eq!(rec, LogRecord::new(1_700_000_000_123_456, 1000));
        assert!(LogRecord::parse_line("12 34").is_err());
        assert!(LogRecord::parse_line("12\tabc").is_err());
    }

    #[test]
    fn test_stream_log_file_roundtrip() {
        let dir = temp_dir("log");
        let path = dir.join("logClient_1_1.log");
        {
            let mut log = StreamLog::create(&path);
            assert!(!log.is_in_memory());
            log.append(LogRecord::new(10, 1000));
            log.append(LogRecord::new(20, 500));
        }
        let records = read_log(&path).unwrap();
        assert_eq!(records, vec![LogRecord::new(10, 1000), LogRecord::new(20, 500)]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stream_log_degrades_to_memory() {
        // A regular file where a directory is expected
        let blocker = temp_dir("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let mut log = StreamLog::create(blocker.join("sub").join("log.log"));
        assert!(log.is_in_memory());
        log.append(LogRecord::new(1, 10));
        assert_eq!(log.records(), &[LogRecord::new(1, 10)]);
        std::fs::remove_file(&blocker).ok();
    }

    #[test]
    fn test_receiver_window_from_first_to_last() {
        let mut rate = RateRecorder::new();
        rate.record(&LogRecord::new(500, 0));
        rate.record(&LogRecord::new(1_000, 1000));
        rate.record(&LogRecord::new(1_001_000, 999_000));
        assert_eq!(rate.bytes(), 1_000_000);
        assert_eq!(rate.chunks(), 2);
        assert_eq!(rate.elapsed_micros(), 1_000_000);
        assert_eq!(rate.mbps(), 8.0);
    }

    #[test]
    fn test_sender_window_explicit() {
        let mut rate = RateRecorder::starting_at(0);
        rate.record(&LogRecord::new(100_000, 100_000));
        rate.finish_at(1_000_000);
        assert_eq!(rate.mbps(), 0.8);
    }

    #[test]
    fn test_zero_elapsed_rate() {
        let rate = RateRecorder::new();
        assert_eq!(rate.mbps(), 0.0);
    }

    #[test]
    fn test_summary_line() {
        let mut rate = RateRecorder::starting_at(0);
        rate.record(&LogRecord::new(1_000_000, 1_000_000));
        let summary = StreamSummary::from_recorder(0, 1, Direction::Sent, 1_000_000, 10, &rate);
        let line = summary.to_string();
        assert!(line.contains("sent"));
        assert!(line.contains("1.00 MBytes"));
        assert!(line.contains("8.000 Mbits/sec"));
    }
}
