//! Per-slot traffic shaping.
//!
//! Every arrival process is expressed in packets per slot. A rate `r` in
//! Mbps maps to `(r * 1e6 / 8) / pkt_size * slot_seconds` expected packets,
//! and all four processes use that same scaling:
//!
//! - `fixed`: exactly the expected count, no draw
//! - `poisson`: Poisson with λ equal to the expected count
//! - `LogNormal`: log-normal whose *mean* equals the expected count,
//!   i.e. μ = ln(expected) − σ²/2 with σ taken from `Variance`
//! - `uniform`: uniform between the slot-scaled `Min` and `Max` rates
//!
//! Draws are rounded to the nearest whole packet and never negative.

use crate::config::{Config, DistributionKind, DistributionSpec};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, LogNormal, Poisson, Uniform};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Expected packets per slot for a rate in Mbps.
pub fn expected_packets(rate_mbps: f64, pkt_size: usize, slot: Duration) -> f64 {
    if pkt_size == 0 {
        return 0.0;
    }
    ((rate_mbps * 1e6) / 8.0) / pkt_size as f64 * slot.as_secs_f64()
}

/// Slot-scaled count for `rate_mbps`, rejected when it overflows.
fn scaled(field: &str, rate_mbps: f64, pkt_size: usize, slot: Duration) -> Result<f64> {
    let packets = expected_packets(rate_mbps, pkt_size, slot);
    if packets.is_finite() {
        Ok(packets)
    } else {
        Err(Error::Config(format!(
            "{} of {} Mbps does not fit in a packet count per slot",
            field, rate_mbps
        )))
    }
}

/// A named source of per-slot packet counts.
pub trait Sampler: Send {
    /// Distribution type name as written in configuration files.
    fn name(&self) -> &'static str;

    /// Long-run mean packets per slot.
    fn mean(&self) -> f64;

    /// One raw (unrounded) draw.
    fn draw(&self, rng: &mut dyn RngCore) -> f64;
}

/// The four supported arrival processes, already scaled to one slot.
#[derive(Debug, Clone)]
pub enum ArrivalProcess {
    Fixed {
        packets: f64,
    },
    Poisson {
        lambda: f64,
        dist: Option<Poisson<f64>>,
    },
    LogNormal {
        mean: f64,
        sigma: f64,
        dist: Option<LogNormal<f64>>,
    },
    Uniform {
        low: f64,
        high: f64,
        dist: Uniform<f64>,
    },
}

impl ArrivalProcess {
    /// Builds the process for one stream.
    pub fn from_spec(spec: &DistributionSpec, pkt_size: usize, slot: Duration) -> Result<Self> {
        let kind = spec.validate()?;
        let process = match kind {
            DistributionKind::Fixed => ArrivalProcess::Fixed {
                packets: scaled("Rate", spec.rate, pkt_size, slot)?,
            },
            DistributionKind::Poisson => {
                let lambda = scaled("Rate", spec.rate, pkt_size, slot)?;
                // Poisson needs λ > 0; a zero rate never emits.
                let dist = if lambda > 0.0 {
                    Some(Poisson::new(lambda).map_err(|e| {
                        Error::Config(format!("poisson distribution: {}", e))
                    })?)
                } else {
                    None
                };
                ArrivalProcess::Poisson { lambda, dist }
            }
            DistributionKind::LogNormal => {
                let mean = scaled("Rate", spec.rate, pkt_size, slot)?;
                let sigma = spec.variance;
                let dist = if mean > 0.0 {
                    let mu = mean.ln() - sigma * sigma / 2.0;
                    Some(LogNormal::new(mu, sigma).map_err(|e| {
                        Error::Config(format!("LogNormal distribution: {}", e))
                    })?)
                } else {
                    None
                };
                ArrivalProcess::LogNormal { mean, sigma, dist }
            }
            DistributionKind::Uniform => {
                let low = scaled("Min", spec.min, pkt_size, slot)?;
                let high = scaled("Max", spec.max, pkt_size, slot)?;
                ArrivalProcess::Uniform {
                    low,
                    high,
                    dist: Uniform::new_inclusive(low, high),
                }
            }
        };
        Ok(process)
    }

    /// True when every draw rounds to zero packets, so a stream with bytes
    /// to send could never finish.
    pub fn never_emits(&self) -> bool {
        match self {
            ArrivalProcess::Fixed { packets } => packets.round() <= 0.0,
            ArrivalProcess::Poisson { lambda, .. } => *lambda <= 0.0,
            ArrivalProcess::LogNormal { mean, .. } => *mean <= 0.0,
            ArrivalProcess::Uniform { high, .. } => high.round() <= 0.0,
        }
    }

    pub fn kind(&self) -> DistributionKind {
        match self {
            ArrivalProcess::Fixed { .. } => DistributionKind::Fixed,
            ArrivalProcess::Poisson { .. } => DistributionKind::Poisson,
            ArrivalProcess::LogNormal { .. } => DistributionKind::LogNormal,
            ArrivalProcess::Uniform { .. } => DistributionKind::Uniform,
        }
    }
}

impl Sampler for ArrivalProcess {
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn mean(&self) -> f64 {
        match self {
            ArrivalProcess::Fixed { packets } => *packets,
            ArrivalProcess::Poisson { lambda, .. } => *lambda,
            ArrivalProcess::LogNormal { mean, .. } => *mean,
            ArrivalProcess::Uniform { low, high, .. } => (low + high) / 2.0,
        }
    }

    fn draw(&self, rng: &mut dyn RngCore) -> f64 {
        match self {
            ArrivalProcess::Fixed { packets } => *packets,
            ArrivalProcess::Poisson { dist, .. } => dist.as_ref().map_or(0.0, |d| d.sample(rng)),
            ArrivalProcess::LogNormal { dist, .. } => {
                dist.as_ref().map_or(0.0, |d| d.sample(rng))
            }
            ArrivalProcess::Uniform { dist, .. } => dist.sample(rng),
        }
    }
}

static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Seed from the high-resolution wall clock.
///
/// Mixed with a process-wide counter so streams sampling in the same
/// nanosecond still get distinct sequences.
fn time_seed() -> u64 {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default() as u64;
    let bump = SEED_COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos ^ bump.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

enum Seeding {
    /// Fresh generator per draw, seeded from the clock
    PerCall,
    /// One generator for the shaper's lifetime
    Fixed(StdRng),
}

/// Decides how many packets a stream may emit in the current slot.
///
/// # Examples
///
/// ```
/// use streamload::shaper::TrafficShaper;
/// use streamload::StreamSpec;
/// use std::time::Duration;
///
/// let spec = StreamSpec::fixed(1.0, 8.0);
/// let mut shaper = TrafficShaper::new(
///     spec.distribution.as_ref().unwrap(),
///     1000,
///     Duration::from_millis(100),
/// )
/// .unwrap();
///
/// // 8 Mbps in 1000-byte packets over 100 ms
/// assert_eq!(shaper.packets_for_slot(), 100);
/// assert_eq!(shaper.bytes_for_slot(30_000), 30_000);
/// ```
pub struct TrafficShaper {
    process: Box<dyn Sampler>,
    pkt_size: usize,
    seeding: Seeding,
}

impl TrafficShaper {
    pub fn new(spec: &DistributionSpec, pkt_size: usize, slot: Duration) -> Result<Self> {
        let process = ArrivalProcess::from_spec(spec, pkt_size, slot)?;
        Ok(Self::from_sampler(Box::new(process), pkt_size))
    }

    /// Wraps any sampler; used to plug in custom arrival processes.
    pub fn from_sampler(process: Box<dyn Sampler>, pkt_size: usize) -> Self {
        Self {
            process,
            pkt_size,
            seeding: Seeding::PerCall,
        }
    }

    /// Shaper for one stream of a client configuration.
    ///
    /// Honours the configured `Seed`, offset by stream index so that
    /// streams with identical parameters do not move in lockstep.
    pub fn for_stream(config: &Config, stream_index: usize) -> Result<Self> {
        let spec = config
            .stream(stream_index)
            .ok_or(Error::UnknownStream(stream_index))?;
        let dist = spec.distribution.as_ref().ok_or_else(|| {
            Error::Config(format!("InfoStream[{}]: missing Distribution", stream_index))
        })?;
        let shaper = Self::new(dist, config.pkt_size, config.slot_duration()?)?;
        Ok(match config.seed {
            Some(seed) => shaper.with_seed(seed.wrapping_add(stream_index as u64)),
            None => shaper,
        })
    }

    /// Switches to a single generator seeded once, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seeding = Seeding::Fixed(StdRng::seed_from_u64(seed));
        self
    }

    pub fn name(&self) -> &'static str {
        self.process.name()
    }

    pub fn expected_packets(&self) -> f64 {
        self.process.mean()
    }

    /// Samples the process for one slot.
    pub fn packets_for_slot(&mut self) -> u64 {
        let raw = match &mut self.seeding {
            Seeding::PerCall => {
                let mut rng = StdRng::seed_from_u64(time_seed());
                self.process.draw(&mut rng)
            }
            Seeding::Fixed(rng) => self.process.draw(rng),
        };
        if raw.is_finite() && raw > 0.0 {
            raw.round() as u64
        } else {
            0
        }
    }

    /// Bytes to emit this slot, clipped to what the stream still owes.
    pub fn bytes_for_slot(&mut self, remaining: u64) -> u64 {
        let packets = self.packets_for_slot();
        packets
            .saturating_mul(self.pkt_size as u64)
            .min(remaining)
    }
}
