//! Timed waveforms and their hardware constraints.
//!
//! A [`Waveform`] is an ordered list of `(value, dwell)` points that has
//! passed validation:
//!
//! - `1 ..= MAX_TOTAL_POINTS` points
//! - every dwell within `MIN_DWELL ..= MAX_DWELL`
//! - every value finite
//!
//! Once built it is never mutated; uploads borrow it as a sequence of
//! [`Chunk`]s. Nothing in this module performs I/O.

pub mod generator;

pub use generator::{generate, Shape, Timing};

use crate::limits::{MAX_CHUNK_POINTS, MAX_DWELL, MAX_TOTAL_POINTS, MIN_DWELL};
use std::time::Duration;
use thiserror::Error;

/// One list step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformPoint {
    /// Output setpoint (volts or amps, depending on list mode).
    pub value: f64,
    /// How long the value is held.
    pub dwell: Duration,
}

impl WaveformPoint {
    /// Create a point.
    #[must_use]
    pub fn new(value: f64, dwell: Duration) -> Self {
        Self { value, dwell }
    }
}

/// A waveform violates a device constraint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// No points at all.
    #[error("Waveform has no points")]
    EmptyWaveform,

    /// More points than the device can hold.
    #[error("Waveform has {count} points, the device holds at most {max}")]
    TooManyPoints {
        /// Points supplied
        count: usize,
        /// Ceiling
        max: usize,
    },

    /// Dwell below the list engine minimum.
    #[error("Point {index}: dwell {dwell:?} is below the {:?} minimum", MIN_DWELL)]
    DwellTooShort {
        /// Zero-based point index
        index: usize,
        /// Offending dwell
        dwell: Duration,
    },

    /// Dwell above the list engine maximum.
    #[error("Point {index}: dwell {dwell:?} exceeds the {:?} maximum", MAX_DWELL)]
    DwellTooLong {
        /// Zero-based point index
        index: usize,
        /// Offending dwell
        dwell: Duration,
    },

    /// NaN or infinite value, which cannot be written as a list value.
    #[error("Point {index}: value is not finite")]
    NonFiniteValue {
        /// Zero-based point index
        index: usize,
    },

    /// Per-point dwell list does not line up with the values.
    #[error("{values} values but {dwells} dwell times")]
    DwellCountMismatch {
        /// Number of values
        values: usize,
        /// Number of dwell times
        dwells: usize,
    },

    /// Generator frequency is zero, negative, or not finite.
    #[error("Frequency must be a positive finite number, got {0}")]
    InvalidFrequency(f64),
}

/// A validated, immutable waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    points: Vec<WaveformPoint>,
}

/// Validate points into a [`Waveform`].
///
/// # Errors
/// The first constraint violated, checked in order: empty, too many points,
/// then per point (value, then dwell).
pub fn validate(points: Vec<WaveformPoint>) -> Result<Waveform, ValidationError> {
    if points.is_empty() {
        return Err(ValidationError::EmptyWaveform);
    }
    if points.len() > MAX_TOTAL_POINTS {
        return Err(ValidationError::TooManyPoints {
            count: points.len(),
            max: MAX_TOTAL_POINTS,
        });
    }
    for (index, point) in points.iter().enumerate() {
        if !point.value.is_finite() {
            return Err(ValidationError::NonFiniteValue { index });
        }
        if point.dwell < MIN_DWELL {
            return Err(ValidationError::DwellTooShort {
                index,
                dwell: point.dwell,
            });
        }
        if point.dwell > MAX_DWELL {
            return Err(ValidationError::DwellTooLong {
                index,
                dwell: point.dwell,
            });
        }
    }
    Ok(Waveform { points })
}

/// How dwell times are assigned to imported samples.
#[derive(Debug, Clone, PartialEq)]
pub enum DwellPolicy {
    /// Same dwell for every point.
    Uniform(Duration),
    /// One dwell per sample, in sample order.
    PerPoint(Vec<Duration>),
}

/// Outcome of importing external samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleImport {
    /// The validated waveform.
    pub waveform: Waveform,
    /// True when samples beyond `MAX_TOTAL_POINTS` were dropped.
    pub truncated: bool,
    /// Sample count before truncation.
    pub original_len: usize,
}

/// Build a waveform from a flat sample sequence.
///
/// Samples beyond `MAX_TOTAL_POINTS` are dropped and the result says so.
/// Truncation happens before chunking, so a 4500-sample import always
/// yields exactly 4000 points.
///
/// # Errors
/// `DwellCountMismatch` when a per-point policy does not match the sample
/// count; otherwise any [`validate`] error.
pub fn from_samples(values: &[f64], policy: DwellPolicy) -> Result<SampleImport, ValidationError> {
    let original_len = values.len();
    let kept = original_len.min(MAX_TOTAL_POINTS);
    let truncated = kept < original_len;

    let points: Vec<WaveformPoint> = match policy {
        DwellPolicy::Uniform(dwell) => values[..kept]
            .iter()
            .map(|&v| WaveformPoint::new(v, dwell))
            .collect(),
        DwellPolicy::PerPoint(dwells) => {
            if dwells.len() != original_len {
                return Err(ValidationError::DwellCountMismatch {
                    values: original_len,
                    dwells: dwells.len(),
                });
            }
            values[..kept]
                .iter()
                .zip(dwells)
                .map(|(&v, d)| WaveformPoint::new(v, d))
                .collect()
        }
    };

    if truncated {
        tracing::warn!(
            original = original_len,
            kept,
            "Sample set exceeds device capacity, truncated"
        );
    }

    Ok(SampleImport {
        waveform: validate(points)?,
        truncated,
        original_len,
    })
}

impl Waveform {
    /// Validate points into a waveform. Same as [`validate`].
    ///
    /// # Errors
    /// See [`validate`].
    pub fn new(points: Vec<WaveformPoint>) -> Result<Self, ValidationError> {
        validate(points)
    }

    /// Generate one period of `shape` at `frequency_hz`.
    ///
    /// The point count may be reduced to respect the minimum dwell; the
    /// returned [`Timing`] reports what was actually used.
    ///
    /// # Errors
    /// `InvalidFrequency`, or a validation error if the timing cannot be
    /// met at all.
    pub fn periodic(
        shape: Shape,
        frequency_hz: f64,
        points: usize,
        amplitude: f64,
        offset: f64,
    ) -> Result<(Self, Timing), ValidationError> {
        let timing = Timing::for_frequency(frequency_hz, points)?;
        let values = generate(shape, timing.points, amplitude, offset);
        let waveform = validate(
            values
                .into_iter()
                .map(|v| WaveformPoint::new(v, timing.dwell))
                .collect(),
        )?;
        Ok((waveform, timing))
    }

    /// All points in playback order.
    pub fn points(&self) -> &[WaveformPoint] {
        &self.points
    }

    /// Number of points (always at least one).
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; present for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Setpoint values in playback order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.value)
    }

    /// The shared dwell, if every point uses the same one.
    #[must_use]
    pub fn uniform_dwell(&self) -> Option<Duration> {
        uniform_dwell(&self.points)
    }

    /// Sum of all dwells: the time one pass takes on the device.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.points.iter().map(|p| p.dwell).sum()
    }

    /// Split into device-sized chunks, in order.
    ///
    /// `max_chunk_size` is clamped to `1 ..= MAX_CHUNK_POINTS`. The last
    /// chunk may be shorter.
    #[must_use]
    pub fn chunk(&self, max_chunk_size: usize) -> Vec<Chunk<'_>> {
        let size = max_chunk_size.clamp(1, MAX_CHUNK_POINTS);
        self.points
            .chunks(size)
            .enumerate()
            .map(|(index, points)| Chunk {
                index,
                offset: index * size,
                points,
            })
            .collect()
    }

    /// Consume the waveform, returning its points.
    #[must_use]
    pub fn into_points(self) -> Vec<WaveformPoint> {
        self.points
    }
}

/// A contiguous slice of a waveform, uploaded as one device list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chunk<'a> {
    /// Zero-based position among the waveform's chunks.
    pub index: usize,
    /// Index of the first point within the waveform.
    pub offset: usize,
    /// The points.
    pub points: &'a [WaveformPoint],
}

impl<'a> Chunk<'a> {
    /// One-based position, as used in logs and errors.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.index + 1
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True for a chunk without points (never produced by `chunk`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Setpoint values in order.
    pub fn values(&self) -> impl Iterator<Item = f64> + 'a {
        self.points.iter().map(|p| p.value)
    }

    /// Dwell times in order.
    pub fn dwells(&self) -> impl Iterator<Item = Duration> + 'a {
        self.points.iter().map(|p| p.dwell)
    }

    /// The shared dwell, if uniform within this chunk.
    #[must_use]
    pub fn uniform_dwell(&self) -> Option<Duration> {
        uniform_dwell(self.points)
    }

    /// Time one pass over this chunk takes.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.points.iter().map(|p| p.dwell).sum()
    }
}

fn uniform_dwell(points: &[WaveformPoint]) -> Option<Duration> {
    let first = points.first()?.dwell;
    points.iter().all(|p| p.dwell == first).then_some(first)
}
