//! Periodic waveform generation and dwell timing.

use super::ValidationError;
use crate::limits::{MAX_DWELL, MIN_DWELL};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Built-in waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// One sine period starting at the offset.
    Sine,
    /// High for the first half, low for the second.
    Square,
    /// Rises from the low peak to the high peak and back.
    Triangle,
    /// Linear ramp from the low peak to the high peak.
    Sawtooth,
    /// Constant at the offset.
    Dc,
}

impl Shape {
    /// All shapes, for help text and iteration.
    pub const ALL: [Shape; 5] = [
        Shape::Sine,
        Shape::Square,
        Shape::Triangle,
        Shape::Sawtooth,
        Shape::Dc,
    ];
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shape::Sine => "sine",
            Shape::Square => "square",
            Shape::Triangle => "triangle",
            Shape::Sawtooth => "sawtooth",
            Shape::Dc => "dc",
        };
        f.write_str(name)
    }
}

impl FromStr for Shape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Shape::ALL
            .into_iter()
            .find(|shape| shape.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown shape '{}'", s))
    }
}

/// Sample `points` values of one period of `shape`.
#[must_use]
pub fn generate(shape: Shape, points: usize, amplitude: f64, offset: f64) -> Vec<f64> {
    let n = points;
    match shape {
        Shape::Sine => (0..n)
            .map(|i| offset + amplitude * (2.0 * PI * i as f64 / n as f64).sin())
            .collect(),
        Shape::Square => (0..n)
            .map(|i| {
                if (i as f64) < n as f64 / 2.0 {
                    offset + amplitude
                } else {
                    offset - amplitude
                }
            })
            .collect(),
        Shape::Triangle => {
            let half = (n / 2).max(1);
            let slope = 2.0 * amplitude / half as f64;
            (0..n)
                .map(|i| {
                    if i <= half {
                        offset - amplitude + slope * i as f64
                    } else {
                        offset + amplitude - slope * (i - half) as f64
                    }
                })
                .collect()
        }
        Shape::Sawtooth => {
            let step = 2.0 * amplitude / n.saturating_sub(1).max(1) as f64;
            (0..n)
                .map(|i| offset - amplitude + step * i as f64)
                .collect()
        }
        Shape::Dc => vec![offset; n],
    }
}

/// Point count and dwell chosen for a target frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    /// Points actually used (may be fewer than requested).
    pub points: usize,
    /// Dwell per point.
    pub dwell: Duration,
    /// Frequency the device will actually produce.
    pub actual_frequency: f64,
    /// Adjustments made, in human-readable form.
    pub warnings: Vec<String>,
}

impl Timing {
    /// Fit `points` samples into one period of `frequency_hz`.
    ///
    /// If the resulting dwell is below the minimum, the point count drops to
    /// `max(2, period / MIN_DWELL)`. A dwell above the maximum is clamped,
    /// lowering the frequency.
    ///
    /// # Errors
    /// `InvalidFrequency` for a non-positive or non-finite frequency,
    /// `EmptyWaveform` for zero points.
    pub fn for_frequency(frequency_hz: f64, points: usize) -> Result<Self, ValidationError> {
        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(ValidationError::InvalidFrequency(frequency_hz));
        }
        if points == 0 {
            return Err(ValidationError::EmptyWaveform);
        }

        // Integer nanoseconds keep the reduced dwell from rounding below the minimum.
        let period_ns = (1e9 / frequency_hz).round() as u128;
        let min_ns = MIN_DWELL.as_nanos();
        let max_ns = MAX_DWELL.as_nanos();

        let mut warnings = Vec::new();
        let mut points = points;
        let mut dwell_ns = period_ns / points as u128;

        if dwell_ns < min_ns {
            let reduced = usize::try_from(period_ns / min_ns).unwrap_or(usize::MAX).max(2);
            warnings.push(format!(
                "Dwell {:.1} µs < min {} µs, reduced to {} pts",
                dwell_ns as f64 / 1e3,
                MIN_DWELL.as_micros(),
                reduced
            ));
            points = reduced;
            dwell_ns = period_ns / points as u128;
        }

        if dwell_ns > max_ns {
            warnings.push(format!(
                "Dwell {:.2} s exceeds max {} s, clamped",
                dwell_ns as f64 / 1e9,
                MAX_DWELL.as_secs()
            ));
            dwell_ns = max_ns;
        }

        let dwell = Duration::from_nanos(u64::try_from(dwell_ns).unwrap_or(u64::MAX));
        let actual_frequency = 1.0 / (points as f64 * dwell.as_secs_f64());

        for warning in &warnings {
            tracing::warn!(frequency_hz, "{}", warning);
        }

        Ok(Self {
            points,
            dwell,
            actual_frequency,
            warnings,
        })
    }
}
