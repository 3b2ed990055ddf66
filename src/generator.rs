//! Reading generator for simulated garden sensors.
//!
//! Values are drawn from probability bands around a configured optimal
//! range: most readings land inside the band, a few drift to moderate
//! excursions and a small tail reaches critical values.

use rand::Rng;
use serde::Serialize;

use crate::reading::{NewReading, ReadingKind, Sensor};

/// Optimal ("ideal") value range used to bias generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimalBand {
    pub min: f64,
    pub max: f64,
}

impl OptimalBand {
    pub const TEMPERATURE_DEFAULT: OptimalBand = OptimalBand { min: 20.0, max: 23.0 };
    pub const HUMIDITY_DEFAULT: OptimalBand = OptimalBand { min: 40.0, max: 70.0 };

    /// Returns `None` when `min > max` or either bound is not finite.
    pub fn new(min: f64, max: f64) -> Option<Self> {
        if min.is_finite() && max.is_finite() && min <= max {
            Some(Self { min, max })
        } else {
            None
        }
    }
}

/// Band a generated value was sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Ideal,
    ModerateHigh,
    ModerateLow,
    SuboptimalHigh,
    SuboptimalLow,
    ExtremeHigh,
    ExtremeLow,
}

/// One generated value together with the band it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub kind: ReadingKind,
    pub band: Band,
    pub value: f64,
}

/// Configuration for the reading generator.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub temperature: OptimalBand,
    pub humidity: OptimalBand,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            temperature: OptimalBand::TEMPERATURE_DEFAULT,
            humidity: OptimalBand::HUMIDITY_DEFAULT,
        }
    }
}

/// Generator for plausible temperature and humidity readings.
#[derive(Debug, Clone)]
pub struct ReadingGenerator {
    config: GeneratorConfig,
}

impl ReadingGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    /// Create a new generator with the default optimal bands.
    pub fn with_defaults() -> Self {
        Self::new(GeneratorConfig::default())
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Generate one submission for the given sensor.
    ///
    /// Sensors whose type names neither temperature nor humidity are "mixed"
    /// and get a kind picked at random on every call.
    pub fn generate_for(&self, sensor: &Sensor) -> NewReading {
        let mut rng = rand::thread_rng();
        let sample = self.sample_for_type(&mut rng, &sensor.tipo);
        NewReading::new(sensor.id.clone(), sample.kind, sample.value)
    }

    /// Sample a value for a free-text sensor type.
    pub fn sample_for_type(&self, rng: &mut impl Rng, sensor_tipo: &str) -> Sample {
        let kind = ReadingKind::for_sensor_type(sensor_tipo).unwrap_or_else(|| {
            if rng.gen_bool(0.5) {
                ReadingKind::Temperature
            } else {
                ReadingKind::Humidity
            }
        });
        self.sample(rng, kind)
    }

    /// Sample a value of the given kind.
    pub fn sample(&self, rng: &mut impl Rng, kind: ReadingKind) -> Sample {
        let (band, value) = match kind {
            ReadingKind::Temperature => sample_temperature(rng, self.config.temperature),
            ReadingKind::Humidity => sample_humidity(rng, self.config.humidity),
        };

        Sample {
            kind,
            band,
            value: round_one_decimal(value),
        }
    }
}

// Temperature bands: 70% ideal, 15% up to 4 above, 10% up to 5 below,
// 3% in [27, 35], 2% in [5, 15]
fn sample_temperature(rng: &mut impl Rng, optimal: OptimalBand) -> (Band, f64) {
    let r = rng.gen_range(0.0..100.0);

    if r <= 70.0 {
        (Band::Ideal, uniform(rng, optimal.min, optimal.max))
    } else if r <= 85.0 {
        (Band::ModerateHigh, uniform(rng, optimal.max, optimal.max + 4.0))
    } else if r <= 95.0 {
        (Band::ModerateLow, uniform(rng, optimal.min - 5.0, optimal.min))
    } else if r <= 98.0 {
        (Band::ExtremeHigh, uniform(rng, 27.0, 35.0))
    } else {
        (Band::ExtremeLow, uniform(rng, 5.0, 15.0))
    }
}

// Humidity bands: 60% ideal, 20% within 10 of the band, 15% sub-optimal,
// 5% extreme; every excursion picks its side with a coin flip
fn sample_humidity(rng: &mut impl Rng, optimal: OptimalBand) -> (Band, f64) {
    let r = rng.gen_range(0.0..100.0);
    let low = rng.gen_bool(0.5);

    if r <= 60.0 {
        (Band::Ideal, uniform(rng, optimal.min, optimal.max))
    } else if r <= 80.0 {
        if low {
            (Band::ModerateLow, uniform(rng, optimal.min - 10.0, optimal.min))
        } else {
            (Band::ModerateHigh, uniform(rng, optimal.max, optimal.max + 10.0))
        }
    } else if r <= 95.0 {
        if low {
            (Band::SuboptimalLow, uniform(rng, 20.0, 30.0))
        } else {
            (Band::SuboptimalHigh, uniform(rng, 80.0, 90.0))
        }
    } else if low {
        (Band::ExtremeLow, uniform(rng, 0.0, 20.0))
    } else {
        (Band::ExtremeHigh, uniform(rng, 90.0, 100.0))
    }
}

/// Uniform in `[low, high]`; tolerates a degenerate range.
fn uniform(rng: &mut impl Rng, low: f64, high: f64) -> f64 {
    if high > low {
        rng.gen_range(low..=high)
    } else {
        low
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
