//! Sample types produced by one `sample()` cycle.

use crate::error::DaqError;
use image::RgbImage;

/// Missing-value sentinel written for any channel whose read failed.
pub const MISSING: f64 = f64::NAN;

/// Channel name → value mapping in the device's fixed channel order.
///
/// Insertion order is preserved so that log columns and archive sections
/// follow the order in which the driver declares its channels.
#[derive(Debug, Clone, Default)]
pub struct Readings {
    values: Vec<(String, f64)>,
}

impl Readings {
    /// Create an empty set of readings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Readings where every channel carries the missing-value sentinel.
    pub fn missing<'a>(channels: impl IntoIterator<Item = &'a str>) -> Self {
        channels
            .into_iter()
            .map(|name| (name.to_string(), MISSING))
            .collect()
    }

    /// Set a channel value, replacing an earlier value for the same channel.
    pub fn insert(&mut self, channel: impl Into<String>, value: f64) {
        let channel = channel.into();
        match self.values.iter_mut().find(|(name, _)| *name == channel) {
            Some(slot) => slot.1 = value,
            None => self.values.push((channel, value)),
        }
    }

    /// Value of a channel, if the channel is present.
    pub fn get(&self, channel: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, value)| *value)
    }

    /// Whether the channel is present and holds the missing-value sentinel.
    pub fn is_missing(&self, channel: &str) -> bool {
        self.get(channel).is_some_and(f64::is_nan)
    }

    /// Channel names in order.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    /// `(channel, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no channel is present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Readings {
    fn from_iter<T: IntoIterator<Item = (S, f64)>>(iter: T) -> Self {
        let mut readings = Readings::new();
        for (name, value) in iter {
            readings.insert(name, value);
        }
        readings
    }
}

/// One camera unit's outcome for a sample.
#[derive(Debug)]
pub struct UnitFrame {
    /// Stable context id assigned when the unit was attached.
    pub unit_id: usize,
    /// The converted 8-bit RGB frame, or the acquisition failure of this unit.
    pub frame: Result<RgbImage, DaqError>,
}

impl UnitFrame {
    /// Whether this unit delivered a frame.
    pub fn is_ok(&self) -> bool {
        self.frame.is_ok()
    }
}

/// Result of one `sample()` cycle.
#[derive(Debug)]
pub enum Sample {
    /// Scalar channel readings from a sensor-style device.
    Readings(Readings),
    /// One result per configured camera unit, ordered by unit id.
    Frames(Vec<UnitFrame>),
}

impl Sample {
    /// Scalar readings, if this is a sensor sample.
    pub fn readings(&self) -> Option<&Readings> {
        match self {
            Sample::Readings(readings) => Some(readings),
            Sample::Frames(_) => None,
        }
    }

    /// Camera unit results, if this is a camera sample.
    pub fn frames(&self) -> Option<&[UnitFrame]> {
        match self {
            Sample::Frames(frames) => Some(frames),
            Sample::Readings(_) => None,
        }
    }

    /// Short label used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Sample::Readings(_) => "readings",
            Sample::Frames(_) => "frames",
        }
    }
}
