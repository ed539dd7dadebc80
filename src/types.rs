//! Core data types: axes, channels, sample formats and typed elements

use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample formats a channel can be stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Format {
    /// 1-bit boolean
    U1 = 0,
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// 32-bit floating point
    R32 = 5,
    /// 64-bit floating point
    R64 = 6,
}

impl Format {
    /// Size in bytes of one component in this format
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Format::U1 => 1, // Stored as full bytes
            Format::U8 => 1,
            Format::U16 => 2,
            Format::U32 | Format::R32 => 4,
            Format::U64 | Format::R64 => 8,
        }
    }

    /// Check if this is a floating point format
    pub fn is_float(&self) -> bool {
        matches!(self, Format::R32 | Format::R64)
    }

    /// Encode a single value in this format (native endian).
    ///
    /// Values that do not fit the format (NaN into an integer format, negative
    /// values into unsigned formats) encode as zero.
    pub fn encode_value(&self, value: f64) -> Vec<u8> {
        fn cast<T: num_traits::NumCast + Default>(value: f64) -> T {
            num_traits::cast(value).unwrap_or_default()
        }

        match self {
            Format::U1 => vec![u8::from(value != 0.0 && !value.is_nan())],
            Format::U8 => vec![cast::<u8>(value)],
            Format::U16 => cast::<u16>(value).to_ne_bytes().to_vec(),
            Format::U32 => cast::<u32>(value).to_ne_bytes().to_vec(),
            Format::U64 => cast::<u64>(value).to_ne_bytes().to_vec(),
            Format::R32 => (value as f32).to_ne_bytes().to_vec(),
            Format::R64 => value.to_ne_bytes().to_vec(),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Format_{:?}", self)
    }
}

/// Number of components per sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Components {
    #[default]
    One = 1,
    Two = 2,
    Four = 4,
}

impl Components {
    pub fn count(&self) -> usize {
        *self as usize
    }

    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(Components::One),
            2 => Some(Components::Two),
            4 => Some(Components::Four),
            _ => None,
        }
    }
}

/// Axis descriptor with name, unit, and coordinate information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDescriptor {
    /// Number of samples along this axis
    pub samples: usize,
    /// Name of the axis (e.g., "Inline", "Crossline", "Sample")
    pub name: String,
    /// Unit of measurement (e.g., "m", "ms", "ft")
    pub unit: String,
    /// Coordinate minimum
    pub coordinate_min: f64,
    /// Coordinate maximum
    pub coordinate_max: f64,
}

impl AxisDescriptor {
    /// Create a new axis descriptor
    pub fn new(
        samples: usize,
        name: impl Into<String>,
        unit: impl Into<String>,
        coordinate_min: f64,
        coordinate_max: f64,
    ) -> Self {
        Self {
            samples,
            name: name.into(),
            unit: unit.into(),
            coordinate_min,
            coordinate_max,
        }
    }

    /// Create a unitless axis spanning `0..samples-1`
    pub fn unitless(samples: usize, name: impl Into<String>) -> Self {
        Self::new(
            samples,
            name,
            "unitless",
            0.0,
            samples.saturating_sub(1) as f64,
        )
    }

    /// Check the descriptor invariants
    pub fn validate(&self) -> Result<()> {
        if self.samples == 0 {
            return Err(VdsError::InvalidDimensions(format!(
                "axis '{}' must have at least one sample",
                self.name
            )));
        }
        if self.coordinate_max < self.coordinate_min {
            return Err(VdsError::InvalidDimensions(format!(
                "axis '{}' has coordinate_max {} below coordinate_min {}",
                self.name, self.coordinate_max, self.coordinate_min
            )));
        }
        Ok(())
    }

    /// Get the step size between samples
    pub fn step_size(&self) -> f64 {
        if self.samples <= 1 {
            0.0
        } else {
            (self.coordinate_max - self.coordinate_min) / (self.samples - 1) as f64
        }
    }

    /// Convert sample index to coordinate
    pub fn index_to_coord(&self, index: usize) -> f64 {
        self.coordinate_min + index as f64 * self.step_size()
    }

    /// Convert coordinate to sample index (nearest)
    pub fn coord_to_index(&self, coord: f64) -> usize {
        let step = self.step_size();
        if step == 0.0 {
            return 0;
        }
        let normalized = (coord - self.coordinate_min) / step;
        normalized
            .round()
            .max(0.0)
            .min((self.samples - 1) as f64) as usize
    }
}

impl fmt::Display for AxisDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Axis(name={}, unit={}, range=({}, {}))>",
            self.name, self.unit, self.coordinate_min, self.coordinate_max
        )
    }
}

/// Value range for a channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::new(0.0, 1.0)
    }
}

/// Static description of one data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub name: String,
    pub unit: String,
    pub format: Format,
    pub components: Components,
    /// Advisory only, never enforced on write
    pub value_range: ValueRange,
}

impl ChannelDescriptor {
    pub fn new(name: impl Into<String>, format: Format) -> Self {
        Self {
            name: name.into(),
            unit: "unitless".to_string(),
            format,
            components: Components::One,
            value_range: ValueRange::default(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_components(mut self, components: Components) -> Self {
        self.components = components;
        self
    }

    pub fn with_value_range(mut self, min: f64, max: f64) -> Self {
        self.value_range = ValueRange::new(min, max);
        self
    }

    /// Size in bytes of one sample including all its components
    pub fn element_size(&self) -> usize {
        match self.format {
            Format::U1 => 1,
            format => format.size_in_bytes() * self.components.count(),
        }
    }

    /// One sample with every component set to `value`, encoded in the channel format
    pub fn encode_sample(&self, value: f64) -> Vec<u8> {
        let mut sample = self.format.encode_value(value).repeat(self.components.count());
        sample.truncate(self.element_size());
        sample
    }

    /// Array shape of `dims` samples of this channel, with a trailing
    /// component axis when there is more than one component
    pub fn array_shape(&self, dims: &[usize]) -> Vec<usize> {
        let mut shape = dims.to_vec();
        if self.format != Format::U1 && self.components.count() > 1 {
            shape.push(self.components.count());
        }
        shape
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Channel(name={}, unit={}, format={})>",
            self.name, self.unit, self.format
        )
    }
}

/// A Rust element type that can be read from and written to a channel
pub trait Element:
    bytemuck::Pod + num_traits::NumCast + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Formats whose samples can be viewed as `Self`
    fn accepts(format: Format) -> bool;

    /// Convert a fill value, falling back to zero when it is not representable
    fn from_fill(value: f64) -> Self {
        num_traits::cast(value).unwrap_or_default()
    }

    /// Fail unless `Self` matches the channel's format
    fn check_format(format: Format) -> Result<()> {
        if Self::accepts(format) {
            Ok(())
        } else {
            Err(VdsError::InvalidDataType(format!(
                "{} cannot hold {} samples",
                std::any::type_name::<Self>(),
                format
            )))
        }
    }
}

macro_rules! impl_element {
    ($ty:ty, $($format:pat_param)|+) => {
        impl Element for $ty {
            fn accepts(format: Format) -> bool {
                matches!(format, $($format)|+)
            }
        }
    };
}

impl_element!(u8, Format::U8 | Format::U1);
impl_element!(u16, Format::U16);
impl_element!(u32, Format::U32);
impl_element!(u64, Format::U64);
impl_element!(f32, Format::R32);
impl_element!(f64, Format::R64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(Format::U1.size_in_bytes(), 1);
        assert_eq!(Format::U8.size_in_bytes(), 1);
        assert_eq!(Format::U16.size_in_bytes(), 2);
        assert_eq!(Format::R32.size_in_bytes(), 4);
        assert_eq!(Format::R64.size_in_bytes(), 8);
    }

    #[test]
    fn test_element_size_with_components() {
        let channel = ChannelDescriptor::new("Amplitude", Format::R32);
        assert_eq!(channel.element_size(), 4);
        let channel = channel.with_components(Components::Four);
        assert_eq!(channel.element_size(), 16);
        assert_eq!(channel.array_shape(&[2, 3]), vec![2, 3, 4]);

        let bits = ChannelDescriptor::new("Mask", Format::U1).with_components(Components::Two);
        assert_eq!(bits.element_size(), 1);
    }

    #[test]
    fn test_encode_value() {
        assert_eq!(Format::R64.encode_value(1.5), 1.5f64.to_ne_bytes().to_vec());
        assert_eq!(Format::U16.encode_value(f64::NAN), vec![0, 0]);
        assert_eq!(Format::U8.encode_value(-3.0), vec![0]);
        assert!(f32::from_ne_bytes(Format::R32.encode_value(f64::NAN).try_into().unwrap()).is_nan());
    }

    #[test]
    fn test_element_format_check() {
        assert!(f64::check_format(Format::R64).is_ok());
        assert!(u8::check_format(Format::U1).is_ok());
        assert!(matches!(
            f32::check_format(Format::R64),
            Err(VdsError::InvalidDataType(_))
        ));
        assert_eq!(u16::from_fill(f64::NAN), 0);
        assert!(f32::from_fill(f64::NAN).is_nan());
    }

    #[test]
    fn test_axis_descriptor() {
        let axis = AxisDescriptor::new(101, "Depth", "m", 0.0, 1000.0);
        assert_eq!(axis.step_size(), 10.0);
        assert_eq!(axis.index_to_coord(0), 0.0);
        assert_eq!(axis.index_to_coord(100), 1000.0);
        assert_eq!(axis.coord_to_index(500.0), 50);
        assert_eq!(axis.coord_to_index(-20.0), 0);
        assert_eq!(axis.coord_to_index(5000.0), 100);
    }

    #[test]
    fn test_axis_validation() {
        assert!(AxisDescriptor::unitless(10, "X").validate().is_ok());
        assert!(AxisDescriptor::unitless(0, "X").validate().is_err());
        assert!(AxisDescriptor::new(3, "X", "m", 5.0, 1.0)
            .validate()
            .is_err());
    }
}
