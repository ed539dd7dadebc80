//! Volume data layout - axes, channels and how the volume is divided into bricks

use crate::error::{Result, VdsError};
use crate::grid::MAX_SPATIAL_DIMS;
use crate::key::to_user_order;
use crate::types::{AxisDescriptor, ChannelDescriptor};
use crate::utils::format_bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Largest brick data block (all channels of one brick) a store can allocate
pub const MAX_DATABLOCK_BYTES: usize = 2_147_483_647;

/// Edge length of a brick, as a power of two
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BrickSize {
    BrickSize64 = 6,
    BrickSize128 = 7,
    BrickSize256 = 8,
    BrickSize512 = 9,
    BrickSize1024 = 10,
    BrickSize2048 = 11,
    BrickSize4096 = 12,
}

impl BrickSize {
    /// Power-of-two exponent of the edge length
    pub fn exponent(&self) -> u32 {
        *self as u32
    }

    /// Edge length in samples
    pub fn edge(&self) -> usize {
        1 << self.exponent()
    }

    /// Look up the brick size with the given edge length
    pub fn from_edge(edge: usize) -> Option<Self> {
        match edge {
            64 => Some(BrickSize::BrickSize64),
            128 => Some(BrickSize::BrickSize128),
            256 => Some(BrickSize::BrickSize256),
            512 => Some(BrickSize::BrickSize512),
            1024 => Some(BrickSize::BrickSize1024),
            2048 => Some(BrickSize::BrickSize2048),
            4096 => Some(BrickSize::BrickSize4096),
            _ => None,
        }
    }
}

impl Default for BrickSize {
    fn default() -> Self {
        BrickSize::BrickSize128
    }
}

/// Number of levels of detail kept by the store (`None` means full resolution only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LodLevels {
    #[default]
    None,
    Levels(u8),
}

impl LodLevels {
    pub fn count(&self) -> usize {
        match self {
            LodLevels::None => 0,
            LodLevels::Levels(n) => *n as usize,
        }
    }

    /// `n` levels, 1..=12
    pub fn new(levels: u8) -> Result<Self> {
        match levels {
            0 => Ok(LodLevels::None),
            1..=12 => Ok(LodLevels::Levels(levels)),
            _ => Err(VdsError::Configuration(format!(
                "LOD levels must be between 0 and 12, got {}",
                levels
            ))),
        }
    }
}

/// Layout option flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutOptions {
    #[default]
    None,
    Create2DLods,
    ForceFullResolutionDimension,
}

/// Layout parameters chosen when a volume is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutDescriptor {
    pub brick_size: BrickSize,
    pub lod_levels: LodLevels,
    pub brick_size_2d_multiplier: usize,
    pub options: LayoutOptions,
    pub negative_margin: usize,
    pub positive_margin: usize,
    pub full_resolution_dimension: usize,
}

impl Default for LayoutDescriptor {
    fn default() -> Self {
        Self {
            brick_size: BrickSize::default(),
            lod_levels: LodLevels::None,
            brick_size_2d_multiplier: 4,
            options: LayoutOptions::None,
            negative_margin: 0,
            positive_margin: 0,
            full_resolution_dimension: 0,
        }
    }
}

impl LayoutDescriptor {
    /// Set the brick size
    pub fn with_brick_size(mut self, brick_size: BrickSize) -> Self {
        self.brick_size = brick_size;
        self
    }

    /// Set the number of LOD levels
    pub fn with_lod_levels(mut self, lod_levels: LodLevels) -> Self {
        self.lod_levels = lod_levels;
        self
    }

    /// Set margins
    pub fn with_margins(mut self, negative_margin: usize, positive_margin: usize) -> Self {
        self.negative_margin = negative_margin;
        self.positive_margin = positive_margin;
        self
    }

    pub fn with_brick_size_2d_multiplier(mut self, multiplier: usize) -> Self {
        self.brick_size_2d_multiplier = multiplier;
        self
    }

    pub fn with_options(mut self, options: LayoutOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_full_resolution_dimension(mut self, dimension: usize) -> Self {
        self.full_resolution_dimension = dimension;
        self
    }

    /// Brick edge length for a volume of the given dimensionality.
    ///
    /// Two-dimensional volumes use bricks `brick_size_2d_multiplier` times larger.
    pub fn brick_edge(&self, dimensionality: usize) -> usize {
        if dimensionality == 2 {
            self.brick_size.edge() * self.brick_size_2d_multiplier.max(1)
        } else {
            self.brick_size.edge()
        }
    }
}

/// Layout of volume data - describes how the volume is organized.
///
/// Axes are kept in storage order: axis 0 is the fastest varying one and the
/// last entry is the first axis of the user-facing shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDataLayout {
    /// Axis descriptors in storage order
    pub axes: Vec<AxisDescriptor>,

    /// Channel descriptors, channel 0 first
    pub channels: Vec<ChannelDescriptor>,

    /// Brick, LOD and margin settings
    pub descriptor: LayoutDescriptor,
}

impl VolumeDataLayout {
    /// Create a new volume data layout from storage-order axes
    pub fn new(
        axes: Vec<AxisDescriptor>,
        channels: Vec<ChannelDescriptor>,
        descriptor: LayoutDescriptor,
    ) -> Result<Self> {
        if axes.is_empty() || axes.len() > MAX_SPATIAL_DIMS {
            return Err(VdsError::InvalidDimensions(format!(
                "Dimensionality must be between 1 and {}, got {}",
                MAX_SPATIAL_DIMS,
                axes.len()
            )));
        }
        for axis in &axes {
            axis.validate()?;
        }

        if channels.is_empty() {
            return Err(VdsError::InvalidDimensions(
                "A volume needs at least one channel".to_string(),
            ));
        }
        for (i, channel) in channels.iter().enumerate() {
            if channels[..i].iter().any(|c| c.name == channel.name) {
                return Err(VdsError::Configuration(format!(
                    "Duplicate channel name '{}'",
                    channel.name
                )));
            }
        }

        if descriptor.full_resolution_dimension >= axes.len() {
            return Err(VdsError::Configuration(format!(
                "Full resolution dimension {} is outside a {}D volume",
                descriptor.full_resolution_dimension,
                axes.len()
            )));
        }

        Ok(Self {
            axes,
            channels,
            descriptor,
        })
    }

    /// Number of axes
    pub fn dimensionality(&self) -> usize {
        self.axes.len()
    }

    /// Sample counts in storage order
    pub fn storage_shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.samples).collect()
    }

    /// Sample counts in user order
    pub fn shape(&self) -> Vec<usize> {
        to_user_order(&self.storage_shape())
    }

    /// Brick edge length used by the chunk grid
    pub fn brick_edge(&self) -> usize {
        self.descriptor.brick_edge(self.dimensionality())
    }

    /// Find a channel index by name
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    /// Brick extents clamped to the volume, in storage order
    pub fn brick_extents(&self) -> Vec<usize> {
        let edge = self.brick_edge();
        self.axes.iter().map(|a| a.samples.min(edge)).collect()
    }

    /// Size in bytes of one brick across all channels
    pub fn datablock_size(&self) -> usize {
        let voxels: usize = self.brick_extents().iter().product();
        let element_bytes: usize = self.channels.iter().map(|c| c.element_size()).sum();
        voxels.saturating_mul(element_bytes)
    }

    /// Reject layouts whose brick data block exceeds what a store can allocate
    pub fn check_block_size(&self) -> Result<()> {
        let datablock_size = self.datablock_size();
        info!("Datablock size: {}", format_bytes(datablock_size));
        info!(
            "Estimated process size: {}",
            format_bytes(datablock_size.saturating_mul(10))
        );

        if datablock_size > MAX_DATABLOCK_BYTES {
            let extents = self
                .brick_extents()
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(" x ");
            return Err(VdsError::Allocation(format!(
                "Datablock is too big ({} x {} channels = {} bytes, limit {})",
                extents,
                self.channels.len(),
                datablock_size,
                MAX_DATABLOCK_BYTES
            )));
        }
        Ok(())
    }

    /// Size in bytes of one brick of a single channel, clamped to the volume
    pub fn brick_size_bytes(&self, channel: usize) -> usize {
        let voxels: usize = self.brick_extents().iter().product();
        voxels * self.channels[channel].element_size()
    }

    /// Calculate the total volume size in bytes (uncompressed)
    pub fn total_size_bytes(&self) -> usize {
        let total_voxels: usize = self.axes.iter().map(|a| a.samples).product();
        let element_bytes: usize = self.channels.iter().map(|c| c.element_size()).sum();
        total_voxels * element_bytes
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        let size_str = self
            .shape()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" x ");

        format!(
            "{}D Volume: {} ({} channels), brick edge {}, {} uncompressed",
            self.dimensionality(),
            size_str,
            self.channels.len(),
            self.brick_edge(),
            format_bytes(self.total_size_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Components, Format};

    fn create_test_layout() -> VolumeDataLayout {
        let axes = vec![
            AxisDescriptor::new(500, "Sample", "ms", 0.0, 2000.0),
            AxisDescriptor::new(800, "Crossline", "trace", 0.0, 799.0),
            AxisDescriptor::new(1000, "Inline", "trace", 0.0, 999.0),
        ];

        VolumeDataLayout::new(
            axes,
            vec![ChannelDescriptor::new("Amplitude", Format::R32)],
            LayoutDescriptor::default().with_brick_size(BrickSize::BrickSize64),
        )
        .unwrap()
    }

    #[test]
    fn test_layout_creation() {
        let layout = create_test_layout();
        assert_eq!(layout.dimensionality(), 3);
        assert_eq!(layout.storage_shape(), vec![500, 800, 1000]);
        assert_eq!(layout.shape(), vec![1000, 800, 500]);
        assert_eq!(layout.channel_index("Amplitude"), Some(0));
        assert_eq!(layout.channel_index("Missing"), None);
    }

    #[test]
    fn test_brick_edges() {
        assert_eq!(BrickSize::BrickSize64.edge(), 64);
        assert_eq!(BrickSize::BrickSize4096.edge(), 4096);
        assert_eq!(BrickSize::from_edge(256), Some(BrickSize::BrickSize256));
        assert_eq!(BrickSize::from_edge(100), None);

        let descriptor = LayoutDescriptor::default();
        assert_eq!(descriptor.brick_edge(3), 128);
        assert_eq!(descriptor.brick_edge(2), 512);
    }

    #[test]
    fn test_datablock_size() {
        let layout = create_test_layout();
        assert_eq!(layout.datablock_size(), 64 * 64 * 64 * 4);
        assert!(layout.check_block_size().is_ok());
    }

    #[test]
    fn test_datablock_size_is_clamped_to_shape() {
        let layout = VolumeDataLayout::new(
            vec![
                AxisDescriptor::unitless(10, "X"),
                AxisDescriptor::unitless(300, "Y"),
                AxisDescriptor::unitless(20, "Z"),
            ],
            vec![
                ChannelDescriptor::new("A", Format::R64),
                ChannelDescriptor::new("B", Format::U8).with_components(Components::Two),
            ],
            LayoutDescriptor::default(),
        )
        .unwrap();
        assert_eq!(layout.brick_extents(), vec![10, 128, 20]);
        assert_eq!(layout.datablock_size(), 10 * 128 * 20 * (8 + 2));
    }

    #[test]
    fn test_oversized_datablock_is_rejected() {
        let layout = VolumeDataLayout::new(
            vec![
                AxisDescriptor::unitless(4096, "X"),
                AxisDescriptor::unitless(4096, "Y"),
                AxisDescriptor::unitless(4096, "Z"),
            ],
            vec![ChannelDescriptor::new("A", Format::R64)],
            LayoutDescriptor::default().with_brick_size(BrickSize::BrickSize4096),
        )
        .unwrap();
        assert!(matches!(
            layout.check_block_size(),
            Err(VdsError::Allocation(_))
        ));
    }

    #[test]
    fn test_invalid_layouts() {
        let channels = vec![ChannelDescriptor::new("A", Format::U8)];
        assert!(VolumeDataLayout::new(vec![], channels.clone(), LayoutDescriptor::default()).is_err());

        let four_axes = (0..4).map(|i| AxisDescriptor::unitless(4, format!("A{}", i))).collect();
        assert!(VolumeDataLayout::new(four_axes, channels.clone(), LayoutDescriptor::default()).is_err());

        let axes = vec![AxisDescriptor::unitless(4, "X")];
        assert!(VolumeDataLayout::new(axes.clone(), vec![], LayoutDescriptor::default()).is_err());

        let duplicated = vec![channels[0].clone(), channels[0].clone()];
        assert!(VolumeDataLayout::new(axes, duplicated, LayoutDescriptor::default()).is_err());
    }

    #[test]
    fn test_lod_levels() {
        assert_eq!(LodLevels::new(0).unwrap(), LodLevels::None);
        assert_eq!(LodLevels::new(3).unwrap().count(), 3);
        assert!(LodLevels::new(13).is_err());
    }
}
