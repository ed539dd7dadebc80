//! OpenVDS utils - chunk addressing and composite views over volumetric data
//!
//! A pure Rust layer for reading and writing multi-dimensional volumes
//! (seismic cubes and the like) through NumPy-style index keys.
//!
//! # Features
//!
//! - Typed subset reads (`u8` .. `f64`) returned as `ndarray` arrays in user axis order
//! - Brick-by-brick writes through [`Chunk`]s, committed per channel
//! - [`CompositeView`] to read several volumes as one, concatenated along any axis
//! - Local filesystem store with Deflate, Zstd and RLE compressed bricks
//!
//! # Axis order
//!
//! Keys, shapes and arrays are in user order. The store keeps axes reversed,
//! with the last user axis varying fastest; [`key::to_storage_order`] and
//! [`key::to_user_order`] convert between the two.
//!
//! # Other stores
//!
//! Implement [`VolumeStore`], [`VolumeHandle`] and [`PageAccessor`] and open
//! views with [`VolumeView::open_with`].
//!
//! # Example
//!
//! ```rust,no_run
//! use openvds_utils::{key, ChannelDescriptor, CreateOptions, Format, VolumeView};
//!
//! # fn main() -> openvds_utils::Result<()> {
//! let options = CreateOptions::from_shape(&[251, 51, 126], vec![ChannelDescriptor::new("Amplitude", Format::R64)]);
//! let view = VolumeView::create("/data/example.vds", "", options)?;
//!
//! let channel = view.channel("Amplitude")?;
//! for mut chunk in channel.chunks()? {
//!     chunk.write(&key![..], &ndarray::arr0(1.0f64))?;
//!     chunk.release()?;
//! }
//! channel.commit()?;
//!
//! let inline = view.read::<f64>(&key![100, .., 10..20])?;
//! assert_eq!(inline.shape(), &[51, 10]);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod composite;
pub mod compression;
pub mod error;
pub mod grid;
pub mod io;
pub mod key;
pub mod layout;
pub mod metadata;
pub mod store;
pub mod types;
pub mod utils;
pub mod view;

// Re-exports
pub use composite::{CompositeView, VolumeSubset};
pub use compression::{CompressionLevel, CompressionMethod};
pub use error::{Result, StoreError, VdsError};
pub use key::Index;
pub use layout::{BrickSize, LayoutDescriptor, VolumeDataLayout};
pub use metadata::{MetadataContainer, MetadataType, MetadataValue};
pub use store::{LocalStoreConfig, LocalVolumeStore, PageAccessor, VolumeHandle, VolumeStore};
pub use types::{AxisDescriptor, ChannelDescriptor, Components, Element, Format};
pub use view::{Channel, ChannelBuffer, Chunk, CreateOptions, InitPolicy, VolumeView};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
