//! Brick-level access to a volume persisted through an [`IOManager`].
//!
//! Everything here is async; [`crate::store::LocalVolumeStore`] drives it from
//! blocking code.

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{Result, VdsError};
use crate::grid;
use crate::io::{create_io_manager, IOManager};
use crate::key::STORE_DIMS;
use crate::layout::VolumeDataLayout;
use crate::metadata::{BrickMetadata, VdsMetadata};
use crate::utils::{brick_path, calculate_checksum, format_bytes, verify_checksum};
use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const METADATA_PATH: &str = "metadata.json";

/// On-disk form of one brick: header followed by the compressed payload
#[derive(Debug, Serialize, Deserialize)]
struct BrickEnvelope {
    header: BrickMetadata,
    payload: Vec<u8>,
}

/// Async brick reader/writer for one volume
pub struct VolumeDataAccess {
    /// Volume metadata
    metadata: Arc<RwLock<VdsMetadata>>,

    /// I/O manager for storage operations
    io_manager: Arc<dyn IOManager>,

    /// Level used when compressing bricks
    level: CompressionLevel,
}

impl VolumeDataAccess {
    /// Open an existing volume; `NotFound` if there is none at `url`
    pub async fn open(url: &str, level: CompressionLevel) -> Result<Self> {
        let io_manager: Arc<dyn IOManager> = Arc::from(create_io_manager(url)?);

        let metadata_bytes = io_manager.read(METADATA_PATH).await?;
        let metadata: VdsMetadata = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| VdsError::Metadata(e.to_string()))?;
        metadata.check_version()?;

        Ok(Self {
            metadata: Arc::new(RwLock::new(metadata)),
            io_manager,
            level,
        })
    }

    /// Create a new, empty volume at `url`
    pub async fn create(url: &str, metadata: VdsMetadata, level: CompressionLevel) -> Result<Self> {
        let io_manager: Arc<dyn IOManager> = Arc::from(create_io_manager(url)?);

        if io_manager.exists(METADATA_PATH).await? {
            return Err(VdsError::InvalidOperation(format!(
                "a volume already exists at '{}'",
                url
            )));
        }

        let access = Self {
            metadata: Arc::new(RwLock::new(metadata)),
            io_manager,
            level,
        };
        access.write_metadata().await?;
        Ok(access)
    }

    /// Get the volume metadata
    pub fn metadata(&self) -> VdsMetadata {
        self.metadata.read().clone()
    }

    /// Get the volume layout
    pub fn layout(&self) -> VolumeDataLayout {
        self.metadata.read().layout.clone()
    }

    async fn write_metadata(&self) -> Result<()> {
        let metadata_json = serde_json::to_vec_pretty(&*self.metadata.read())
            .map_err(|e| VdsError::Metadata(e.to_string()))?;
        self.io_manager.write(METADATA_PATH, &metadata_json).await
    }

    /// Storage-order bounds and byte size of a brick
    fn brick_geometry(&self, channel: usize, index: usize) -> Result<(grid::ChunkBounds, usize)> {
        let layout = self.layout();
        let shape = layout.storage_shape();
        let edge = layout.brick_edge();
        if index >= grid::brick_count(&shape, edge) {
            return Err(VdsError::InvalidOperation(format!(
                "brick {} is outside the {} bricks of the volume",
                index,
                grid::brick_count(&shape, edge)
            )));
        }
        let element_size = layout
            .channels
            .get(channel)
            .ok_or_else(|| VdsError::NotFound(format!("channel {}", channel)))?
            .element_size();
        let (min, max) = grid::bounds_of(index, &shape, edge);
        let voxels: usize = (0..grid::MAX_SPATIAL_DIMS).map(|i| max[i] - min[i]).product();
        Ok(((min, max), voxels * element_size))
    }

    /// Whether a brick has been committed
    pub async fn brick_exists(&self, channel: usize, index: usize) -> Result<bool> {
        self.io_manager.exists(&brick_path(channel, 0, index)).await
    }

    /// Read and decode one brick; `None` if it was never written
    pub async fn read_brick(&self, channel: usize, index: usize) -> Result<Option<Vec<u8>>> {
        let (_, expected_size) = self.brick_geometry(channel, index)?;
        let encoded = match self.io_manager.read(&brick_path(channel, 0, index)).await {
            Ok(encoded) => encoded,
            Err(VdsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let envelope: BrickEnvelope = bincode::deserialize(&encoded)?;
        let header = envelope.header;
        if header.index != index || header.uncompressed_size != expected_size {
            return Err(VdsError::InvalidFormat(format!(
                "brick {} header describes brick {} of {} bytes, expected {} bytes",
                index, header.index, header.uncompressed_size, expected_size
            )));
        }

        let data = header.compression.decode(&envelope.payload, expected_size)?;
        if !verify_checksum(&data, header.checksum) {
            return Err(VdsError::InvalidFormat(format!(
                "brick {} of channel {} failed its integrity check",
                index, channel
            )));
        }
        Ok(Some(data))
    }

    /// Read several bricks concurrently
    pub async fn read_bricks(
        &self,
        channel: usize,
        indices: &[usize],
    ) -> Result<HashMap<usize, Option<Vec<u8>>>> {
        let futures: Vec<_> = indices
            .iter()
            .map(|&index| async move {
                let data = self.read_brick(channel, index).await?;
                Ok::<_, VdsError>((index, data))
            })
            .collect();

        let results = try_join_all(futures).await?;
        Ok(results.into_iter().collect())
    }

    /// Compress and persist bricks concurrently, then stamp the metadata
    pub async fn write_bricks(&self, channel: usize, bricks: Vec<(usize, Vec<u8>)>) -> Result<()> {
        let method: CompressionMethod = self.metadata.read().compression;
        let level = self.level;

        let futures: Vec<_> = bricks
            .into_iter()
            .map(|(index, data)| async move {
                let encode = || -> Result<Vec<u8>> {
                    let (_, expected_size) = self.brick_geometry(channel, index)?;
                    if data.len() != expected_size {
                        return Err(VdsError::InvalidFormat(format!(
                            "brick buffer holds {} bytes, expected {}",
                            data.len(),
                            expected_size
                        )));
                    }
                    let envelope = BrickEnvelope {
                        header: BrickMetadata {
                            index,
                            compression: method,
                            uncompressed_size: data.len(),
                            checksum: calculate_checksum(&data),
                        },
                        payload: method.encode(&data, level)?,
                    };
                    Ok(bincode::serialize(&envelope)?)
                };

                let written = match encode() {
                    Ok(encoded) => {
                        self.io_manager
                            .write(&brick_path(channel, 0, index), &encoded)
                            .await
                    }
                    Err(e) => Err(e),
                };
                written.map_err(|e| VdsError::Write {
                    chunk: index,
                    code: e.code(),
                    message: e.to_string(),
                })
            })
            .collect();

        let count = futures.len();
        try_join_all(futures).await?;
        debug!("Wrote {} bricks of channel {}", count, channel);

        self.metadata.write().touch();
        self.write_metadata().await
    }

    /// Read the storage-order region `begin..end` of a channel.
    ///
    /// Bricks that were never written are filled with `fill`, an element
    /// already encoded in the channel format.
    pub async fn read_subset(
        &self,
        channel: usize,
        begin: &[usize; STORE_DIMS],
        end: &[usize; STORE_DIMS],
        fill: &[u8],
    ) -> Result<Bytes> {
        let layout = self.layout();
        let shape = layout.storage_shape();
        let edge = layout.brick_edge();
        let element_size = layout
            .channels
            .get(channel)
            .ok_or_else(|| VdsError::NotFound(format!("channel {}", channel)))?
            .element_size();

        for axis in 0..STORE_DIMS {
            let len = shape.get(axis).copied().unwrap_or(1);
            let valid = if axis < shape.len() {
                begin[axis] <= end[axis] && end[axis] <= len
            } else {
                begin[axis] == 0 && end[axis] == 1
            };
            if !valid {
                return Err(VdsError::InvalidDimensions(format!(
                    "request {:?}..{:?} does not fit volume {:?}",
                    begin, end, shape
                )));
            }
        }

        let dims: Vec<usize> = (0..grid::MAX_SPATIAL_DIMS).map(|i| end[i] - begin[i]).collect();
        let total: usize = dims.iter().product();
        if total == 0 {
            return Ok(Bytes::new());
        }

        let mut output = fill.repeat(total);
        let indices = grid::overlapping_chunks(begin, end, &shape, edge);
        let bricks = self.read_bricks(channel, &indices).await?;
        debug!(
            "Assembling {} from {} bricks",
            format_bytes(output.len()),
            indices.len()
        );

        for (&index, data) in &bricks {
            let Some(data) = data else { continue };
            let (bmin, bmax) = grid::bounds_of(index, &shape, edge);
            let bdims: Vec<usize> = (0..grid::MAX_SPATIAL_DIMS).map(|i| bmax[i] - bmin[i]).collect();
            let lo: Vec<usize> = (0..grid::MAX_SPATIAL_DIMS).map(|i| begin[i].max(bmin[i])).collect();
            let hi: Vec<usize> = (0..grid::MAX_SPATIAL_DIMS).map(|i| end[i].min(bmax[i])).collect();

            // Axis 0 is contiguous in both buffers; copy one run per (z, y)
            let run = (hi[0] - lo[0]) * element_size;
            for z in lo[2]..hi[2] {
                for y in lo[1]..hi[1] {
                    let src = (((z - bmin[2]) * bdims[1] + (y - bmin[1])) * bdims[0]
                        + (lo[0] - bmin[0]))
                        * element_size;
                    let dst = (((z - begin[2]) * dims[1] + (y - begin[1])) * dims[0]
                        + (lo[0] - begin[0]))
                        * element_size;
                    output[dst..dst + run].copy_from_slice(&data[src..src + run]);
                }
            }
        }

        Ok(Bytes::from(output))
    }

    /// Get statistics about the volume
    pub fn stats(&self) -> VolumeStats {
        let metadata = self.metadata();
        let layout = &metadata.layout;
        VolumeStats {
            dimensionality: layout.dimensionality(),
            total_voxels: layout.storage_shape().iter().product(),
            total_bricks: grid::brick_count(&layout.storage_shape(), layout.brick_edge()),
            channels: layout.channels.len(),
            uncompressed_size: layout.total_size_bytes(),
            compression_method: metadata.compression,
        }
    }
}

/// Volume statistics
#[derive(Debug, Clone)]
pub struct VolumeStats {
    pub dimensionality: usize,
    pub total_voxels: usize,
    pub total_bricks: usize,
    pub channels: usize,
    pub uncompressed_size: usize,
    pub compression_method: CompressionMethod,
}

impl VolumeStats {
    pub fn summary(&self) -> String {
        format!(
            "{}D Volume: {} voxels, {} bricks per channel, {} channels, {} uncompressed ({:?})",
            self.dimensionality,
            self.total_voxels,
            self.total_bricks,
            self.channels,
            format_bytes(self.uncompressed_size),
            self.compression_method,
        )
    }
}
