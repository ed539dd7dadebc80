//! The storage collaborator behind a volume view.
//!
//! A [`VolumeStore`] opens and creates volumes; each open volume is a
//! [`VolumeHandle`] that serves subset reads and hands out [`PageAccessor`]s
//! for brick-granular writes. [`LocalVolumeStore`] implements all three over
//! the local filesystem.

use crate::access::VolumeDataAccess;
use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{Result, StoreError, VdsError};
use crate::grid::{self, MAX_SPATIAL_DIMS};
use crate::key::STORE_DIMS;
use crate::layout::VolumeDataLayout;
use crate::metadata::{MetadataContainer, VdsMetadata};
use crate::types::{Element, Format};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// How a page accessor may touch pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Pages of a freshly created volume
    Create,
    ReadOnly,
    ReadWrite,
}

/// A subset read in store order, six dimensions with unused ones at `0..1`
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetRequest {
    pub begin: [usize; STORE_DIMS],
    pub end: [usize; STORE_DIMS],
    pub channel: usize,
    pub lod: usize,
    pub format: Format,
    /// Value reported for samples that were never written
    pub replacement_no_value: f64,
}

/// Opens and creates volumes
pub trait VolumeStore: Send + Sync {
    /// Open an existing volume. A missing volume is `VdsError::NotFound`.
    fn open(&self, path: &str, connection: &str) -> Result<Box<dyn VolumeHandle>>;

    /// Create an empty volume with the given layout
    fn create(
        &self,
        path: &str,
        connection: &str,
        layout: &VolumeDataLayout,
        metadata: &MetadataContainer,
    ) -> Result<Box<dyn VolumeHandle>>;
}

/// An open volume
pub trait VolumeHandle: Send + Sync {
    fn layout(&self) -> VolumeDataLayout;

    fn metadata(&self) -> MetadataContainer;

    fn create_accessor(
        &self,
        channel: usize,
        mode: AccessMode,
        lod: usize,
    ) -> Result<Box<dyn PageAccessor>>;

    /// Read a subset into a buffer laid out in store order (axis 0 fastest).
    /// `None` means the read failed; the cause is in [`VolumeHandle::current_error`].
    fn request_subset(&self, request: &SubsetRequest) -> Option<Bytes>;

    /// The most recent error reported by this handle
    fn current_error(&self) -> Option<StoreError>;

    fn close(&self) -> Result<()>;
}

/// Brick-granular access to one channel
pub trait PageAccessor: Send {
    fn mode(&self) -> AccessMode;

    /// Number of chunks (bricks) in the channel
    fn chunk_count(&self) -> usize;

    /// A fresh writable page. Fails with `VdsError::PageExists` if the brick
    /// was already written or is pending commit.
    fn create_page(&mut self, chunk: usize) -> Result<Page>;

    /// The current content of a brick
    fn read_page(&mut self, chunk: usize) -> Result<Page>;

    /// Hand a page back. Modified pages are kept until the next commit.
    fn release_page(&mut self, page: Page) -> Result<()>;

    /// Persist every released modification
    fn commit(&mut self) -> Result<()>;
}

/// One brick of one channel held in memory
#[derive(Debug)]
pub struct Page {
    chunk: usize,
    min: [usize; MAX_SPATIAL_DIMS],
    max: [usize; MAX_SPATIAL_DIMS],
    // u64 words keep the buffer aligned for every element type
    words: Vec<u64>,
    len: usize,
    writable: bool,
    dirty: bool,
}

impl Page {
    /// Wrap brick bytes; `data` must hold every sample between `min` and `max`
    pub fn new(
        chunk: usize,
        bounds: grid::ChunkBounds,
        data: &[u8],
        writable: bool,
    ) -> Self {
        let mut words = vec![0u64; data.len().div_ceil(8)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..data.len()].copy_from_slice(data);
        Self {
            chunk,
            min: bounds.0,
            max: bounds.1,
            words,
            len: data.len(),
            writable,
            dirty: false,
        }
    }

    /// A page with every element set to `fill`
    pub fn filled(chunk: usize, bounds: grid::ChunkBounds, fill: &[u8], writable: bool) -> Self {
        let voxels: usize = (0..MAX_SPATIAL_DIMS).map(|i| bounds.1[i] - bounds.0[i]).product();
        Self::new(chunk, bounds, &fill.repeat(voxels), writable)
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Bounds in store order
    pub fn bounds(&self) -> grid::ChunkBounds {
        (self.min, self.max)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn buffer(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    /// Mutable bytes; marks the page modified
    pub fn buffer_mut(&mut self) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(VdsError::InvalidOperation(format!(
                "page {} is read-only",
                self.chunk
            )));
        }
        self.dirty = true;
        Ok(&mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len])
    }

    /// The page viewed as elements
    pub fn typed<T: Element>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.buffer())
            .map_err(|e| VdsError::InvalidDataType(format!("page {}: {}", self.chunk, e)))
    }

    pub fn typed_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let chunk = self.chunk;
        bytemuck::try_cast_slice_mut(self.buffer_mut()?)
            .map_err(|e| VdsError::InvalidDataType(format!("page {}: {}", chunk, e)))
    }
}

/// Settings of the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Method used for bricks of newly created volumes
    pub compression: CompressionMethod,
    pub level: CompressionLevel,
}

impl LocalStoreConfig {
    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }
}

/// Volumes stored as a directory of compressed brick files
pub struct LocalVolumeStore {
    runtime: Arc<Runtime>,
    config: LocalStoreConfig,
}

impl LocalVolumeStore {
    pub fn new() -> Result<Self> {
        Self::with_config(LocalStoreConfig::default())
    }

    pub fn with_config(config: LocalStoreConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
            config,
        })
    }

    pub fn config(&self) -> &LocalStoreConfig {
        &self.config
    }

    fn handle(&self, path: &str, access: VolumeDataAccess) -> Box<dyn VolumeHandle> {
        Box::new(LocalVolume {
            inner: Arc::new(LocalVolumeInner {
                path: path.to_string(),
                runtime: self.runtime.clone(),
                access,
                last_error: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl VolumeStore for LocalVolumeStore {
    fn open(&self, path: &str, connection: &str) -> Result<Box<dyn VolumeHandle>> {
        if !connection.is_empty() {
            debug!("Ignoring connection string for local volume {}", path);
        }
        let access = self
            .runtime
            .block_on(VolumeDataAccess::open(path, self.config.level))?;
        info!("Opened {}", access.stats().summary());
        Ok(self.handle(path, access))
    }

    fn create(
        &self,
        path: &str,
        connection: &str,
        layout: &VolumeDataLayout,
        metadata: &MetadataContainer,
    ) -> Result<Box<dyn VolumeHandle>> {
        if !connection.is_empty() {
            debug!("Ignoring connection string for local volume {}", path);
        }
        let document = VdsMetadata::new(layout.clone(), metadata.clone())
            .with_compression(self.config.compression);
        let access = self
            .runtime
            .block_on(VolumeDataAccess::create(path, document, self.config.level))?;
        info!("Created {} at {}", layout.summary(), path);
        Ok(self.handle(path, access))
    }
}

struct LocalVolumeInner {
    path: String,
    runtime: Arc<Runtime>,
    access: VolumeDataAccess,
    last_error: Mutex<Option<StoreError>>,
    closed: AtomicBool,
}

impl LocalVolumeInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VdsError::InvalidOperation(format!(
                "volume {} is closed",
                self.path
            )));
        }
        Ok(())
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            *self.last_error.lock() = Some(e.to_store_error());
        }
        result
    }

    fn read_subset(&self, request: &SubsetRequest) -> Result<Bytes> {
        self.check_open()?;
        if request.lod != 0 {
            return Err(VdsError::InvalidOperation(format!(
                "LOD {} is not stored",
                request.lod
            )));
        }
        let layout = self.access.layout();
        let channel = layout
            .channels
            .get(request.channel)
            .ok_or_else(|| VdsError::NotFound(format!("channel {}", request.channel)))?;
        if channel.format != request.format {
            return Err(VdsError::InvalidDataType(format!(
                "requested {} from a {} channel",
                request.format, channel.format
            )));
        }

        let fill = channel.encode_sample(request.replacement_no_value);
        self.runtime.block_on(self.access.read_subset(
            request.channel,
            &request.begin,
            &request.end,
            &fill,
        ))
    }
}

/// An open local volume
pub struct LocalVolume {
    inner: Arc<LocalVolumeInner>,
}

impl VolumeHandle for LocalVolume {
    fn layout(&self) -> VolumeDataLayout {
        self.inner.access.layout()
    }

    fn metadata(&self) -> MetadataContainer {
        self.inner.access.metadata().metadata
    }

    fn create_accessor(
        &self,
        channel: usize,
        mode: AccessMode,
        lod: usize,
    ) -> Result<Box<dyn PageAccessor>> {
        let result = self.inner.check_open().and_then(|_| {
            let layout = self.inner.access.layout();
            if channel >= layout.channels.len() {
                return Err(VdsError::NotFound(format!("channel {}", channel)));
            }
            if lod != 0 {
                return Err(VdsError::InvalidOperation(format!("LOD {} is not stored", lod)));
            }
            Ok(LocalPageAccessor {
                volume: self.inner.clone(),
                channel,
                mode,
                shape: layout.storage_shape(),
                edge: layout.brick_edge(),
                element_size: layout.channels[channel].element_size(),
                pending: HashMap::new(),
            })
        });
        let accessor = self.inner.record(result)?;
        debug!("Created {:?} accessor for channel {}", mode, channel);
        Ok(Box::new(accessor))
    }

    fn request_subset(&self, request: &SubsetRequest) -> Option<Bytes> {
        match self.inner.read_subset(request) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(
                    "Subset {:?}..{:?} of {} failed: {}",
                    request.begin, request.end, self.inner.path, e
                );
                *self.inner.last_error.lock() = Some(e.to_store_error());
                None
            }
        }
    }

    fn current_error(&self) -> Option<StoreError> {
        self.inner.last_error.lock().clone()
    }

    fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed {}", self.inner.path);
        }
        Ok(())
    }
}

/// Page accessor of a local volume channel.
///
/// Released pages stay in memory until [`PageAccessor::commit`] writes them.
struct LocalPageAccessor {
    volume: Arc<LocalVolumeInner>,
    channel: usize,
    mode: AccessMode,
    shape: Vec<usize>,
    edge: usize,
    element_size: usize,
    pending: HashMap<usize, Vec<u8>>,
}

impl LocalPageAccessor {
    fn check_chunk(&self, chunk: usize) -> Result<grid::ChunkBounds> {
        self.volume.check_open()?;
        let count = self.chunk_count();
        if chunk >= count {
            return Err(VdsError::InvalidOperation(format!(
                "chunk {} is outside the {} chunks of channel {}",
                chunk, count, self.channel
            )));
        }
        Ok(grid::bounds_of(chunk, &self.shape, self.edge))
    }

    fn writable(&self) -> bool {
        self.mode != AccessMode::ReadOnly
    }
}

impl PageAccessor for LocalPageAccessor {
    fn mode(&self) -> AccessMode {
        self.mode
    }

    fn chunk_count(&self) -> usize {
        grid::brick_count(&self.shape, self.edge)
    }

    fn create_page(&mut self, chunk: usize) -> Result<Page> {
        let bounds = self.check_chunk(chunk)?;
        if !self.writable() {
            return Err(VdsError::InvalidOperation(
                "cannot create pages through a read-only accessor".to_string(),
            ));
        }
        let on_disk = self
            .volume
            .runtime
            .block_on(self.volume.access.brick_exists(self.channel, chunk))?;
        if on_disk || self.pending.contains_key(&chunk) {
            return Err(VdsError::PageExists(chunk));
        }
        Ok(Page::filled(chunk, bounds, &vec![0; self.element_size], true))
    }

    fn read_page(&mut self, chunk: usize) -> Result<Page> {
        let bounds = self.check_chunk(chunk)?;
        if let Some(data) = self.pending.get(&chunk) {
            return Ok(Page::new(chunk, bounds, data, self.writable()));
        }
        let stored = self
            .volume
            .runtime
            .block_on(self.volume.access.read_brick(self.channel, chunk))?;
        Ok(match stored {
            Some(data) => Page::new(chunk, bounds, &data, self.writable()),
            None => Page::filled(chunk, bounds, &vec![0; self.element_size], self.writable()),
        })
    }

    fn release_page(&mut self, page: Page) -> Result<()> {
        if page.is_dirty() {
            self.pending.insert(page.chunk(), page.buffer().to_vec());
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.volume.check_open()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        // pending is cleared only once the bricks are written
        let mut bricks: Vec<(usize, Vec<u8>)> = self
            .pending
            .iter()
            .map(|(&chunk, data)| (chunk, data.clone()))
            .collect();
        bricks.sort_by_key(|(chunk, _)| *chunk);
        let count = bricks.len();
        let result = self
            .volume
            .runtime
            .block_on(self.volume.access.write_bricks(self.channel, bricks));
        self.volume.record(result)?;
        self.pending.clear();
        info!(
            "Committed {} chunks of channel {} to {}",
            count, self.channel, self.volume.path
        );
        Ok(())
    }
}

impl Drop for LocalPageAccessor {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "Discarding {} uncommitted chunks of channel {} in {}",
                self.pending.len(),
                self.channel,
                self.volume.path
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BrickSize, LayoutDescriptor};
    use crate::types::{AxisDescriptor, ChannelDescriptor, Components};
    use tempfile::TempDir;

    fn test_layout() -> VolumeDataLayout {
        VolumeDataLayout::new(
            vec![
                AxisDescriptor::unitless(100, "Sample"),
                AxisDescriptor::unitless(10, "Crossline"),
                AxisDescriptor::unitless(3, "Inline"),
            ],
            vec![
                ChannelDescriptor::new("Amplitude", Format::R32),
                ChannelDescriptor::new("Dip", Format::U8).with_components(Components::Two),
            ],
            LayoutDescriptor::default().with_brick_size(BrickSize::BrickSize64),
        )
        .unwrap()
    }

    fn create_volume(dir: &TempDir) -> (LocalVolumeStore, Box<dyn VolumeHandle>) {
        let store = LocalVolumeStore::new().unwrap();
        let path = dir.path().join("volume.vds");
        let handle = store
            .create(path.to_str().unwrap(), "", &test_layout(), &MetadataContainer::new())
            .unwrap();
        (store, handle)
    }

    fn request(begin: [usize; 6], end: [usize; 6], channel: usize, format: Format) -> SubsetRequest {
        SubsetRequest {
            begin,
            end,
            channel,
            lod: 0,
            format,
            replacement_no_value: 0.0,
        }
    }

    #[test]
    fn test_page_buffers() {
        let mut page = Page::filled(0, ([0, 0, 0], [2, 2, 1]), &1.5f32.to_ne_bytes(), true);
        assert_eq!(page.typed::<f32>().unwrap(), &[1.5; 4]);
        assert!(!page.is_dirty());
        page.typed_mut::<f32>().unwrap()[3] = -2.0;
        assert!(page.is_dirty());
        assert_eq!(page.typed::<f32>().unwrap()[3], -2.0);
        assert!(page.typed::<f64>().is_err());

        let mut read_only = Page::new(1, ([0, 0, 0], [1, 1, 1]), &[9], false);
        assert!(read_only.buffer_mut().is_err());
        assert_eq!(read_only.buffer(), &[9]);
    }

    #[test]
    fn test_missing_volume_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumeStore::new().unwrap();
        let path = dir.path().join("missing.vds");
        assert!(matches!(
            store.open(path.to_str().unwrap(), ""),
            Err(VdsError::NotFound(_))
        ));
    }

    #[test]
    fn test_pages_commit_and_reopen() {
        let dir = TempDir::new().unwrap();
        let (store, handle) = create_volume(&dir);

        let mut accessor = handle.create_accessor(0, AccessMode::Create, 0).unwrap();
        assert_eq!(accessor.chunk_count(), 2);
        let mut page = accessor.create_page(1).unwrap();
        assert_eq!(page.bounds(), ([64, 0, 0], [100, 10, 3]));
        page.typed_mut::<f32>().unwrap().fill(4.0);
        accessor.release_page(page).unwrap();

        // pending pages count as existing
        assert!(matches!(accessor.create_page(1), Err(VdsError::PageExists(1))));
        accessor.commit().unwrap();
        assert!(matches!(accessor.create_page(1), Err(VdsError::PageExists(1))));
        handle.close().unwrap();

        let path = dir.path().join("volume.vds");
        let reopened = store.open(path.to_str().unwrap(), "").unwrap();
        let data = reopened
            .request_subset(&request([60, 0, 0, 0, 0, 0], [70, 1, 1, 1, 1, 1], 0, Format::R32))
            .unwrap();
        let values: Vec<f32> = crate::utils::bytes_to_typed_data(&data).unwrap();
        assert_eq!(values, [&[0.0; 4][..], &[4.0; 6][..]].concat());

        let mut reader = reopened.create_accessor(0, AccessMode::ReadOnly, 0).unwrap();
        let page = reader.read_page(1).unwrap();
        assert!(!page.is_writable());
        assert!(page.typed::<f32>().unwrap().iter().all(|&v| v == 4.0));
        assert!(reader.create_page(0).is_err());
    }

    #[test]
    fn test_failed_commit_keeps_pending_pages() {
        let dir = TempDir::new().unwrap();
        let (_store, handle) = create_volume(&dir);

        let mut accessor = handle.create_accessor(0, AccessMode::ReadWrite, 0).unwrap();
        let mut page = accessor.read_page(0).unwrap();
        page.typed_mut::<f32>().unwrap().fill(7.0);
        accessor.release_page(page).unwrap();

        // a directory where the brick is staged makes the write fail
        let staging = dir
            .path()
            .join("volume.vds")
            .join(crate::utils::brick_path(0, 0, 0))
            .with_extension("partial");
        std::fs::create_dir_all(&staging).unwrap();
        assert!(matches!(
            accessor.commit(),
            Err(VdsError::Write { chunk: 0, .. })
        ));
        assert!(handle.current_error().is_some());
        assert!(matches!(accessor.create_page(0), Err(VdsError::PageExists(0))));

        std::fs::remove_dir(&staging).unwrap();
        accessor.commit().unwrap();
        let data = handle
            .request_subset(&request([0; 6], [1; 6], 0, Format::R32))
            .unwrap();
        assert_eq!(&data[..], &7.0f32.to_ne_bytes());
    }

    #[test]
    fn test_unreleased_pages_are_not_committed() {
        let dir = TempDir::new().unwrap();
        let (_store, handle) = create_volume(&dir);

        let mut accessor = handle.create_accessor(0, AccessMode::ReadWrite, 0).unwrap();
        let mut page = accessor.read_page(0).unwrap();
        page.typed_mut::<f32>().unwrap().fill(1.0);
        drop(page);
        accessor.commit().unwrap();

        let data = handle
            .request_subset(&request([0; 6], [1; 6], 0, Format::R32))
            .unwrap();
        assert_eq!(&data[..], &0.0f32.to_ne_bytes());
    }

    #[test]
    fn test_replacement_value_fills_unwritten_bricks() {
        let dir = TempDir::new().unwrap();
        let (_store, handle) = create_volume(&dir);

        let mut req = request([0, 0, 0, 0, 0, 0], [2, 1, 1, 1, 1, 1], 1, Format::U8);
        req.replacement_no_value = 7.0;
        let data = handle.request_subset(&req).unwrap();
        assert_eq!(&data[..], &[7, 7, 7, 7]);
    }

    #[test]
    fn test_failed_requests_report_errors() {
        let dir = TempDir::new().unwrap();
        let (_store, handle) = create_volume(&dir);
        assert!(handle.current_error().is_none());

        let bad = request([0; 6], [101, 1, 1, 1, 1, 1], 0, Format::R32);
        assert!(handle.request_subset(&bad).is_none());
        assert!(handle.current_error().is_some());

        let wrong_format = request([0; 6], [1; 6], 0, Format::R64);
        assert!(handle.request_subset(&wrong_format).is_none());

        assert!(handle.create_accessor(5, AccessMode::ReadOnly, 0).is_err());
        assert!(handle.create_accessor(0, AccessMode::ReadOnly, 1).is_err());

        handle.close().unwrap();
        assert!(handle.request_subset(&request([0; 6], [1; 6], 0, Format::R32)).is_none());
        assert!(handle.close().is_ok());
    }
}
