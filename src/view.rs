//! Volume views: typed subset reads, chunk-by-chunk writes and volume creation.
//!
//! Everything a view exposes is in user order, the reverse of the order the
//! store keeps axes in. Reads go through one subset request; writes go through
//! [`Chunk`]s, one brick of one channel each, and become visible to reads
//! after [`Channel::commit`].

use crate::composite::VolumeSubset;
use crate::error::{Result, StoreError, VdsError};
use crate::grid::{self, ChunkBounds};
use crate::key::{to_storage_axes, to_storage_order, to_user_order, translate, Index};
use crate::layout::{LayoutDescriptor, LayoutOptions, LodLevels, VolumeDataLayout};
use crate::metadata::MetadataContainer;
use crate::store::{
    AccessMode, LocalStoreConfig, LocalVolumeStore, Page, PageAccessor, SubsetRequest,
    VolumeHandle, VolumeStore,
};
use crate::types::{AxisDescriptor, ChannelDescriptor, Element};
use crate::utils::bytes_to_typed_data;
use ndarray::{
    ArrayBase, ArrayD, ArrayView, ArrayViewD, ArrayViewMutD, AsArray, Axis, Dimension, IxDyn, RawData,
    Slice,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remove the axes flagged in `scalar`, highest first so indices stay valid
pub(crate) fn squeeze<S: RawData>(
    mut array: ArrayBase<S, IxDyn>,
    scalar: &[bool],
) -> ArrayBase<S, IxDyn> {
    for axis in (0..scalar.len()).rev() {
        if scalar[axis] {
            array = array.index_axis_move(Axis(axis), 0);
        }
    }
    array
}

fn slice_for(ranges: &[Range<usize>], axis: usize) -> Slice {
    ranges
        .get(axis)
        .map_or(Slice::from(..), |r| Slice::from(r.clone()))
}

/// User-order ranges covered by a storage-order chunk
fn user_ranges(bounds: &ChunkBounds, dimensionality: usize) -> Vec<Range<usize>> {
    let (min, max) = bounds;
    let storage: Vec<Range<usize>> = (0..dimensionality).map(|i| min[i]..max[i]).collect();
    to_user_order(&storage)
}

/// Selects a channel by position or by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelector {
    Index(usize),
    Name(String),
}

impl From<usize> for ChannelSelector {
    fn from(index: usize) -> Self {
        ChannelSelector::Index(index)
    }
}

impl From<&str> for ChannelSelector {
    fn from(name: &str) -> Self {
        ChannelSelector::Name(name.to_string())
    }
}

impl From<String> for ChannelSelector {
    fn from(name: String) -> Self {
        ChannelSelector::Name(name)
    }
}

/// Initial content of one channel, in user order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelBuffer {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    R32(ArrayD<f32>),
    R64(ArrayD<f64>),
}

macro_rules! impl_channel_buffer_from {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<ArrayD<$ty>> for ChannelBuffer {
                fn from(array: ArrayD<$ty>) -> Self {
                    ChannelBuffer::$variant(array)
                }
            }
        )*
    };
}

impl_channel_buffer_from!(u8 => U8, u16 => U16, u32 => U32, u64 => U64, f32 => R32, f64 => R64);

macro_rules! with_buffer {
    ($buffer:expr, $array:ident => $body:expr) => {
        match $buffer {
            ChannelBuffer::U8($array) => $body,
            ChannelBuffer::U16($array) => $body,
            ChannelBuffer::U32($array) => $body,
            ChannelBuffer::U64($array) => $body,
            ChannelBuffer::R32($array) => $body,
            ChannelBuffer::R64($array) => $body,
        }
    };
}

impl ChannelBuffer {
    pub fn shape(&self) -> &[usize] {
        with_buffer!(self, array => array.shape())
    }

    fn check(&self, channel: &ChannelDescriptor, expected_shape: &[usize]) -> Result<()> {
        fn check_format<T: Element>(_: &ArrayD<T>, channel: &ChannelDescriptor) -> Result<()> {
            T::check_format(channel.format)
        }
        with_buffer!(self, array => check_format(array, channel))?;

        if self.shape() != expected_shape {
            return Err(VdsError::ShapeMismatch(format!(
                "buffer for channel '{}' has shape {:?}, expected {:?}",
                channel.name,
                self.shape(),
                expected_shape
            )));
        }
        Ok(())
    }

    fn write_pages(&self, accessor: &mut dyn PageAccessor, layout: &VolumeDataLayout) -> Result<()> {
        with_buffer!(self, array => write_pages(accessor, layout, array.view()))
    }
}

/// How a new volume's channels are initialised
#[derive(Debug, Clone, Default, PartialEq)]
pub enum InitPolicy {
    /// Every sample zero
    #[default]
    Zero,
    /// Every sample NaN; integer formats fall back to zero
    NaN,
    /// One buffer per channel, each shaped like the volume
    Data(Vec<ChannelBuffer>),
}

/// Everything needed to create a volume
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Axes in user order
    pub axes: Vec<AxisDescriptor>,
    pub channels: Vec<ChannelDescriptor>,
    pub layout: LayoutDescriptor,
    pub metadata: MetadataContainer,
    pub init: InitPolicy,
    pub store: LocalStoreConfig,
}

impl CreateOptions {
    /// Options for a volume with the given user-order axes and channels
    pub fn new(axes: Vec<AxisDescriptor>, channels: Vec<ChannelDescriptor>) -> Self {
        Self {
            axes,
            channels,
            ..Self::default()
        }
    }

    /// Unitless axes named `Dim0`, `Dim1`, ... for a user-order shape
    pub fn from_shape(shape: &[usize], channels: Vec<ChannelDescriptor>) -> Self {
        let axes = shape
            .iter()
            .enumerate()
            .map(|(i, &samples)| AxisDescriptor::unitless(samples, format!("Dim{}", i)))
            .collect();
        Self::new(axes, channels)
    }

    pub fn with_layout(mut self, layout: LayoutDescriptor) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataContainer) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_init(mut self, init: InitPolicy) -> Self {
        self.init = init;
        self
    }

    pub fn with_store_config(mut self, store: LocalStoreConfig) -> Self {
        self.store = store;
        self
    }

    fn build_layout(&self) -> Result<VolumeDataLayout> {
        VolumeDataLayout::new(
            to_storage_axes(&self.axes),
            self.channels.clone(),
            self.layout,
        )
    }

    fn validate_init(&self, layout: &VolumeDataLayout) -> Result<()> {
        if let InitPolicy::Data(buffers) = &self.init {
            if buffers.len() != layout.channels.len() {
                return Err(VdsError::ShapeMismatch(format!(
                    "{} initial buffers for {} channels",
                    buffers.len(),
                    layout.channels.len()
                )));
            }
            for (buffer, channel) in buffers.iter().zip(layout.channels.iter()) {
                buffer.check(channel, &channel.array_shape(&layout.shape()))?;
            }
        }
        Ok(())
    }
}

/// Released pages held in memory before a bulk write commits them
const PAGES_PER_COMMIT: usize = 8;

/// Commit after every [`PAGES_PER_COMMIT`] released pages
fn release_batched(accessor: &mut dyn PageAccessor, page: Page) -> Result<()> {
    let chunk = page.chunk();
    accessor.release_page(page)?;
    if (chunk + 1) % PAGES_PER_COMMIT == 0 {
        accessor.commit()?;
    }
    Ok(())
}

/// Fill every page of an accessor with one encoded sample
fn fill_pages(accessor: &mut dyn PageAccessor, sample: &[u8]) -> Result<()> {
    for chunk in 0..accessor.chunk_count() {
        let mut page = accessor.create_page(chunk)?;
        for element in page.buffer_mut()?.chunks_exact_mut(sample.len()) {
            element.copy_from_slice(sample);
        }
        release_batched(accessor, page)?;
    }
    accessor.commit()
}

fn page_for_write(accessor: &mut dyn PageAccessor, chunk: usize) -> Result<Page> {
    match accessor.create_page(chunk) {
        Err(VdsError::PageExists(_)) => accessor.read_page(chunk),
        page => page,
    }
}

/// Copy a user-order array into every page of an accessor
fn write_pages<T: Element>(
    accessor: &mut dyn PageAccessor,
    layout: &VolumeDataLayout,
    data: ArrayViewD<'_, T>,
) -> Result<()> {
    for chunk in 0..accessor.chunk_count() {
        let mut page = page_for_write(accessor, chunk)?;
        let ranges = user_ranges(&page.bounds(), layout.dimensionality());
        let source = data.slice_each_axis(|ax| slice_for(&ranges, ax.axis.index()));
        // the page is C-ordered over the user-order region
        for (dst, src) in page.typed_mut::<T>()?.iter_mut().zip(source.iter()) {
            *dst = *src;
        }
        release_batched(accessor, page)?;
    }
    accessor.commit()
}

fn initialize(handle: &dyn VolumeHandle, layout: &VolumeDataLayout, init: &InitPolicy) -> Result<()> {
    for (index, channel) in layout.channels.iter().enumerate() {
        let sample = match init {
            InitPolicy::Zero => channel.encode_sample(0.0),
            InitPolicy::NaN => channel.encode_sample(f64::NAN),
            InitPolicy::Data(_) => Vec::new(),
        };
        // unwritten bricks already read as zero
        if !sample.is_empty() && sample.iter().all(|&b| b == 0) {
            debug!("Channel '{}' left unwritten (zero fill)", channel.name);
            continue;
        }

        let mut accessor = handle.create_accessor(index, AccessMode::Create, 0)?;
        match init {
            InitPolicy::Data(buffers) => buffers[index].write_pages(accessor.as_mut(), layout)?,
            _ => fill_pages(accessor.as_mut(), &sample)?,
        }
        debug!("Initialized channel '{}'", channel.name);
    }
    Ok(())
}

fn open_error(path: &str, error: VdsError) -> VdsError {
    VdsError::StoreOpen {
        path: path.to_string(),
        code: error.code(),
        message: error.to_string(),
    }
}

struct AccessorSlot {
    accessor: Box<dyn PageAccessor>,
    /// Bumped on every commit; chunks from older generations are stale
    generation: u64,
}

type SharedAccessor = Arc<Mutex<AccessorSlot>>;

/// One open volume
pub struct VolumeView {
    path: String,
    handle: Box<dyn VolumeHandle>,
    layout: VolumeDataLayout,
    metadata: MetadataContainer,
    accessors: Mutex<HashMap<(usize, AccessMode), SharedAccessor>>,
    closed: bool,
}

impl VolumeView {
    /// Open a volume from the local filesystem
    pub fn open(path: &str, connection: &str) -> Result<Self> {
        let store = LocalVolumeStore::new()?;
        Self::open_with(&store, path, connection)
    }

    /// Open a volume from any store
    pub fn open_with(store: &dyn VolumeStore, path: &str, connection: &str) -> Result<Self> {
        let handle = store
            .open(path, connection)
            .map_err(|e| open_error(path, e))?;
        Ok(Self::from_handle(path, handle))
    }

    /// Create a volume on the local filesystem and open it
    pub fn create(path: &str, connection: &str, options: CreateOptions) -> Result<Self> {
        let store = LocalVolumeStore::with_config(options.store)?;
        Self::create_with(&store, path, connection, options)
    }

    /// Create a volume in any store and open it.
    ///
    /// The layout, the brick allocation size and any initial buffers are all
    /// checked before the store is touched.
    pub fn create_with(
        store: &dyn VolumeStore,
        path: &str,
        connection: &str,
        options: CreateOptions,
    ) -> Result<Self> {
        let layout = options.build_layout()?;
        layout.check_block_size()?;
        options.validate_init(&layout)?;

        let handle = store.create(path, connection, &layout, &options.metadata)?;
        let initialized = initialize(handle.as_ref(), &layout, &options.init);
        let closed = handle.close();
        initialized?;
        closed?;
        info!("Created {}", layout.summary());

        Self::open_with(store, path, connection)
    }

    /// Open the volume at `path`, creating it first if there is none
    pub fn open_or_create(path: &str, connection: &str, options: CreateOptions) -> Result<Self> {
        let store = LocalVolumeStore::with_config(options.store)?;
        match store.open(path, connection) {
            Ok(handle) => Ok(Self::from_handle(path, handle)),
            Err(VdsError::NotFound(_)) => {
                info!("No volume at {}, creating one", path);
                Self::create_with(&store, path, connection, options)
            }
            Err(e) => Err(open_error(path, e)),
        }
    }

    fn from_handle(path: &str, handle: Box<dyn VolumeHandle>) -> Self {
        let layout = handle.layout();
        let metadata = handle.metadata();
        debug!("Opened view of {} ({})", path, layout.summary());
        Self {
            path: path.to_string(),
            handle,
            layout,
            metadata,
            accessors: Mutex::new(HashMap::new()),
            closed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn layout(&self) -> &VolumeDataLayout {
        &self.layout
    }

    /// Sample counts in user order
    pub fn shape(&self) -> Vec<usize> {
        self.layout.shape()
    }

    /// Axis descriptors in user order
    pub fn axes(&self) -> Vec<AxisDescriptor> {
        to_user_order(&self.layout.axes)
    }

    /// `(name, unit, samples)` per axis, user order
    pub fn axis_descriptors(&self) -> Vec<(&str, &str, usize)> {
        self.layout
            .axes
            .iter()
            .rev()
            .map(|a| (a.name.as_str(), a.unit.as_str(), a.samples))
            .collect()
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.layout.channels
    }

    /// Edge length of a brick
    pub fn databrick_size(&self) -> usize {
        self.layout.brick_edge()
    }

    pub fn lod(&self) -> LodLevels {
        self.layout.descriptor.lod_levels
    }

    pub fn metadata(&self) -> &MetadataContainer {
        &self.metadata
    }

    pub fn negative_margin(&self) -> usize {
        self.layout.descriptor.negative_margin
    }

    pub fn positive_margin(&self) -> usize {
        self.layout.descriptor.positive_margin
    }

    pub fn full_resolution_dimension(&self) -> usize {
        self.layout.descriptor.full_resolution_dimension
    }

    pub fn brick_size_2d_multiplier(&self) -> usize {
        self.layout.descriptor.brick_size_2d_multiplier
    }

    pub fn options(&self) -> LayoutOptions {
        self.layout.descriptor.options
    }

    /// Number of chunks per channel
    pub fn chunk_count(&self) -> usize {
        grid::brick_count(&self.layout.storage_shape(), self.layout.brick_edge())
    }

    /// Nearest sample index for a user-order world coordinate
    pub fn sample_position(&self, coords: &[f64]) -> Result<Vec<usize>> {
        let axes = self.axes();
        if coords.len() != axes.len() {
            return Err(VdsError::InvalidKey(format!(
                "{} coordinates for a {}D volume",
                coords.len(),
                axes.len()
            )));
        }
        Ok(axes
            .iter()
            .zip(coords.iter())
            .map(|(axis, &coord)| axis.coord_to_index(coord))
            .collect())
    }

    pub fn channel(&self, selector: impl Into<ChannelSelector>) -> Result<Channel<'_>> {
        let index = match selector.into() {
            ChannelSelector::Index(index) if index < self.layout.channels.len() => index,
            ChannelSelector::Index(index) => {
                return Err(VdsError::NotFound(format!("channel {}", index)));
            }
            ChannelSelector::Name(name) => self
                .layout
                .channel_index(&name)
                .ok_or_else(|| VdsError::NotFound(format!("channel '{}'", name)))?,
        };
        Ok(Channel { view: self, index })
    }

    /// Read from channel 0
    pub fn read<T: Element>(&self, key: &[Index]) -> Result<ArrayD<T>> {
        self.read_channel(0, key)
    }

    fn read_channel<T: Element>(&self, index: usize, key: &[Index]) -> Result<ArrayD<T>> {
        let channel = &self.layout.channels[index];
        T::check_format(channel.format)?;
        let translated = translate(key, &self.shape())?;
        let (begin, end) = to_storage_order(&translated.begin, &translated.end);

        let request = SubsetRequest {
            begin,
            end,
            channel: index,
            lod: 0,
            format: channel.format,
            replacement_no_value: 0.0,
        };
        let Some(data) = self.handle.request_subset(&request) else {
            let error = self
                .handle
                .current_error()
                .unwrap_or_else(|| StoreError::new(-1, "store returned no data"));
            return Err(VdsError::Read {
                begin: translated.begin,
                end: translated.end,
                code: error.code,
                message: error.message,
            });
        };

        let values = bytes_to_typed_data::<T>(&data)?;
        let shape = channel.array_shape(&translated.dims());
        let array = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| VdsError::ShapeMismatch(e.to_string()))?;
        Ok(squeeze(array, &translated.scalar))
    }

    fn accessor(&self, channel: usize, mode: AccessMode) -> Result<SharedAccessor> {
        let mut accessors = self.accessors.lock();
        if let Some(shared) = accessors.get(&(channel, mode)) {
            return Ok(shared.clone());
        }
        let accessor = self.handle.create_accessor(channel, mode, 0)?;
        let shared = Arc::new(Mutex::new(AccessorSlot {
            accessor,
            generation: 0,
        }));
        accessors.insert((channel, mode), shared.clone());
        Ok(shared)
    }

    /// Release the store handle. Uncommitted chunk writes are discarded.
    pub fn close(mut self) -> Result<()> {
        self.close_handle()
    }

    fn close_handle(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.accessors.lock().clear();
        self.handle.close()
    }
}

impl Drop for VolumeView {
    fn drop(&mut self) {
        if let Err(e) = self.close_handle() {
            warn!("Closing {} failed: {}", self.path, e);
        }
    }
}

/// One channel of a view
#[derive(Clone, Copy)]
pub struct Channel<'v> {
    view: &'v VolumeView,
    index: usize,
}

impl<'v> Channel<'v> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &'v ChannelDescriptor {
        &self.view.layout.channels[self.index]
    }

    /// Spatial shape in user order, without the component axis
    pub fn shape(&self) -> Vec<usize> {
        self.view.shape()
    }

    pub fn read<T: Element>(&self, key: &[Index]) -> Result<ArrayD<T>> {
        self.view.read_channel(self.index, key)
    }

    pub fn chunk_count(&self) -> usize {
        self.view.chunk_count()
    }

    /// All chunks of the channel, in chunk-number order
    pub fn chunks(&self) -> Result<ChunkIter> {
        Ok(ChunkIter {
            factory: self.chunk_factory()?,
            next: 0,
            count: self.chunk_count(),
        })
    }

    pub fn chunk(&self, number: usize) -> Result<Chunk> {
        let count = self.chunk_count();
        if number >= count {
            return Err(VdsError::OutOfRange {
                axis: 0,
                begin: number as i64,
                end: number as i64 + 1,
                len: count,
            });
        }
        Ok(self.chunk_factory()?.make(number))
    }

    fn chunk_factory(&self) -> Result<ChunkFactory> {
        let layout = &self.view.layout;
        Ok(ChunkFactory {
            channel: self.index,
            descriptor: self.descriptor().clone(),
            storage_shape: layout.storage_shape(),
            edge: layout.brick_edge(),
            accessor: self.view.accessor(self.index, AccessMode::ReadWrite)?,
        })
    }

    /// Persist the writes of every released chunk.
    ///
    /// Chunks obtained before the commit can no longer be used.
    pub fn commit(&self) -> Result<()> {
        let slots: Vec<SharedAccessor> = self
            .view
            .accessors
            .lock()
            .iter()
            .filter(|((channel, mode), _)| *channel == self.index && *mode != AccessMode::ReadOnly)
            .map(|(_, shared)| shared.clone())
            .collect();
        if slots.is_empty() {
            return Err(VdsError::AccessorNotInitialized(self.index));
        }

        for shared in slots {
            let mut slot = shared.lock();
            slot.accessor.commit()?;
            slot.generation += 1;
        }
        debug!("Committed channel '{}'", self.descriptor().name);
        Ok(())
    }

    /// Overwrite the whole channel with a user-order array and commit
    pub fn write_all<T: Element>(&self, data: ArrayViewD<'_, T>) -> Result<()> {
        let descriptor = self.descriptor();
        T::check_format(descriptor.format)?;
        let expected = descriptor.array_shape(&self.shape());
        if data.shape() != expected.as_slice() {
            return Err(VdsError::ShapeMismatch(format!(
                "cannot write {:?} into channel '{}' of shape {:?}",
                data.shape(),
                descriptor.name,
                expected
            )));
        }

        let shared = self.view.accessor(self.index, AccessMode::ReadWrite)?;
        let mut slot = shared.lock();
        write_pages(slot.accessor.as_mut(), &self.view.layout, data)?;
        slot.accessor.commit()?;
        slot.generation += 1;
        Ok(())
    }
}

struct ChunkFactory {
    channel: usize,
    descriptor: ChannelDescriptor,
    storage_shape: Vec<usize>,
    edge: usize,
    accessor: SharedAccessor,
}

impl ChunkFactory {
    fn make(&self, number: usize) -> Chunk {
        let bounds = grid::bounds_of(number, &self.storage_shape, self.edge);
        let dims = user_ranges(&bounds, self.storage_shape.len())
            .iter()
            .map(|r| r.len())
            .collect();
        Chunk {
            number,
            channel: self.channel,
            descriptor: self.descriptor.clone(),
            bounds,
            dims,
            generation: self.accessor.lock().generation,
            accessor: self.accessor.clone(),
            state: ChunkState::Unmaterialized,
        }
    }
}

/// Lazy iterator over the chunks of a channel
pub struct ChunkIter {
    factory: ChunkFactory,
    next: usize,
    count: usize,
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.count {
            return None;
        }
        let chunk = self.factory.make(self.next);
        self.next += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}

/// How a chunk's page was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    Read,
    Write,
}

enum ChunkState {
    Unmaterialized,
    Materialized { page: Page, mode: PageMode },
    Released,
}

/// One brick of one channel.
///
/// The page behind a chunk is fetched on first access, for reading or for
/// writing. A chunk first read cannot be written; one first written can still
/// be read back. A chunk must be released before the channel commits for its
/// writes to be kept.
pub struct Chunk {
    number: usize,
    channel: usize,
    descriptor: ChannelDescriptor,
    bounds: ChunkBounds,
    /// Extents in user order
    dims: Vec<usize>,
    accessor: SharedAccessor,
    generation: u64,
    state: ChunkState,
}

impl Chunk {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Bounds in store order
    pub fn storage_bounds(&self) -> ChunkBounds {
        self.bounds
    }

    /// The region of the volume covered by this chunk, user order
    pub fn ranges(&self) -> Vec<Range<usize>> {
        user_ranges(&self.bounds, self.dims.len())
    }

    /// [`Chunk::ranges`] as a key into the whole volume
    pub fn key(&self) -> Vec<Index> {
        self.ranges().into_iter().map(Index::from).collect()
    }

    /// Extents in user order
    pub fn shape(&self) -> &[usize] {
        &self.dims
    }

    pub fn mode(&self) -> Option<PageMode> {
        match &self.state {
            ChunkState::Materialized { mode, .. } => Some(*mode),
            _ => None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, ChunkState::Released)
    }

    fn check_live(&self, slot: &AccessorSlot) -> Result<()> {
        if self.is_released() {
            return Err(VdsError::InvalidOperation(format!(
                "chunk {} was released",
                self.number
            )));
        }
        if slot.generation != self.generation {
            return Err(VdsError::InvalidOperation(format!(
                "chunk {} was opened before the last commit",
                self.number
            )));
        }
        Ok(())
    }

    fn materialize(&mut self, wanted: PageMode) -> Result<&mut Page> {
        let shared = self.accessor.clone();
        let mut slot = shared.lock();
        self.check_live(&slot)?;

        if matches!(self.state, ChunkState::Unmaterialized) {
            let page = match wanted {
                PageMode::Read => slot.accessor.read_page(self.number)?,
                PageMode::Write => page_for_write(slot.accessor.as_mut(), self.number)?,
            };
            self.state = ChunkState::Materialized { page, mode: wanted };
        }

        match &mut self.state {
            ChunkState::Materialized { mode, .. }
                if wanted == PageMode::Write && *mode == PageMode::Read =>
            {
                Err(VdsError::InvalidOperation(format!(
                    "chunk {} was opened for reading",
                    self.number
                )))
            }
            ChunkState::Materialized { page, .. } => Ok(page),
            _ => Err(VdsError::InvalidOperation(format!(
                "chunk {} has no page",
                self.number
            ))),
        }
    }

    /// Read part of the chunk; `key` is relative to the chunk's own extents
    pub fn read<T: Element>(&mut self, key: &[Index]) -> Result<ArrayD<T>> {
        T::check_format(self.descriptor.format)?;
        let translated = translate(key, &self.dims)?;
        let shape = self.descriptor.array_shape(&self.dims);

        let page = self.materialize(PageMode::Read)?;
        let view = ArrayViewD::from_shape(IxDyn(&shape), page.typed::<T>()?)
            .map_err(|e| VdsError::ShapeMismatch(e.to_string()))?;
        let ranges = translated.ranges();
        let selected = view.slice_each_axis(|ax| slice_for(&ranges, ax.axis.index()));
        Ok(squeeze(selected, &translated.scalar).to_owned())
    }

    /// Write `value`, broadcast to the selected region, into the chunk
    pub fn write<'a, T, D, V>(&mut self, key: &[Index], value: V) -> Result<()>
    where
        T: Element,
        D: Dimension,
        V: AsArray<'a, T, D>,
    {
        T::check_format(self.descriptor.format)?;
        let value: ArrayView<'a, T, D> = value.into();
        let value = value.into_dyn();
        let translated = translate(key, &self.dims)?;
        let target = self.descriptor.array_shape(&translated.squeezed_dims());
        let value = value.broadcast(IxDyn(&target)).ok_or_else(|| {
            VdsError::ShapeMismatch(format!(
                "cannot broadcast {:?} to {:?} in chunk {}",
                value.shape(),
                target,
                self.number
            ))
        })?;
        let shape = self.descriptor.array_shape(&self.dims);

        let page = self.materialize(PageMode::Write)?;
        let mut view = ArrayViewMutD::from_shape(IxDyn(&shape), page.typed_mut::<T>()?)
            .map_err(|e| VdsError::ShapeMismatch(e.to_string()))?;
        let ranges = translated.ranges();
        let selected = view.slice_each_axis_mut(|ax| slice_for(&ranges, ax.axis.index()));
        squeeze(selected, &translated.scalar).assign(&value);
        Ok(())
    }

    /// Hand the chunk's page back to its accessor
    pub fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ChunkState::Released) {
            ChunkState::Released => Err(VdsError::DoubleRelease(self.number)),
            ChunkState::Unmaterialized => Ok(()),
            ChunkState::Materialized { page, .. } => {
                let mut slot = self.accessor.lock();
                if slot.generation != self.generation {
                    return Err(VdsError::InvalidOperation(format!(
                        "chunk {} was released after its accessor committed",
                        self.number
                    )));
                }
                slot.accessor.release_page(page)
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let ChunkState::Materialized { mode, .. } = &self.state {
            warn!(
                "Chunk {} of channel {} dropped without release ({:?} page discarded)",
                self.number, self.channel, mode
            );
        }
    }
}

impl<T: Element> VolumeSubset<T> for VolumeView {
    fn shape(&self) -> Vec<usize> {
        VolumeView::shape(self)
    }

    fn read(&self, key: &[Index]) -> Result<ArrayD<T>> {
        self.read_channel(0, key)
    }
}

impl<T: Element> VolumeSubset<T> for Channel<'_> {
    fn shape(&self) -> Vec<usize> {
        Channel::shape(self)
    }

    fn read(&self, key: &[Index]) -> Result<ArrayD<T>> {
        self.view.read_channel(self.index, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;
    use crate::layout::BrickSize;
    use crate::types::{Components, Format};
    use ndarray::{arr0, Array, Array3};
    use tempfile::TempDir;

    fn options(shape: &[usize], format: Format) -> CreateOptions {
        CreateOptions::from_shape(shape, vec![ChannelDescriptor::new("Amplitude", format)])
            .with_layout(LayoutDescriptor::default().with_brick_size(BrickSize::BrickSize64))
    }

    fn volume_path(dir: &TempDir) -> String {
        dir.path().join("test.vds").to_str().unwrap().to_string()
    }

    #[test]
    fn test_squeeze() {
        let array = ArrayD::<u8>::zeros(IxDyn(&[2, 1, 3, 1]));
        assert_eq!(squeeze(array.clone(), &[false, true, false, true]).shape(), &[2, 3]);
        assert_eq!(squeeze(array.view(), &[false; 4]).shape(), &[2, 1, 3, 1]);
    }

    #[test]
    fn test_create_and_describe() {
        let dir = TempDir::new().unwrap();
        let axes = vec![
            AxisDescriptor::new(20, "Inline", "", 100.0, 119.0),
            AxisDescriptor::new(70, "Crossline", "", 0.0, 69.0),
            AxisDescriptor::new(30, "Sample", "ms", 0.0, 116.0),
        ];
        let channels = vec![
            ChannelDescriptor::new("Amplitude", Format::R32),
            ChannelDescriptor::new("Mask", Format::U8),
        ];
        let view = VolumeView::create(
            &volume_path(&dir),
            "",
            CreateOptions::new(axes, channels)
                .with_layout(LayoutDescriptor::default().with_brick_size(BrickSize::BrickSize64)),
        )
        .unwrap();

        assert_eq!(view.shape(), vec![20, 70, 30]);
        assert_eq!(view.layout().storage_shape(), vec![30, 70, 20]);
        assert_eq!(view.axes()[0].name, "Inline");
        assert_eq!(view.axis_descriptors()[2], ("Sample", "ms", 30));
        assert_eq!(view.databrick_size(), 64);
        assert_eq!(view.chunk_count(), 2);
        assert_eq!(view.channels().len(), 2);
        assert_eq!(view.sample_position(&[110.0, 3.2, 8.0]).unwrap(), vec![10, 3, 2]);
        assert!(view.sample_position(&[1.0]).is_err());

        assert_eq!(view.channel("Mask").unwrap().index(), 1);
        assert!(matches!(view.channel("Missing"), Err(VdsError::NotFound(_))));
        assert!(matches!(view.channel(2), Err(VdsError::NotFound(_))));

        // zero initialised
        let mask: ArrayD<u8> = view.channel("Mask").unwrap().read(&key![..]).unwrap();
        assert!(mask.iter().all(|&v| v == 0));
        view.close().unwrap();
    }

    #[test]
    fn test_read_shapes_and_squeeze() {
        let dir = TempDir::new().unwrap();
        let view = VolumeView::create(&volume_path(&dir), "", options(&[6, 5, 4], Format::R64)).unwrap();

        let full: ArrayD<f64> = view.read(&key![.., .., ..]).unwrap();
        assert_eq!(full.shape(), view.shape().as_slice());
        let row: ArrayD<f64> = view.read(&key![2]).unwrap();
        assert_eq!(row.shape(), &[5, 4]);
        let kept: ArrayD<f64> = view.read(&key![2..3, .., 1]).unwrap();
        assert_eq!(kept.shape(), &[1, 5]);
        let point: ArrayD<f64> = view.read(&key![1, 2, 3]).unwrap();
        assert_eq!(point.ndim(), 0);
        let empty: ArrayD<f64> = view.read(&key![3..3]).unwrap();
        assert_eq!(empty.shape(), &[0, 5, 4]);

        assert!(matches!(view.read::<f64>(&key![6]), Err(VdsError::OutOfRange { .. })));
        assert!(matches!(view.read::<f32>(&key![0]), Err(VdsError::InvalidDataType(_))));
    }

    #[test]
    fn test_chunk_write_commit_read() {
        let dir = TempDir::new().unwrap();
        let view = VolumeView::create(&volume_path(&dir), "", options(&[3, 70, 10], Format::U16)).unwrap();
        let channel = view.channel(0).unwrap();
        assert_eq!(channel.chunk_count(), 2);

        for mut chunk in channel.chunks().unwrap() {
            let value = chunk.number() as u16 + 1;
            chunk.write(&key![..], &arr0(value)).unwrap();
            assert_eq!(chunk.mode(), Some(PageMode::Write));
            chunk.release().unwrap();
        }

        // not visible before commit
        let before: ArrayD<u16> = channel.read(&key![..]).unwrap();
        assert!(before.iter().all(|&v| v == 0));
        channel.commit().unwrap();

        let after: ArrayD<u16> = channel.read(&key![0]).unwrap();
        assert_eq!(after.shape(), &[70, 10]);
        let first: ArrayD<u16> = channel.read(&key![.., ..64]).unwrap();
        assert!(first.iter().all(|&v| v == 1));
        let second: ArrayD<u16> = channel.read(&key![.., 64..]).unwrap();
        assert!(second.iter().all(|&v| v == 2));
    }

    #[test]
    fn test_chunk_local_indexing() {
        let dir = TempDir::new().unwrap();
        let view = VolumeView::create(&volume_path(&dir), "", options(&[2, 100], Format::R32)).unwrap();
        let channel = view.channel(0).unwrap();
        // 2D volumes use bricks four times the edge
        assert_eq!(channel.chunk_count(), 1);

        let mut chunk = channel.chunk(0).unwrap();
        assert_eq!(chunk.shape(), &[2, 100]);
        assert_eq!(chunk.ranges(), vec![0..2, 0..100]);
        let row = Array::from_iter((0..100).map(|v| v as f32));
        chunk.write(&key![1], &row).unwrap();
        let back: ArrayD<f32> = chunk.read(&key![1, 10..13]).unwrap();
        assert_eq!(back.as_slice().unwrap(), &[10.0, 11.0, 12.0]);

        let wrong = Array::from_elem(3, 0.0f32);
        assert!(matches!(
            chunk.write(&key![1], &wrong),
            Err(VdsError::ShapeMismatch(_))
        ));
        chunk.release().unwrap();
        assert!(matches!(chunk.release(), Err(VdsError::DoubleRelease(0))));
        assert!(matches!(
            chunk.read::<f32>(&key![0]),
            Err(VdsError::InvalidOperation(_))
        ));

        assert!(matches!(channel.chunk(1), Err(VdsError::OutOfRange { .. })));
        channel.commit().unwrap();
        let committed: ArrayD<f32> = view.read(&key![1, 99]).unwrap();
        assert_eq!(committed.ndim(), 0);
        assert_eq!(committed.first(), Some(&99.0));
    }

    #[test]
    fn test_commit_invalidates_open_chunks() {
        let dir = TempDir::new().unwrap();
        let view = VolumeView::create(&volume_path(&dir), "", options(&[4, 4, 4], Format::U8)).unwrap();
        let channel = view.channel(0).unwrap();

        assert!(matches!(
            channel.commit(),
            Err(VdsError::AccessorNotInitialized(0))
        ));

        let mut chunk = channel.chunk(0).unwrap();
        chunk.write(&key![0], &arr0(9u8)).unwrap();
        channel.commit().unwrap();
        assert!(matches!(
            chunk.write(&key![0], &arr0(1u8)),
            Err(VdsError::InvalidOperation(_))
        ));
        assert!(matches!(chunk.release(), Err(VdsError::InvalidOperation(_))));

        // the unreleased write was discarded
        let data: ArrayD<u8> = view.read(&key![0]).unwrap();
        assert!(data.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_components_add_trailing_axis() {
        let dir = TempDir::new().unwrap();
        let channels = vec![ChannelDescriptor::new("Vector", Format::R32).with_components(Components::Two)];
        let view = VolumeView::create(&volume_path(&dir), "", CreateOptions::from_shape(&[3, 4], channels)).unwrap();

        let channel = view.channel("Vector").unwrap();
        let data = Array::from_shape_fn((3, 4, 2), |(i, j, c)| (i * 10 + j) as f32 + c as f32 / 2.0);
        channel.write_all(data.view().into_dyn()).unwrap();

        let back: ArrayD<f32> = channel.read(&key![1]).unwrap();
        assert_eq!(back.shape(), &[4, 2]);
        assert_eq!(back[IxDyn(&[2, 1])], 12.5);
        assert!(channel.write_all(Array3::<f32>::zeros((3, 4, 1)).view().into_dyn()).is_err());
    }

    #[test]
    fn test_nan_init_falls_back_to_zero_for_integers() {
        let dir = TempDir::new().unwrap();
        let channels = vec![
            ChannelDescriptor::new("Float", Format::R32),
            ChannelDescriptor::new("Int", Format::U32),
        ];
        let view = VolumeView::create(
            &volume_path(&dir),
            "",
            CreateOptions::from_shape(&[2, 2], channels).with_init(InitPolicy::NaN),
        )
        .unwrap();
        let floats: ArrayD<f32> = view.channel(0).unwrap().read(&key![..]).unwrap();
        assert!(floats.iter().all(|v| v.is_nan()));
        let ints: ArrayD<u32> = view.channel(1).unwrap().read(&key![..]).unwrap();
        assert!(ints.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_read_chunks_cannot_be_written() {
        let dir = TempDir::new().unwrap();
        let view = VolumeView::create(&volume_path(&dir), "", options(&[4, 4, 4], Format::U8)).unwrap();
        let channel = view.channel(0).unwrap();

        let mut reader = channel.chunk(0).unwrap();
        let _: ArrayD<u8> = reader.read(&key![0]).unwrap();
        assert_eq!(reader.mode(), Some(PageMode::Read));
        assert!(matches!(
            reader.write(&key![0], &arr0(3u8)),
            Err(VdsError::InvalidOperation(_))
        ));
        assert_eq!(reader.mode(), Some(PageMode::Read));
        reader.release().unwrap();

        let mut writer = channel.chunk(0).unwrap();
        writer.write(&key![0], &arr0(3u8)).unwrap();
        let back: ArrayD<u8> = writer.read(&key![0, 0, 0]).unwrap();
        assert_eq!(back.first(), Some(&3));
        assert_eq!(writer.mode(), Some(PageMode::Write));
        writer.release().unwrap();
    }

    #[test]
    fn test_zero_init_writes_no_bricks() {
        let dir = TempDir::new().unwrap();
        let path = volume_path(&dir);
        let view = VolumeView::create(&path, "", options(&[4, 4, 600], Format::R32)).unwrap();
        assert!(!std::path::Path::new(&path).join("bricks").exists());
        let data: ArrayD<f32> = view.read(&key![..]).unwrap();
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_fill_init_spans_several_commits() {
        let dir = TempDir::new().unwrap();
        let path = volume_path(&dir);
        let view = VolumeView::create(
            &path,
            "",
            options(&[4, 4, 600], Format::R32).with_init(InitPolicy::NaN),
        )
        .unwrap();
        assert!(view.chunk_count() > PAGES_PER_COMMIT);

        let written = std::fs::read_dir(std::path::Path::new(&path).join("bricks/ch0/lod0"))
            .unwrap()
            .count();
        assert_eq!(written, view.chunk_count());
        let data: ArrayD<f32> = view.read(&key![..]).unwrap();
        assert!(data.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_init_buffers_are_validated_before_creation() {
        let dir = TempDir::new().unwrap();
        let path = volume_path(&dir);
        let wrong_shape = ArrayD::<f32>::zeros(IxDyn(&[3, 3]));
        let result = VolumeView::create(
            &path,
            "",
            options(&[2, 2], Format::R32).with_init(InitPolicy::Data(vec![wrong_shape.into()])),
        );
        assert!(matches!(result, Err(VdsError::ShapeMismatch(_))));

        let wrong_type = ArrayD::<u8>::zeros(IxDyn(&[2, 2]));
        let result = VolumeView::create(
            &path,
            "",
            options(&[2, 2], Format::R32).with_init(InitPolicy::Data(vec![wrong_type.into()])),
        );
        assert!(matches!(result, Err(VdsError::InvalidDataType(_))));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_open_or_create() {
        let dir = TempDir::new().unwrap();
        let path = volume_path(&dir);
        let data = Array::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as u8).into_dyn();

        let created = VolumeView::open_or_create(
            &path,
            "",
            options(&[2, 3], Format::U8).with_init(InitPolicy::Data(vec![data.clone().into()])),
        )
        .unwrap();
        assert_eq!(created.read::<u8>(&key![..]).unwrap(), data);
        created.close().unwrap();

        // second call opens and ignores the init policy
        let opened = VolumeView::open_or_create(&path, "", options(&[2, 3], Format::U8)).unwrap();
        assert_eq!(opened.read::<u8>(&key![..]).unwrap(), data);
    }

    #[test]
    fn test_open_missing_volume() {
        let dir = TempDir::new().unwrap();
        match VolumeView::open(&volume_path(&dir), "") {
            Err(VdsError::StoreOpen { code, .. }) => assert_eq!(code, 2),
            other => panic!("unexpected result: {:?}", other.map(|v| v.shape())),
        }
    }
}
