//! Brick-aligned chunk grid.
//!
//! All functions here work on storage-order shapes. Chunk numbering is
//! row-major with storage axis 0 varying fastest, so chunk numbers are stable
//! between the writer and the reader of a volume.

/// Number of axes the chunk grid tiles
pub const MAX_SPATIAL_DIMS: usize = 3;

/// Inclusive-exclusive bounds of one chunk, in storage order
pub type ChunkBounds = ([usize; MAX_SPATIAL_DIMS], [usize; MAX_SPATIAL_DIMS]);

/// `n / d` rounded to nearest, ties to even
fn div_round_half_even(n: usize, d: usize) -> usize {
    let (q, r) = (n / d, n % d);
    match (2 * r).cmp(&d) {
        std::cmp::Ordering::Less => q,
        std::cmp::Ordering::Greater => q + 1,
        std::cmp::Ordering::Equal => q + (q & 1),
    }
}

/// Legacy chunk estimate: `round(shape[i] / edge)` per spatial axis,
/// multiplied together with zero factors skipped.
///
/// This differs from [`brick_count`] whenever an axis is not close to a
/// multiple of the edge (e.g. 150 samples with edge 128 counts one chunk, the
/// grid has two). Enumeration always uses [`brick_count`].
pub fn chunk_count(shape: &[usize], brick_edge: usize) -> usize {
    shape
        .iter()
        .take(MAX_SPATIAL_DIMS)
        .map(|&s| div_round_half_even(s, brick_edge))
        .filter(|&n| n != 0)
        .product()
}

/// Number of bricks along each spatial axis
pub fn brick_counts(shape: &[usize], brick_edge: usize) -> Vec<usize> {
    shape
        .iter()
        .take(MAX_SPATIAL_DIMS)
        .map(|&s| s.div_ceil(brick_edge).max(1))
        .collect()
}

/// Total number of bricks in the grid
pub fn brick_count(shape: &[usize], brick_edge: usize) -> usize {
    brick_counts(shape, brick_edge).iter().product()
}

/// Brick coordinates of a chunk number, storage order
pub fn chunk_coords(chunk_index: usize, shape: &[usize], brick_edge: usize) -> Vec<usize> {
    let mut remaining = chunk_index;
    brick_counts(shape, brick_edge)
        .iter()
        .map(|&n| {
            let coord = remaining % n;
            remaining /= n;
            coord
        })
        .collect()
}

/// Chunk number of the given brick coordinates, storage order
pub fn chunk_index(coords: &[usize], shape: &[usize], brick_edge: usize) -> usize {
    let counts = brick_counts(shape, brick_edge);
    coords
        .iter()
        .zip(counts.iter())
        .rev()
        .fold(0, |index, (&coord, &n)| index * n + coord)
}

/// Bounds of a chunk, clipped to `shape` at the upper edge.
///
/// Axes beyond the volume's dimensionality get the degenerate range `0..1`.
pub fn bounds_of(chunk_index: usize, shape: &[usize], brick_edge: usize) -> ChunkBounds {
    let mut min = [0; MAX_SPATIAL_DIMS];
    let mut max = [1; MAX_SPATIAL_DIMS];
    for (axis, coord) in chunk_coords(chunk_index, shape, brick_edge)
        .into_iter()
        .enumerate()
    {
        min[axis] = coord * brick_edge;
        max[axis] = (min[axis] + brick_edge).min(shape[axis]);
    }
    (min, max)
}

/// Chunk numbers of all bricks overlapping the storage-order region `begin..end`
pub fn overlapping_chunks(
    begin: &[usize],
    end: &[usize],
    shape: &[usize],
    brick_edge: usize,
) -> Vec<usize> {
    let dims = shape.len().min(MAX_SPATIAL_DIMS);
    if (0..dims).any(|i| begin[i] >= end[i]) {
        return Vec::new();
    }

    let min_brick: Vec<usize> = (0..dims).map(|i| begin[i] / brick_edge).collect();
    let max_brick: Vec<usize> = (0..dims).map(|i| (end[i] - 1) / brick_edge).collect();

    let mut indices = Vec::new();
    let mut coords = min_brick.clone();
    loop {
        indices.push(chunk_index(&coords, shape, brick_edge));

        // Increment coordinates, axis 0 fastest
        let mut dim = 0;
        loop {
            coords[dim] += 1;
            if coords[dim] <= max_brick[dim] {
                break;
            }
            coords[dim] = min_brick[dim];
            dim += 1;
            if dim == dims {
                return indices;
            }
        }
    }
}
