//! Example: read two survey vintages as one volume
//!
//! Run with: cargo run --example composite_volume

use anyhow::Context;
use ndarray::{Array, ArrayD};
use openvds_utils::{
    key, ChannelDescriptor, CompositeView, CreateOptions, Format, InitPolicy, VolumeSubset,
    VolumeView,
};
use tracing_subscriber::EnvFilter;

fn create_block(path: &str, inlines: usize, base: f32) -> anyhow::Result<VolumeView> {
    let shape = (inlines, 40, 60);
    let data = Array::from_shape_fn(shape, |(i, j, k)| base + i as f32 + (j * k) as f32 * 1e-3);
    let options = CreateOptions::from_shape(
        &[shape.0, shape.1, shape.2],
        vec![ChannelDescriptor::new("Amplitude", Format::R32)],
    )
    .with_init(InitPolicy::Data(vec![data.into_dyn().into()]));
    Ok(VolumeView::create(path, "", options)?)
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("LOGLVL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let temp_dir = tempfile::tempdir()?;
    let north = temp_dir.path().join("north.vds");
    let south = temp_dir.path().join("south.vds");
    let north = create_block(north.to_str().context("non UTF-8 path")?, 120, 0.0)?;
    let south = create_block(south.to_str().context("non UTF-8 path")?, 80, 1000.0)?;

    let composite = CompositeView::with_subsets([&north as &dyn VolumeSubset<f32>, &south], 0)?;
    println!(
        "Composite of {} volumes, extents {:?} -> shape {:?}",
        composite.len(),
        composite.extents(),
        composite.shape()
    );

    let seam: ArrayD<f32> = composite.read(&key![118..122, 20, 30])?;
    println!("Samples across the seam: {:?}", seam.iter().collect::<Vec<_>>());

    let time_slice = composite.read(&key![.., .., 30])?;
    println!("Time slice shape: {:?}", time_slice.shape());

    // composites nest
    let extra = create_block(
        temp_dir.path().join("extra.vds").to_str().context("non UTF-8 path")?,
        10,
        2000.0,
    )?;
    let outer = CompositeView::with_subsets([&composite as &dyn VolumeSubset<f32>, &extra], 0)?;
    println!("Nested composite shape: {:?}", outer.shape());
    println!("Last inline, first sample: {:?}", outer.read(&key![209, 0, 0])?.first());

    println!("\n✓ Example complete!");
    Ok(())
}
