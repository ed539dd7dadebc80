//! Example: create a seismic cube, fill it chunk by chunk and read slices back
//!
//! Run with: LOGLVL=debug cargo run --example seismic_volume

use anyhow::Context;
use ndarray::ArrayD;
use openvds_utils::{
    key, AxisDescriptor, BrickSize, ChannelDescriptor, CompressionMethod, CreateOptions, Format,
    LayoutDescriptor, LocalStoreConfig, MetadataContainer, MetadataValue, VolumeView,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("LOGLVL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("OpenVDS utils example: seismic volume");
    println!("=====================================\n");

    let axes = vec![
        AxisDescriptor::new(200, "Inline", "", 1000.0, 1199.0),
        AxisDescriptor::new(150, "Crossline", "", 2000.0, 2149.0),
        AxisDescriptor::new(300, "Sample", "ms", 0.0, 1196.0),
    ];
    for axis in &axes {
        println!(
            "  {:<10} {:>4} samples ({:.0} - {:.0} {})",
            axis.name, axis.samples, axis.coordinate_min, axis.coordinate_max, axis.unit
        );
    }
    println!();

    let mut metadata = MetadataContainer::new();
    metadata.set("survey", "name", MetadataValue::String("North Sea 3D".into()));
    metadata.set("survey", "year", MetadataValue::Int(2023));

    let options = CreateOptions::new(
        axes,
        vec![ChannelDescriptor::new("Amplitude", Format::R32).with_value_range(-1.0, 1.0)],
    )
    .with_layout(LayoutDescriptor::default().with_brick_size(BrickSize::BrickSize64))
    .with_metadata(metadata)
    .with_store_config(LocalStoreConfig::default().with_compression(CompressionMethod::Zstd));

    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("seismic.vds");
    let path = path.to_str().context("temp path is not valid UTF-8")?;
    let view = VolumeView::create(path, "", options)?;
    println!("Created {}", view.layout().summary());

    // A synthetic wavelet that only depends on the sample index
    let channel = view.channel("Amplitude")?;
    println!("Writing {} chunks...", channel.chunk_count());
    for mut chunk in channel.chunks()? {
        let shape = chunk.shape().to_vec();
        let first_sample = chunk.ranges()[2].start;
        let values = ArrayD::from_shape_fn(shape, |index| {
            let t = (first_sample + index[2]) as f32 * 0.05;
            t.sin() * (-t * 0.1).exp()
        });
        chunk.write(&key![..], &values)?;
        chunk.release()?;
    }
    channel.commit()?;
    view.close()?;

    let view = VolumeView::open(path, "")?;
    let inline = view.read::<f32>(&key![100])?;
    let trace = view.read::<f32>(&key![100, 75])?;
    let window = view.read::<f32>(&key![10..20, 30..35, 290..])?;
    println!("\nInline 100:       shape {:?}", inline.shape());
    println!("Trace (100, 75):  shape {:?}", trace.shape());
    println!("Window:           shape {:?}", window.shape());
    println!("Trace peak:       {:.4}", trace.iter().cloned().fold(f32::MIN, f32::max));

    let position = view.sample_position(&[1100.0, 2075.0, 400.0])?;
    println!("Coordinates (1100, 2075, 400 ms) -> sample {:?}", position);
    println!("Survey: {:?}", view.metadata().get_string("survey", "name"));

    view.close()?;
    println!("\n✓ Example complete!");
    Ok(())
}
