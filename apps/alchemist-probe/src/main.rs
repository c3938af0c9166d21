//! Headless memory probe for the Alchemist engine.
//!
//! Brings up a Vulkan device, uploads a pattern through host-visible
//! buffers placed by the memory registry, reads it back, places a
//! device-local image and logs a report.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p alchemist-probe
//! cargo run -p alchemist-probe -- --size 65536 --count 8 --validation
//! ```

use alchemist_gpu::{GpuBuffer, GpuContextBuilder, GpuImage, MemoryReport, RegistryConfig};
use anyhow::{ensure, Context};
use ash::vk;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Default size of each staging buffer in bytes.
const DEFAULT_SIZE: u64 = 64 * 1024;

/// Default number of staging buffers.
const DEFAULT_COUNT: usize = 4;

struct Options {
    size: u64,
    count: usize,
    validation: bool,
    block_size: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = parse_args();
    ensure!(
        options.size > 0 && options.size % 4 == 0,
        "buffer size must be a non-zero multiple of 4"
    );

    let context = GpuContextBuilder::new()
        .app_name("Alchemist Probe")
        .validation(options.validation)
        .registry(RegistryConfig::default().with_block_size(options.block_size))
        .build()
        .context("failed to create GPU context")?;

    let device = context.device();
    let mut resources = context.resources().lock();
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

    let mut buffers = Vec::with_capacity(options.count);
    for index in 0..options.count {
        let buffer = unsafe {
            GpuBuffer::create(
                device,
                &mut resources,
                options.size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                host,
            )
        }
        .with_context(|| format!("failed to create staging buffer {index}"))?;

        let words = pattern(index, options.size);
        buffer.write(&mut resources, &words)?;
        let read = buffer.read_bytes(&mut resources, 0, options.size as usize)?;
        ensure!(
            read == bytemuck::cast_slice::<u32, u8>(&words),
            "staging buffer {index} read back wrong data"
        );

        info!(
            "Buffer {index}: block {} bind {} ({} bytes)",
            buffer.block, buffer.bind, buffer.size
        );
        buffers.push(buffer);
    }

    // Later placements must not disturb earlier contents.
    for (index, buffer) in buffers.iter().enumerate() {
        let expected = pattern(index, options.size);
        let read = buffer.read_bytes(&mut resources, 0, options.size as usize)?;
        ensure!(
            read == bytemuck::cast_slice::<u32, u8>(&expected),
            "staging buffer {index} lost its contents"
        );
    }

    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D {
            width: 256,
            height: 256,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let mut image = unsafe {
        GpuImage::create(
            device,
            &mut resources,
            &image_info,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
    }
    .context("failed to create device-local image")?;
    info!(
        "Image {:?} {}x{}: block {} bind {}",
        image.format, image.extent.width, image.extent.height, image.block, image.bind
    );

    log_report(&resources.memory().report());

    for buffer in &mut buffers {
        unsafe { buffer.destroy(device, &resources) };
    }
    unsafe { image.destroy(device, &resources) };
    drop(resources);

    info!("Probe finished");
    Ok(())
}

fn pattern(index: usize, size: u64) -> Vec<u32> {
    (0..size / 4)
        .map(|i| (i as u32).wrapping_mul(0x9E37_79B9) ^ index as u32)
        .collect()
}

fn log_report(report: &MemoryReport) {
    info!(
        "Buffer memory: {} blocks, {} binds, {} / {} bytes",
        report.buffers.blocks, report.buffers.binds, report.buffers.consumed, report.buffers.capacity
    );
    info!(
        "Image memory: {} blocks, {} binds, {} / {} bytes",
        report.images.blocks, report.images.binds, report.images.consumed, report.images.capacity
    );
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        size: DEFAULT_SIZE,
        count: DEFAULT_COUNT,
        validation: false,
        block_size: RegistryConfig::default().default_block_size,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--size" | "-s" => {
                if let Some(size) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    options.size = size;
                }
                i += 1;
            }
            "--count" | "-n" => {
                if let Some(count) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    options.count = count;
                }
                i += 1;
            }
            "--block-size" | "-b" => {
                if let Some(size) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                    options.block_size = size;
                }
                i += 1;
            }
            "--validation" => options.validation = true,
            "--help" | "-h" => {
                println!("Alchemist memory probe");
                println!();
                println!("Usage: alchemist-probe [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -s, --size <BYTES>        Size of each staging buffer (default: 65536)");
                println!("  -n, --count <N>           Number of staging buffers (default: 4)");
                println!("  -b, --block-size <BYTES>  Registry block size (default: 1048576)");
                println!("      --validation          Enable Vulkan validation layers");
                println!("  -h, --help                Show this help message");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    options
}
