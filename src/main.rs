use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};

use mbt_core::codec::{self, CommandFrame, MailboxOpcode};
use mbt_core::{
    init_logging, AcquisitionPipeline, CoverageQuality, DeviceProfile, DeviceType, FirmwareImage,
    FirmwareVersion, OadConfig, PipelineConfig,
};

#[derive(Parser, Debug)]
#[command(name = "mbt-replay", about = "Replay headset captures and plan firmware updates")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a capture of length-prefixed frames through the acquisition pipeline.
    Decode {
        /// Capture file: repeated `<u16 BE length><frame bytes>` records.
        capture: PathBuf,
        #[arg(long, value_enum, default_value_t = Device::Melomind)]
        device: Device,
        /// Slots per emitted packet (defaults to one second of signal).
        #[arg(long)]
        threshold: Option<usize>,
        /// Pending buffer capacity in records.
        #[arg(long)]
        capacity: Option<usize>,
    },
    /// Split a firmware image into OAD packets and print the transfer plan.
    OadPlan {
        image: PathBuf,
        /// Target version, e.g. 1.7.4
        #[arg(long = "target")]
        target: FirmwareVersion,
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Print every packet, not just the summary.
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Melomind,
    Vpro,
}

impl From<Device> for DeviceType {
    fn from(d: Device) -> Self {
        match d {
            Device::Melomind => DeviceType::Melomind,
            Device::Vpro => DeviceType::VPro,
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run(Args::parse()).await {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Decode {
            capture,
            device,
            threshold,
            capacity,
        } => decode(&capture, device.into(), threshold, capacity).await,
        Command::OadPlan {
            image,
            target,
            chunk_size,
            verbose,
        } => oad_plan(&image, target, chunk_size, verbose),
    }
}

/// Split a capture into frames. A truncated trailing record is an error.
fn read_frames(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let [hi, lo, tail @ ..] = rest else {
            bail!("truncated length prefix at offset {}", bytes.len() - rest.len());
        };
        let len = u16::from_be_bytes([*hi, *lo]) as usize;
        if tail.len() < len {
            bail!(
                "frame at offset {} wants {} bytes, {} left",
                bytes.len() - rest.len(),
                len,
                tail.len()
            );
        }
        frames.push(&tail[..len]);
        rest = &tail[len..];
    }
    Ok(frames)
}

async fn decode(
    capture: &Path,
    device: DeviceType,
    threshold: Option<usize>,
    capacity: Option<usize>,
) -> Result<()> {
    let bytes = std::fs::read(capture).with_context(|| format!("reading {}", capture.display()))?;
    let frames = read_frames(&bytes)?;

    let profile = DeviceProfile::from(device);
    let mut config = PipelineConfig::for_profile(&profile);
    if let Some(threshold) = threshold {
        config.notification_threshold = threshold;
    }
    if let Some(capacity) = capacity {
        config.pending_capacity = capacity;
    }
    info!("replaying {} frames from {}", frames.len(), capture.display());

    let (pipeline, mut packets) = AcquisitionPipeline::spawn(profile.layout(), config, Arc::new(CoverageQuality));
    for frame in &frames {
        if let Err(e) = pipeline.push_frame(frame) {
            warn!("dropped frame: {}", e);
        }
    }
    let stats = pipeline.stats();
    pipeline.shutdown().await;

    while let Some(packet) = packets.recv().await {
        let lost = packet
            .channels
            .first()
            .map_or(0, |samples| samples.iter().filter(|v| v.is_nan()).count());
        println!(
            "packet {:>4} | {} slots | {} lost | quality {:?}",
            packet.sequence,
            packet.len(),
            lost,
            packet.quality
        );
    }
    println!(
        "frames: {} accepted, {} rejected, {} lost",
        stats.frames, stats.rejected, stats.lost
    );
    Ok(())
}

fn oad_plan(path: &Path, version: FirmwareVersion, chunk_size: Option<usize>, verbose: bool) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let chunk_size = chunk_size.unwrap_or(OadConfig::default().chunk_size);
    let image = FirmwareImage::new(bytes, chunk_size)?;

    let mut payload = version.to_bytes().to_vec();
    payload.extend_from_slice(&(image.packet_count() as u16).to_le_bytes());
    let request = codec::assemble_command_frame(&CommandFrame::new(MailboxOpcode::StartOtaTransfer, 0, payload))?;

    println!("target version: {}", version);
    println!("image: {} bytes, {} packets of {} bytes", image.len(), image.packet_count(), chunk_size);
    println!("request: {}", hex(&request));
    if verbose {
        for (index, packet) in image.packets().enumerate() {
            println!("{:>5}: {}", index, hex(&packet));
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}
