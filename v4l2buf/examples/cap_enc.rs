// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Capture frames from a camera and optionally encode them on a V4L2
//! memory-to-memory encoder.
//!
//! Without an encoder device raw frames are written to the output. With one,
//! capture buffers are exported as DMABUF descriptors and imported by the
//! encoder's input queue, so frames never pass through this process; the
//! encoded bitstream is read from the encoder's mapped capture queue.
//!
//! Usage:
//! ```bash
//! # 100 raw frames to a file
//! cargo run --example cap_enc -- -n 100 -o frames.yuv /dev/video0
//!
//! # H.264 at 25 FPS on stdout
//! cargo run --example cap_enc -- -r 25 -f 1 /dev/video0 /dev/video1 > out.h264
//! ```

mod common;

use std::{
    fs::File,
    io::Write,
    os::fd::{FromRawFd, RawFd},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{ArgAction, Parser};
use tracing::{debug, info, warn};
use v4l2buf::{
    BufferMetadata, BufferPool, BufferRing, BufferType, Capabilities, DeviceHandle, ExposureKind,
    FormatNegotiator, FourCc, Result, StreamController, StreamState, config::CaptureConfig,
};

/// How long any queue may stay silent before giving up.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "cap_enc")]
#[command(about = "Capture video and encode it on a V4L2 M2M device")]
#[command(version)]
struct Args {
    /// Output file descriptor number
    #[arg(short = 'f', long = "fd")]
    fd: Option<RawFd>,

    /// How many frames to process, 0 for no limit
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u32,

    /// Output file name
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Desired framerate
    #[arg(short = 'r', long)]
    framerate: Option<u32>,

    /// Video size [defaults to 1280x720]
    #[arg(short, long, value_parser = CaptureConfig::parse_size)]
    size: Option<(u32, u32)>,

    /// Be more verbose. Can be specified multiple times
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// JSON capture configuration; command line options take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture device
    input: PathBuf,

    /// Encoder device
    encoder: Option<PathBuf>,
}

fn within_limit(value: u32, limit: u32) -> bool {
    limit == 0 || value < limit
}

fn main() -> Result<()> {
    let args = Args::parse();
    common::setup_logging(common::verbosity(args.verbose));

    let mut config = match &args.config {
        Some(path) => CaptureConfig::from_path(path)?,
        None => CaptureConfig::default(),
    };
    config.device = args.input.clone();
    if let Some((width, height)) = args.size {
        config.width = width;
        config.height = height;
    }
    if let Some(framerate) = args.framerate {
        config.framerate = framerate;
    }
    config.validate()?;

    let mut sink = open_sink(&args)?;

    match &args.encoder {
        Some(encoder) => encode(&config, encoder, args.frames, sink.as_mut()),
        None => capture(&config, args.frames, sink.as_mut()),
    }
}

fn open_sink(args: &Args) -> Result<Option<Box<dyn Write>>> {
    if let Some(path) = &args.output {
        return Ok(Some(Box::new(File::create(path)?)));
    }
    if let Some(fd) = args.fd {
        // SAFETY
        // The caller handed this descriptor to the process for output.
        return Ok(Some(Box::new(unsafe { File::from_raw_fd(fd) })));
    }
    warn!("No output given, frames are discarded");
    Ok(None)
}

fn negotiate(
    device: &DeviceHandle,
    buffer_type: BufferType,
    fourcc: FourCc,
    config: &CaptureConfig,
) -> Result<()> {
    let negotiator = FormatNegotiator::new(device);
    negotiator.configure(buffer_type, fourcc, config.width, config.height)?;
    negotiator.configure_framerate(buffer_type, config.framerate)?;
    Ok(())
}

fn framerate(device: &DeviceHandle, buffer_type: BufferType) -> f64 {
    FormatNegotiator::new(device)
        .framerate(buffer_type)
        .unwrap_or(f64::NAN)
}

fn queue_all(ring: &mut BufferRing) -> Result<()> {
    for index in 0..ring.len() {
        ring.queue(index, &BufferMetadata::empty(index))?;
    }
    Ok(())
}

/// Raw capture into the sink.
fn capture(
    config: &CaptureConfig,
    frames: u32,
    mut sink: Option<&mut Box<dyn Write>>,
) -> Result<()> {
    let capture_type = config.buffer_type;
    let camera = DeviceHandle::open(
        &config.device,
        Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
        Capabilities::VIDEO_M2M,
    )?;
    info!("Capture card: {}", camera.card());

    negotiate(&camera, capture_type, config.fourcc, config)?;
    info!("Capture framerate: {:.2} FPS", framerate(&camera, capture_type));

    if config.exposure != ExposureKind::Mapped {
        warn!("Raw capture reads frames directly, using mapped buffers");
    }
    let pool = BufferPool::new(&camera, capture_type, config.buffer_count, ExposureKind::Mapped)?;
    let mut ring = BufferRing::new(pool);
    queue_all(&mut ring)?;

    let mut stream = StreamController::new(&camera, capture_type);
    stream.start(&ring)?;

    debug!("Begin processing...");
    let mut captured = 0;
    while within_limit(captured, frames) {
        ring.wait(POLL_TIMEOUT)?;
        let metadata = ring.dequeue()?;
        debug!("Got buffer {} from capture", metadata.index);

        if let Some(sink) = sink.as_mut() {
            sink.write_all(&ring.data(metadata.index)?[..metadata.bytes_used as usize])?;
        }
        info!("Frame {} captured: {} bytes", captured, metadata.bytes_used);

        ring.queue(metadata.index, &BufferMetadata::empty(metadata.index))?;
        captured += 1;
    }

    ring.drain()?;
    stream.stop(&mut ring)?;
    ring.release()?;
    drop((ring, stream));
    camera.close()
}

/// Camera to encoder to sink, with zero-copy hand-off of raw frames.
fn encode(
    config: &CaptureConfig,
    encoder_path: &Path,
    frames: u32,
    mut sink: Option<&mut Box<dyn Write>>,
) -> Result<()> {
    let capture_type = config.buffer_type;
    let count = config.buffer_count;

    let camera = DeviceHandle::open(
        &config.device,
        Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
        Capabilities::VIDEO_M2M,
    )?;
    info!("Capture card: {}", camera.card());

    let encoder = DeviceHandle::open(
        encoder_path,
        Capabilities::VIDEO_M2M | Capabilities::STREAMING,
        Capabilities::empty(),
    )?;
    info!("Encoding card: {}", encoder.card());

    negotiate(&camera, capture_type, config.fourcc, config)?;
    negotiate(&encoder, BufferType::VideoOutput, config.fourcc, config)?;
    negotiate(&encoder, BufferType::VideoCapture, FourCc::H264, config)?;

    info!("Capture framerate: {:.2} FPS", framerate(&camera, capture_type));
    info!(
        "Encoding framerate: {:.2}/{:.2} FPS",
        framerate(&encoder, BufferType::VideoOutput),
        framerate(&encoder, BufferType::VideoCapture)
    );

    let mut raw_frames = BufferRing::new(BufferPool::new(
        &camera,
        capture_type,
        count,
        ExposureKind::Exported,
    )?);
    let mut encoder_input = BufferRing::new(BufferPool::new(
        &encoder,
        BufferType::VideoOutput,
        count,
        ExposureKind::Imported,
    )?);
    let mut bitstream = BufferRing::new(BufferPool::new(
        &encoder,
        BufferType::VideoCapture,
        count,
        ExposureKind::Mapped,
    )?);

    queue_all(&mut raw_frames)?;
    queue_all(&mut bitstream)?;

    let mut camera_stream = StreamController::new(&camera, capture_type);
    let mut input_stream = StreamController::new(&encoder, BufferType::VideoOutput);
    let mut bitstream_stream = StreamController::new(&encoder, BufferType::VideoCapture);
    camera_stream.start(&raw_frames)?;
    bitstream_stream.start(&bitstream)?;

    debug!("Begin processing...");
    let (mut captured, mut encoded) = (0, 0);
    while within_limit(encoded, frames) {
        let mut progressed = false;

        // The encoder input only starts once the camera filled all of it.
        let input_running = input_stream.state() == StreamState::Running;
        let capturing = within_limit(captured, frames) || !input_running;

        if capturing && raw_frames.queued() > 0 && raw_frames.is_ready()? {
            let frame = raw_frames.dequeue()?;
            debug!("Got buffer {} from capture", frame.index);
            debug!("Frame {} captured: {} bytes", captured, frame.bytes_used);

            let metadata = BufferMetadata {
                bytes_used: frame.bytes_used,
                timestamp: frame.timestamp,
                ..BufferMetadata::empty(frame.index)
            };
            let fd = raw_frames.exported_fd(frame.index)?;
            encoder_input.queue_imported(frame.index, fd, &metadata)?;
            captured += 1;
            progressed = true;

            if !input_running && encoder_input.queued() == encoder_input.len() as usize {
                input_stream.start(&encoder_input)?;
            }
        }

        if input_running && encoder_input.queued() > 0 && encoder_input.is_ready()? {
            let consumed = encoder_input.dequeue()?;
            debug!("Got buffer {} from encoder input", consumed.index);
            raw_frames.queue(consumed.index, &BufferMetadata::empty(consumed.index))?;
            progressed = true;
        }

        if bitstream.is_ready()? {
            let packet = bitstream.dequeue()?;
            debug!("Got buffer {} from encoder output", packet.index);
            info!("Frame {} encoded: {} bytes", encoded, packet.bytes_used);

            if let Some(sink) = sink.as_mut() {
                sink.write_all(&bitstream.data(packet.index)?[..packet.bytes_used as usize])?;
            }
            bitstream.queue(packet.index, &BufferMetadata::empty(packet.index))?;
            encoded += 1;
            progressed = true;
        }

        if !progressed {
            if capturing && raw_frames.queued() > 0 {
                raw_frames.wait(POLL_TIMEOUT)?;
            } else if input_running && encoder_input.queued() > 0 {
                encoder_input.wait(POLL_TIMEOUT)?;
            } else {
                bitstream.wait(POLL_TIMEOUT)?;
            }
        }
    }

    // The encoder lets go of the imported frames before the camera stops.
    input_stream.stop(&mut encoder_input)?;
    bitstream_stream.stop(&mut bitstream)?;
    if camera_stream.state() == StreamState::Running {
        raw_frames.drain()?;
    }
    camera_stream.stop(&mut raw_frames)?;

    encoder_input.release()?;
    bitstream.release()?;
    raw_frames.release()?;
    drop((encoder_input, bitstream, raw_frames));
    drop((input_stream, bitstream_stream, camera_stream));

    encoder.close()?;
    camera.close()
}
