// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! # v4l2buf - V4L2 buffer lifecycle
//!
//! Safe buffer management and streaming control for Video4Linux2 capture and
//! output devices.
//!
//! ## Overview
//!
//! A V4L2 stream is a set of buffers shared between this process and the
//! kernel driver. At any instant each buffer belongs to exactly one side;
//! touching a buffer the driver owns corrupts frames. This crate makes that
//! custody explicit and checks it on every operation.
//!
//! ### Key Concepts
//!
//! - **Device**: an opened, capability-verified video node ([`DeviceHandle`])
//! - **Negotiation**: one-shot format and frame-rate setup ([`FormatNegotiator`])
//! - **Pool**: N driver buffers, mapped, exported or imported ([`BufferPool`])
//! - **Ring**: per-buffer custody state and queue/dequeue ([`BufferRing`])
//! - **Stream**: stream-on/stream-off of one queue ([`StreamController`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ DeviceHandle │ ◄── FormatNegotiator
//! └──────┬───────┘
//!        │
//!        ├─► BufferPool ──► BufferRing   (queue / dequeue / data)
//!        │
//!        └─► StreamController            (start / stop)
//! ```
//!
//! Every device operation goes through the [`Driver`] trait. [`KernelDriver`]
//! talks to a real node; [`DeviceHandle::with_driver`] accepts any other
//! implementation.
//!
//! ## Examples
//!
//! ### Capturing frames from a mapped pool
//!
//! ```no_run
//! use std::time::Duration;
//! use v4l2buf::{
//!     BufferMetadata, BufferPool, BufferRing, BufferType, Capabilities, DeviceHandle,
//!     ExposureKind, FormatNegotiator, FourCc, StreamController,
//! };
//!
//! # fn main() -> Result<(), v4l2buf::Error> {
//! let device = DeviceHandle::open(
//!     "/dev/video0",
//!     Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
//!     Capabilities::empty(),
//! )?;
//!
//! let format = FormatNegotiator::new(&device).configure(
//!     BufferType::VideoCapture,
//!     FourCc::YUYV,
//!     640,
//!     480,
//! )?;
//!
//! let pool = BufferPool::new(&device, BufferType::VideoCapture, 4, ExposureKind::Mapped)?;
//! let mut ring = BufferRing::new(pool);
//! for index in 0..ring.len() {
//!     ring.queue(index, &BufferMetadata::empty(index))?;
//! }
//!
//! let mut stream = StreamController::new(&device, BufferType::VideoCapture);
//! stream.start(&ring)?;
//!
//! for _ in 0..100 {
//!     ring.wait(Duration::from_secs(1))?;
//!     let metadata = ring.dequeue()?;
//!     let frame = &ring.data(metadata.index)?[..metadata.bytes_used as usize];
//!     assert!(frame.len() <= format.size_image as usize);
//!     ring.queue(metadata.index, &BufferMetadata::empty(metadata.index))?;
//! }
//!
//! // Teardown order: drain, stop, release, close.
//! ring.drain()?;
//! stream.stop(&mut ring)?;
//! ring.release()?;
//! drop((ring, stream));
//! device.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - [`DeviceHandle`] is `Send + Sync`
//! - Pools and rings are `Send` but not `Sync`; one control thread drives a
//!   ring and may move dequeued data to workers
//! - [`BufferRing::dequeue`] is the only blocking call

mod buffer;
mod device;
mod driver;
mod error;
mod format;
mod kernel;
mod pool;
mod ring;
mod stream;

pub mod config;

pub use buffer::{
    BufferDescriptor, BufferFlags, BufferMetadata, BufferState, Exposure, ExposureKind,
    MappedRegion,
};
pub use device::DeviceHandle;
pub use driver::{
    BufferInfo, Capabilities, DeviceCapabilities, Driver, Fraction, QueueRequest, Readiness,
    StreamParameters,
};
pub use error::{Error, Result};
pub use format::{BufferType, Field, Format, FormatNegotiator, FourCc, MemoryKind, raw_name};
pub use kernel::KernelDriver;
pub use pool::{BufferPool, expose_exported, expose_imported, expose_mapped, request};
pub use ring::BufferRing;
pub use stream::{StreamController, StreamState};
