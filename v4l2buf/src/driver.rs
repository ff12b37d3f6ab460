// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! The kernel control surface consumed by the buffer layer.
//!
//! [`Driver`] is the one seam between this crate and the device: every
//! ioctl, mapping and readiness wait goes through it. [`crate::KernelDriver`]
//! implements it on a real V4L2 node; tests implement it with simulated
//! devices. Methods report plain [`std::io::Error`]s; the pool, ring and
//! stream layers attach device, buffer-type and index context.

use std::{
    fmt, io,
    os::fd::{OwnedFd, RawFd},
    ptr::NonNull,
    time::Duration,
};

use crate::{BufferFlags, BufferMetadata, BufferType, Field, Format, MemoryKind};

bitflags::bitflags! {
    /// Set of `V4L2_CAP_*` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const VIDEO_CAPTURE = v4l2buf_sys::V4L2_CAP_VIDEO_CAPTURE;
        const VIDEO_OUTPUT = v4l2buf_sys::V4L2_CAP_VIDEO_OUTPUT;
        const VIDEO_OVERLAY = v4l2buf_sys::V4L2_CAP_VIDEO_OVERLAY;
        const VIDEO_CAPTURE_MPLANE = v4l2buf_sys::V4L2_CAP_VIDEO_CAPTURE_MPLANE;
        const VIDEO_OUTPUT_MPLANE = v4l2buf_sys::V4L2_CAP_VIDEO_OUTPUT_MPLANE;
        const VIDEO_M2M = v4l2buf_sys::V4L2_CAP_VIDEO_M2M;
        const VIDEO_M2M_MPLANE = v4l2buf_sys::V4L2_CAP_VIDEO_M2M_MPLANE;
        const VBI_CAPTURE = v4l2buf_sys::V4L2_CAP_VBI_CAPTURE;
        const SDR_CAPTURE = v4l2buf_sys::V4L2_CAP_SDR_CAPTURE;
        const READWRITE = v4l2buf_sys::V4L2_CAP_READWRITE;
        const STREAMING = v4l2buf_sys::V4L2_CAP_STREAMING;
        /// `device_caps` of the capability query is valid.
        const DEVICE_CAPS = v4l2buf_sys::V4L2_CAP_DEVICE_CAPS;

        // Drivers report bits this crate has no name for.
        const _ = !0;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// Identity and capabilities reported by `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Capabilities of the whole physical device.
    pub capabilities: Capabilities,
    /// Capabilities of this node, valid when `capabilities` has
    /// [`Capabilities::DEVICE_CAPS`].
    pub device_caps: Capabilities,
}

impl DeviceCapabilities {
    /// Capabilities of the opened node.
    pub fn effective(&self) -> Capabilities {
        if self.capabilities.contains(Capabilities::DEVICE_CAPS) {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

/// A rational number, as used for time-per-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Interprets the fraction as time-per-frame and returns frames per
    /// second.
    pub fn as_rate(&self) -> Option<f64> {
        (self.numerator != 0).then(|| f64::from(self.denominator) / f64::from(self.numerator))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Streaming parameters of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamParameters {
    /// Whether the driver honours time-per-frame changes.
    pub time_per_frame_supported: bool,
    pub time_per_frame: Fraction,
}

/// Placement of one allocated buffer, from `VIDIOC_QUERYBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub length: u32,
    /// Offset to pass to `mmap` (meaningful for [`MemoryKind::Mmap`]).
    pub offset: u32,
}

/// Everything the driver needs to take custody of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub buffer_type: BufferType,
    pub memory: MemoryKind,
    pub index: u32,
    /// Buffer length, needed to describe DMABUF and multi-planar buffers.
    pub length: u32,
    pub bytes_used: u32,
    pub flags: BufferFlags,
    pub field: Field,
    pub timestamp: Duration,
    /// Descriptor to attach for [`MemoryKind::DmaBuf`] queues.
    pub dmabuf_fd: Option<RawFd>,
}

/// Result of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// A capture buffer can be dequeued.
    pub readable: bool,
    /// An output buffer can be dequeued.
    pub writable: bool,
    /// The driver signalled an error condition (e.g. device gone).
    pub error: bool,
}

impl Readiness {
    /// Whether a buffer of `buffer_type` can be dequeued without blocking.
    pub fn ready_for(&self, buffer_type: BufferType) -> bool {
        if buffer_type.is_output() {
            self.writable
        } else {
            self.readable
        }
    }
}

/// Device control operations used by pools, rings and streams.
///
/// Implementations must be usable from whichever thread currently owns the
/// handle built on them, hence `Send + Sync`. None of the methods retries a
/// failed operation.
pub trait Driver: Send + Sync {
    /// Queries identity and capabilities.
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// Applies a format and returns what the driver actually set.
    fn set_format(&self, format: &Format) -> io::Result<Format>;

    /// Reads streaming parameters.
    fn stream_parameters(&self, buffer_type: BufferType) -> io::Result<StreamParameters>;

    /// Sets the time-per-frame and returns the value the driver applied.
    fn set_time_per_frame(
        &self,
        buffer_type: BufferType,
        time_per_frame: Fraction,
    ) -> io::Result<Fraction>;

    /// Allocates (or, with `count == 0`, frees) buffers. Returns the number
    /// granted.
    fn request_buffers(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
        count: u32,
    ) -> io::Result<u32>;

    /// Queries length and offset of one allocated buffer.
    fn query_buffer(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
        index: u32,
    ) -> io::Result<BufferInfo>;

    /// Maps `length` bytes at `offset` shared and read/write.
    fn map(&self, offset: u32, length: usize) -> io::Result<NonNull<u8>>;

    /// Undoes [`Driver::map`].
    ///
    /// # Safety
    ///
    /// `address` and `length` must come from a successful `map` call on this
    /// driver, and no reference into the region may outlive this call.
    unsafe fn unmap(&self, address: NonNull<u8>, length: usize) -> io::Result<()>;

    /// Exports one buffer as a DMABUF file descriptor.
    fn export_buffer(&self, buffer_type: BufferType, index: u32) -> io::Result<OwnedFd>;

    /// Hands one buffer to the driver.
    fn queue_buffer(&self, request: &QueueRequest) -> io::Result<()>;

    /// Blocks until the driver returns a buffer, and describes it.
    fn dequeue_buffer(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
    ) -> io::Result<BufferMetadata>;

    fn stream_on(&self, buffer_type: BufferType) -> io::Result<()>;

    fn stream_off(&self, buffer_type: BufferType) -> io::Result<()>;

    /// Waits until a buffer of `buffer_type` can be dequeued, or the device
    /// reports an error. `None` waits forever.
    fn poll(&self, buffer_type: BufferType, timeout: Option<Duration>) -> io::Result<Readiness>;
}
