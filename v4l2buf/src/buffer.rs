// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer descriptors, exposure kinds, custody states and metadata.

use std::{
    fmt,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    ptr::NonNull,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{BufferType, Error, Field, MemoryKind, Result, device::DeviceContext};

/// Which side currently owns a buffer.
///
/// The tag is the only synchronisation between the application and the
/// driver: memory of a buffer in [`BufferState::QueuedToDriver`] belongs to
/// the driver and is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Never queued since the pool was created or the stream was stopped.
    Free,
    /// Owned by the driver.
    QueuedToDriver,
    /// Returned by the driver and owned by the application.
    DequeuedByApp,
}

impl BufferState {
    /// Whether the application may read or write the buffer's memory.
    pub fn is_app_owned(self) -> bool {
        !matches!(self, BufferState::QueuedToDriver)
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BufferState::Free => "free",
            BufferState::QueuedToDriver => "queued",
            BufferState::DequeuedByApp => "dequeued",
        })
    }
}

bitflags::bitflags! {
    /// `V4L2_BUF_FLAG_*` bits of one buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        const MAPPED = v4l2buf_sys::V4L2_BUF_FLAG_MAPPED;
        const QUEUED = v4l2buf_sys::V4L2_BUF_FLAG_QUEUED;
        const DONE = v4l2buf_sys::V4L2_BUF_FLAG_DONE;
        const KEYFRAME = v4l2buf_sys::V4L2_BUF_FLAG_KEYFRAME;
        const PFRAME = v4l2buf_sys::V4L2_BUF_FLAG_PFRAME;
        const BFRAME = v4l2buf_sys::V4L2_BUF_FLAG_BFRAME;
        /// The payload is corrupted but the buffer is usable.
        const ERROR = v4l2buf_sys::V4L2_BUF_FLAG_ERROR;
        const TIMECODE = v4l2buf_sys::V4L2_BUF_FLAG_TIMECODE;
        const PREPARED = v4l2buf_sys::V4L2_BUF_FLAG_PREPARED;
        /// Last buffer before the driver stops producing.
        const LAST = v4l2buf_sys::V4L2_BUF_FLAG_LAST;

        // Timestamp and timecode type fields live in the same word.
        const _ = !0;
    }
}

/// Per-operation buffer record.
///
/// Filled by the driver on every dequeue; amended by the application before
/// requeueing (`bytes_used` for output buffers, `flags`, `timestamp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferMetadata {
    pub index: u32,
    /// Payload size actually written by the producer.
    pub bytes_used: u32,
    pub flags: BufferFlags,
    pub field: Field,
    /// Capture time on the driver's clock (usually `CLOCK_MONOTONIC`).
    pub timestamp: Duration,
    /// Frame counter maintained by the driver.
    pub sequence: u32,
}

impl BufferMetadata {
    /// Record for handing an empty buffer to a capture queue.
    pub fn empty(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }
}

impl fmt::Display for BufferMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.timestamp.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}.{:06} index={}, flags={:#010x}, field={}, sequence={}, bytesused={}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.timestamp.subsec_micros(),
            self.index,
            self.flags.bits(),
            self.field,
            self.sequence,
            self.bytes_used
        )
    }
}

/// How the buffers of a pool are exposed to the application.
///
/// Fixed when the pool is created and shared by every buffer in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureKind {
    /// Driver-allocated memory mapped into this process.
    Mapped,
    /// Driver-allocated memory exported as DMABUF descriptors.
    Exported,
    /// Memory owned elsewhere, attached per queue as a DMABUF descriptor.
    Imported,
}

impl ExposureKind {
    /// Memory kind to request from the driver.
    pub fn memory(self) -> MemoryKind {
        match self {
            ExposureKind::Mapped | ExposureKind::Exported => MemoryKind::Mmap,
            ExposureKind::Imported => MemoryKind::DmaBuf,
        }
    }
}

impl fmt::Display for ExposureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExposureKind::Mapped => "mapped",
            ExposureKind::Exported => "exported",
            ExposureKind::Imported => "imported",
        })
    }
}

/// A buffer mapped shared and read/write into this process.
///
/// The region is unmapped by [`MappedRegion::unmap`] or, failing that, on
/// drop.
pub struct MappedRegion {
    context: Arc<DeviceContext>,
    buffer_type: BufferType,
    index: u32,
    address: Option<NonNull<u8>>,
    length: usize,
}

// Safety: the region is plain shared memory. Custody rules are enforced by
// the owning ring, which is itself not `Sync`.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    pub(crate) fn new(
        context: Arc<DeviceContext>,
        buffer_type: BufferType,
        index: u32,
        address: NonNull<u8>,
        length: usize,
    ) -> Self {
        Self {
            context,
            buffer_type,
            index,
            address: Some(address),
            length,
        }
    }

    /// Mapping start address.
    pub fn address(&self) -> Option<NonNull<u8>> {
        self.address
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self.address {
            // SAFETY
            // The mapping lives until `unmap`, which needs `&mut self`, so it
            // outlives the returned borrow.
            Some(address) => unsafe { std::slice::from_raw_parts(address.as_ptr(), self.length) },
            None => &[],
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.address {
            // SAFETY
            // Same as `as_slice`; `&mut self` guarantees a unique view.
            Some(address) => unsafe {
                std::slice::from_raw_parts_mut(address.as_ptr(), self.length)
            },
            None => &mut [],
        }
    }

    /// Unmaps the region now.
    pub fn unmap(mut self) -> Result<()> {
        self.unmap_inner()
    }

    fn unmap_inner(&mut self) -> Result<()> {
        let Some(address) = self.address.take() else {
            return Ok(());
        };

        unsafe { self.context.driver.unmap(address, self.length) }.map_err(|source| {
            Error::UnmapFailed {
                device: self.context.label(),
                buffer_type: self.buffer_type,
                index: self.index,
                source,
            }
        })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if self.address.is_some()
            && let Err(err) = self.unmap_inner()
        {
            error!("Failed to unmap buffer on drop: {:?}", err);
        }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("index", &self.index)
            .field("address", &self.address)
            .field("length", &self.length)
            .finish()
    }
}

/// The application-side handle on one buffer's memory.
///
/// The variants are released differently (unmap, close, nothing) and are
/// deliberately not unified behind a common pointer.
#[derive(Debug)]
pub enum Exposure {
    Mapped(MappedRegion),
    Exported(OwnedFd),
    Imported,
}

impl Exposure {
    pub fn kind(&self) -> ExposureKind {
        match self {
            Exposure::Mapped(_) => ExposureKind::Mapped,
            Exposure::Exported(_) => ExposureKind::Exported,
            Exposure::Imported => ExposureKind::Imported,
        }
    }

    /// The exported descriptor, if this is an exported buffer.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Exposure::Exported(fd) => Some(fd.as_fd()),
            _ => None,
        }
    }
}

/// One entry of a [`crate::BufferPool`].
#[derive(Debug)]
pub struct BufferDescriptor {
    /// Position in the pool, stable for the pool's lifetime.
    pub index: u32,
    /// Size of the buffer in bytes.
    pub length: u32,
    pub exposure: Exposure,
}
