// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for device, pool, ring and stream operations.
//!
//! Errors fall into three groups:
//!
//! - **Usage errors** ([`Error::InvalidState`], [`Error::IndexOutOfRange`],
//!   [`Error::BytesUsedExceedsLength`], [`Error::ReleaseWhileQueued`],
//!   [`Error::DeviceInUse`]): the caller broke the custody protocol. Nothing
//!   is changed and nothing is coerced.
//! - **Construction errors** ([`Error::UnsupportedCapability`],
//!   [`Error::CountMismatch`], [`Error::MapFailed`], [`Error::ExportFailed`]):
//!   the pool was not built and nothing it acquired is left behind.
//! - **Runtime I/O errors** ([`Error::DriverRejected`],
//!   [`Error::DequeueFailed`], [`Error::StreamStartFailed`]): fatal for the
//!   current stream. The crate never retries them; the caller tears the
//!   stream down and decides.
//!
//! Every variant carries the device path and, where relevant, the buffer
//! type name and buffer index.

use std::{io, path::PathBuf, time::Duration};

use crate::{BufferType, Capabilities, Fraction, MemoryKind};

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by the buffer lifecycle layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device node could not be opened.
    #[error("Can not open {}: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The path exists but is not a character device.
    #[error("{} is not a character device", path.display())]
    NotCharDevice { path: PathBuf },

    /// `VIDIOC_QUERYCAP` failed.
    #[error("Can not query capabilities of {device}: {source}")]
    QueryFailed {
        device: String,
        #[source]
        source: io::Error,
    },

    /// The device lacks capabilities the caller requires.
    #[error("Device {device} does not support required capabilities: {missing}")]
    MissingCapabilities {
        device: String,
        missing: Capabilities,
    },

    /// The device advertises capabilities the caller rejects.
    #[error("Device {device} supports unsupported capabilities: {present}")]
    ForbiddenCapabilities {
        device: String,
        present: Capabilities,
    },

    /// The driver refused the requested format.
    #[error("Can not set {buffer_type} format on {device}: {source}")]
    FormatRejected {
        device: String,
        buffer_type: BufferType,
        #[source]
        source: io::Error,
    },

    /// The driver accepted a format, but not the one requested.
    #[error("Can not set requested {buffer_type} format on {device}: asked {requested}, got {actual}")]
    FormatMismatch {
        device: String,
        buffer_type: BufferType,
        requested: String,
        actual: String,
    },

    /// Streaming parameters could not be read or written.
    #[error("Can not access {buffer_type} streaming parameters of {device}: {source}")]
    ParameterQueryFailed {
        device: String,
        buffer_type: BufferType,
        #[source]
        source: io::Error,
    },

    /// The driver did not apply the requested frame rate.
    #[error("Device {device} {buffer_type} failed to set requested framerate {requested}, got {actual}")]
    FramerateMismatch {
        device: String,
        buffer_type: BufferType,
        requested: u32,
        actual: Fraction,
    },

    /// `VIDIOC_REQBUFS` failed.
    #[error("Can not request {memory} {buffer_type} buffers from {device}: {source}")]
    RequestFailed {
        device: String,
        buffer_type: BufferType,
        memory: MemoryKind,
        #[source]
        source: io::Error,
    },

    /// The driver granted zero buffers.
    #[error("Device {device} gives zero {memory} {buffer_type} buffers")]
    UnsupportedCapability {
        device: String,
        buffer_type: BufferType,
        memory: MemoryKind,
    },

    /// The driver granted a different number of buffers than requested.
    #[error("Device {device} gives {granted} {buffer_type} buffers, but {requested} is requested")]
    CountMismatch {
        device: String,
        buffer_type: BufferType,
        requested: u32,
        granted: u32,
    },

    /// `VIDIOC_QUERYBUF` failed for one buffer.
    #[error("Can not query {buffer_type} buffer #{index} of {device}: {source}")]
    QueryBufferFailed {
        device: String,
        buffer_type: BufferType,
        index: u32,
        #[source]
        source: io::Error,
    },

    /// Mapping one buffer failed. Earlier mappings were undone.
    #[error("Can not mmap {buffer_type} buffer #{index} of {device}: {source}")]
    MapFailed {
        device: String,
        buffer_type: BufferType,
        index: u32,
        #[source]
        source: io::Error,
    },

    /// Exporting one buffer failed. Earlier descriptors were closed.
    #[error("Can not export {buffer_type} buffer #{index} of {device}: {source}")]
    ExportFailed {
        device: String,
        buffer_type: BufferType,
        index: u32,
        #[source]
        source: io::Error,
    },

    /// Unmapping a buffer failed during release.
    #[error("Can not munmap {buffer_type} buffer #{index} of {device}: {source}")]
    UnmapFailed {
        device: String,
        buffer_type: BufferType,
        index: u32,
        #[source]
        source: io::Error,
    },

    /// The operation is not allowed in the buffer's or ring's current state.
    #[error("Invalid state for {buffer_type} on {device}: {detail}")]
    InvalidState {
        device: String,
        buffer_type: BufferType,
        detail: String,
    },

    /// A caller-supplied index is outside the pool.
    #[error("{buffer_type} buffer index {index} is out of range for {count} buffers on {device}")]
    IndexOutOfRange {
        device: String,
        buffer_type: BufferType,
        index: u32,
        count: u32,
    },

    /// Queue metadata claims more payload than the buffer holds.
    #[error("{buffer_type} buffer #{index} on {device}: {bytes_used} bytes used exceeds length {length}")]
    BytesUsedExceedsLength {
        device: String,
        buffer_type: BufferType,
        index: u32,
        bytes_used: u32,
        length: u32,
    },

    /// `VIDIOC_QBUF` failed.
    #[error("Can not enqueue {buffer_type} buffer #{index} to {device}: {source}")]
    DriverRejected {
        device: String,
        buffer_type: BufferType,
        index: u32,
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_DQBUF` failed. The stream must be stopped.
    #[error("Can not dequeue {buffer_type} buffer from {device}: {source}")]
    DequeueFailed {
        device: String,
        buffer_type: BufferType,
        #[source]
        source: io::Error,
    },

    /// The driver broke the custody protocol.
    ///
    /// `index` is set when the buffer still came back to the application
    /// and has to be requeued by it.
    #[error("Integrity violation on {device} {buffer_type}: {detail}")]
    IntegrityViolation {
        device: String,
        buffer_type: BufferType,
        index: Option<u32>,
        detail: String,
    },

    /// The pool can not be released while the driver holds buffers.
    #[error("Can not release {buffer_type} pool of {device}: {queued} buffer(s) still queued")]
    ReleaseWhileQueued {
        device: String,
        buffer_type: BufferType,
        queued: usize,
    },

    /// Stream-on was refused, either by policy or by the driver.
    #[error("Failed to start {buffer_type} stream on {device}: {reason}")]
    StreamStartFailed {
        device: String,
        buffer_type: BufferType,
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Stream-off was refused by the driver.
    #[error("Failed to stop {buffer_type} stream on {device}: {source}")]
    StreamStopFailed {
        device: String,
        buffer_type: BufferType,
        #[source]
        source: io::Error,
    },

    /// Waiting for buffer readiness failed.
    #[error("Can not poll {buffer_type} queue of {device}: {source}")]
    PollFailed {
        device: String,
        buffer_type: BufferType,
        #[source]
        source: io::Error,
    },

    /// No buffer became ready in time.
    #[error("Timeout waiting for {buffer_type} data on {device} after {timeout:?}")]
    Timeout {
        device: String,
        buffer_type: BufferType,
        timeout: Duration,
    },

    /// The device is still referenced by a pool, ring or stream.
    #[error("Device {device} is still in use")]
    DeviceInUse { device: String },

    /// A capture configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A capture configuration could not be parsed.
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Generic I/O failure outside a specific device operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
