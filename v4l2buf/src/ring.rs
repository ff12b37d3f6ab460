// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Per-buffer custody state machine.
//!
//! Every index of a pool is in exactly one [`BufferState`]:
//!
//! ```text
//!            queue                 dequeue
//!   Free ──────────► QueuedToDriver ──────► DequeuedByApp
//!    ▲                  ▲    │                  │
//!    │   stream-off     │    │      queue       │
//!    └──────────────────┼────┘◄─────────────────┘
//!                       └───────────────────────┘
//! ```
//!
//! Memory of a queued buffer belongs to the driver and is never handed out.

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd},
    sync::Arc,
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    BufferFlags, BufferMetadata, BufferPool, BufferState, BufferType, Error, Exposure,
    ExposureKind, QueueRequest, Result, device::DeviceContext,
};

/// Ownership tracking over a [`BufferPool`].
///
/// The ring owns its pool. It is `Send` but not `Sync`: one control thread
/// queues and dequeues, and may hand dequeued bytes to workers.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use v4l2buf::{
///     BufferMetadata, BufferPool, BufferRing, BufferType, Capabilities, DeviceHandle,
///     ExposureKind, StreamController,
/// };
///
/// # fn main() -> Result<(), v4l2buf::Error> {
/// let device = DeviceHandle::open(
///     "/dev/video0",
///     Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
///     Capabilities::empty(),
/// )?;
/// let pool = BufferPool::new(&device, BufferType::VideoCapture, 4, ExposureKind::Mapped)?;
/// let mut ring = BufferRing::new(pool);
/// for index in 0..ring.len() {
///     ring.queue(index, &BufferMetadata::empty(index))?;
/// }
///
/// let mut stream = StreamController::new(&device, BufferType::VideoCapture);
/// stream.start(&ring)?;
///
/// ring.wait(Duration::from_secs(1))?;
/// let metadata = ring.dequeue()?;
/// let frame = ring.data(metadata.index)?;
/// println!("frame of {} bytes", frame.len());
/// ring.queue(metadata.index, &BufferMetadata::empty(metadata.index))?;
///
/// ring.drain()?;
/// stream.stop(&mut ring)?;
/// ring.release()?;
/// # Ok(())
/// # }
/// ```
pub struct BufferRing {
    pool: BufferPool,
    states: Vec<BufferState>,
}

impl BufferRing {
    /// Takes ownership of `pool`; every index starts [`BufferState::Free`].
    pub fn new(pool: BufferPool) -> Self {
        let states = vec![BufferState::Free; pool.len() as usize];
        Self { pool, states }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn buffer_type(&self) -> BufferType {
        self.pool.buffer_type()
    }

    /// Number of buffers in the ring.
    pub fn len(&self) -> u32 {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// State of one buffer, `None` for an index outside the pool.
    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.states.get(index as usize).copied()
    }

    /// Number of buffers currently in `state`.
    pub fn count_in(&self, state: BufferState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    /// Number of buffers owned by the driver.
    pub fn queued(&self) -> usize {
        self.count_in(BufferState::QueuedToDriver)
    }

    pub(crate) fn context(&self) -> &Arc<DeviceContext> {
        self.pool.context()
    }

    fn label(&self) -> String {
        self.context().label()
    }

    fn invalid_state(&self, detail: String) -> Error {
        Error::InvalidState {
            device: self.label(),
            buffer_type: self.buffer_type(),
            detail,
        }
    }

    /// Looks up an index the application passed in.
    fn check_index(&self, index: u32) -> Result<usize> {
        if index >= self.len() {
            return Err(Error::IndexOutOfRange {
                device: self.label(),
                buffer_type: self.buffer_type(),
                index,
                count: self.len(),
            });
        }
        Ok(index as usize)
    }

    /// Checks that the application currently owns buffer `index`.
    fn check_app_owned(&self, index: u32) -> Result<usize> {
        let slot = self.check_index(index)?;
        if !self.states[slot].is_app_owned() {
            return Err(self.invalid_state(format!("buffer #{index} is queued to the driver")));
        }
        if self.pool.is_released() {
            return Err(self.invalid_state("pool has been released".to_string()));
        }
        Ok(slot)
    }

    /// Hands buffer `index` to the driver.
    ///
    /// `metadata.bytes_used` is the payload size of an output buffer and is
    /// ignored by capture queues; `flags`, `field` and `timestamp` are passed
    /// through. `metadata.index` is not consulted.
    ///
    /// # Errors
    ///
    /// - [`Error::IndexOutOfRange`] for an index outside the pool
    /// - [`Error::InvalidState`] if the buffer is already queued, or the pool
    ///   is an imported one (see [`BufferRing::queue_imported`])
    /// - [`Error::BytesUsedExceedsLength`] if `bytes_used` is larger than the
    ///   buffer
    /// - [`Error::DriverRejected`] if the driver refuses the buffer
    ///
    /// On error the buffer keeps its previous state.
    pub fn queue(&mut self, index: u32, metadata: &BufferMetadata) -> Result<()> {
        if self.pool.exposure() == ExposureKind::Imported {
            return Err(self.invalid_state(format!(
                "buffer #{index} belongs to an imported pool and needs a descriptor"
            )));
        }
        self.queue_inner(index, metadata, None)
    }

    /// Hands buffer `index` of an imported pool to the driver, backed by
    /// `fd`.
    ///
    /// The descriptor only has to stay open for the duration of the call;
    /// the driver takes its own reference.
    ///
    /// # Errors
    ///
    /// As [`BufferRing::queue`]; [`Error::InvalidState`] if the pool is not an
    /// imported one.
    pub fn queue_imported(
        &mut self,
        index: u32,
        fd: BorrowedFd<'_>,
        metadata: &BufferMetadata,
    ) -> Result<()> {
        if self.pool.exposure() != ExposureKind::Imported {
            return Err(self.invalid_state(format!(
                "buffer #{index} belongs to a {} pool",
                self.pool.exposure()
            )));
        }
        self.queue_inner(index, metadata, Some(fd))
    }

    fn queue_inner(
        &mut self,
        index: u32,
        metadata: &BufferMetadata,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<()> {
        let slot = self.check_app_owned(index)?;
        let length = self.pool.descriptors()[slot].length;

        if metadata.bytes_used > length {
            return Err(Error::BytesUsedExceedsLength {
                device: self.label(),
                buffer_type: self.buffer_type(),
                index,
                bytes_used: metadata.bytes_used,
                length,
            });
        }

        let request = QueueRequest {
            buffer_type: self.buffer_type(),
            memory: self.pool.memory(),
            index,
            length,
            bytes_used: metadata.bytes_used,
            flags: metadata.flags,
            field: metadata.field,
            timestamp: metadata.timestamp,
            dmabuf_fd: fd.map(|fd| fd.as_raw_fd()),
        };

        self.context()
            .driver
            .queue_buffer(&request)
            .map_err(|source| Error::DriverRejected {
                device: self.label(),
                buffer_type: self.buffer_type(),
                index,
                source,
            })?;

        debug!("Queued {} buffer #{}", self.buffer_type(), index);
        trace!(metadata = %metadata, "Queued buffer metadata");
        self.states[slot] = BufferState::QueuedToDriver;
        Ok(())
    }

    /// Takes the next buffer back from the driver.
    ///
    /// This is the only blocking call of the ring: the kernel driver waits
    /// until a buffer is done. Use [`BufferRing::wait`] first to bound the
    /// wait.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if no buffer is queued
    /// - [`Error::DequeueFailed`] if the driver call fails
    /// - [`Error::IntegrityViolation`] if the driver returns an index that is
    ///   out of range or not queued, or reports more bytes than the buffer
    ///   holds
    pub fn dequeue(&mut self) -> Result<BufferMetadata> {
        if self.queued() == 0 {
            return Err(self.invalid_state("no buffer is queued to the driver".to_string()));
        }

        let metadata = self
            .context()
            .driver
            .dequeue_buffer(self.buffer_type(), self.pool.memory())
            .map_err(|source| Error::DequeueFailed {
                device: self.label(),
                buffer_type: self.buffer_type(),
                source,
            })?;

        let index = metadata.index;
        let Some(state) = self.state(index) else {
            return Err(self.integrity_violation(None, format!(
                "driver returned buffer #{index}, pool holds {}",
                self.len()
            )));
        };
        if state != BufferState::QueuedToDriver {
            return Err(self.integrity_violation(None, format!(
                "driver returned buffer #{index} which was {state}"
            )));
        }

        // The driver gave the buffer back either way; `index` in the error
        // tells the caller which one to requeue.
        self.states[index as usize] = BufferState::DequeuedByApp;

        let length = self.pool.descriptors()[index as usize].length;
        if metadata.bytes_used > length {
            return Err(self.integrity_violation(Some(index), format!(
                "driver reported {} bytes used in buffer #{index} of {length} bytes",
                metadata.bytes_used
            )));
        }

        if metadata.flags.contains(BufferFlags::ERROR) {
            warn!(
                "Driver flagged {} buffer #{} as corrupted",
                self.buffer_type(),
                index
            );
        }
        debug!("Dequeued {} buffer #{}", self.buffer_type(), index);
        trace!(metadata = %metadata, "Dequeued buffer metadata");

        Ok(metadata)
    }

    fn integrity_violation(&self, index: Option<u32>, detail: String) -> Error {
        Error::IntegrityViolation {
            device: self.label(),
            buffer_type: self.buffer_type(),
            index,
            detail,
        }
    }

    /// Dequeues until the driver holds no buffer and returns what came back.
    ///
    /// Each call blocks like [`BufferRing::dequeue`], so the stream must be
    /// running for it to finish.
    pub fn drain(&mut self) -> Result<Vec<BufferMetadata>> {
        let mut drained = Vec::with_capacity(self.queued());
        while self.queued() > 0 {
            drained.push(self.dequeue()?);
        }
        debug!(
            "Drained {} {} buffer(s) from {}",
            drained.len(),
            self.buffer_type(),
            self.label()
        );
        Ok(drained)
    }

    /// Waits up to `timeout` until a buffer can be dequeued without blocking.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if nothing became ready in time
    /// - [`Error::PollFailed`] if the wait fails or the device reports an
    ///   error condition
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let readiness = self
            .context()
            .driver
            .poll(self.buffer_type(), Some(timeout))
            .map_err(|source| Error::PollFailed {
                device: self.label(),
                buffer_type: self.buffer_type(),
                source,
            })?;

        if readiness.ready_for(self.buffer_type()) {
            return Ok(());
        }

        if readiness.error {
            return Err(Error::PollFailed {
                device: self.label(),
                buffer_type: self.buffer_type(),
                source: io::Error::other("device signalled an error condition"),
            });
        }

        Err(Error::Timeout {
            device: self.label(),
            buffer_type: self.buffer_type(),
            timeout,
        })
    }

    /// Whether a buffer can be dequeued right now, without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::PollFailed`], as for [`BufferRing::wait`].
    pub fn is_ready(&self) -> Result<bool> {
        match self.wait(Duration::ZERO) {
            Ok(()) => Ok(true),
            Err(Error::Timeout { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Contents of a mapped buffer the application owns.
    ///
    /// The whole buffer is returned; use `bytes_used` of the dequeued
    /// metadata for the payload size.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`], or [`Error::InvalidState`] if the buffer is
    /// queued or the pool is not a mapped one.
    pub fn data(&self, index: u32) -> Result<&[u8]> {
        let slot = self.check_app_owned(index)?;
        match &self.pool.descriptors()[slot].exposure {
            Exposure::Mapped(region) => Ok(region.as_slice()),
            other => Err(self.invalid_state(format!(
                "buffer #{index} is {}, not mapped",
                other.kind()
            ))),
        }
    }

    /// Writable contents of a mapped buffer the application owns.
    ///
    /// # Errors
    ///
    /// Same as [`BufferRing::data`].
    pub fn data_mut(&mut self, index: u32) -> Result<&mut [u8]> {
        self.check_app_owned(index)?;
        let device = self.label();
        let buffer_type = self.buffer_type();
        match self.pool.descriptor_mut(index).map(|d| &mut d.exposure) {
            Some(Exposure::Mapped(region)) => Ok(region.as_mut_slice()),
            other => Err(Error::InvalidState {
                device,
                buffer_type,
                detail: format!(
                    "buffer #{index} is {}, not mapped",
                    crate::format::raw_name(other.map(|exposure| exposure.kind()))
                ),
            }),
        }
    }

    /// DMABUF descriptor of an exported buffer the application owns.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`], or [`Error::InvalidState`] if the buffer is
    /// queued or the pool is not an exported one.
    pub fn exported_fd(&self, index: u32) -> Result<BorrowedFd<'_>> {
        let slot = self.check_app_owned(index)?;
        let exposure = &self.pool.descriptors()[slot].exposure;
        exposure.fd().ok_or_else(|| {
            self.invalid_state(format!(
                "buffer #{index} is {}, not exported",
                exposure.kind()
            ))
        })
    }

    /// Releases the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::ReleaseWhileQueued`] while the driver holds any buffer
    /// - [`Error::InvalidState`] while the stream is running, even drained
    ///
    /// Drain and stop the stream first. Otherwise as [`BufferPool::release`].
    pub fn release(&mut self) -> Result<()> {
        let queued = self.queued();
        if queued > 0 {
            return Err(Error::ReleaseWhileQueued {
                device: self.label(),
                buffer_type: self.buffer_type(),
                queued,
            });
        }
        self.pool.release()
    }

    /// Stream-off returns every queued buffer to the application unfilled.
    pub(crate) fn reset_queued_to_free(&mut self) {
        for state in &mut self.states {
            if *state == BufferState::QueuedToDriver {
                *state = BufferState::Free;
            }
        }
    }
}

impl std::fmt::Debug for BufferRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRing")
            .field("pool", &self.pool)
            .field("states", &self.states)
            .finish()
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        let queued = self.queued();
        let streaming = self.context().is_streaming(self.buffer_type());
        if queued == 0 && !streaming {
            return;
        }

        warn!(
            "Dropping {} ring of {} with {} queued buffer(s), stopping stream",
            self.buffer_type(),
            self.label(),
            queued
        );
        match self.context().driver.stream_off(self.buffer_type()) {
            Ok(()) => self.context().set_streaming(self.buffer_type(), false),
            Err(err) => tracing::error!("Failed to stop stream on drop: {:?}", err),
        }
        self.reset_queued_to_free();
    }
}
