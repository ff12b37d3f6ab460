// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Stream-on / stream-off control of one buffer queue.

use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};

use crate::{BufferRing, BufferType, DeviceHandle, Error, Result, device::DeviceContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Stopped,
    Running,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamState::Stopped => "stopped",
            StreamState::Running => "running",
        })
    }
}

/// Streaming switch of one queue of a device.
///
/// A stream is started only once every buffer of the ring is queued, and
/// stopping it hands every queued buffer back to the application as
/// [`crate::BufferState::Free`]. While it runs the ring's pool can not be
/// released and the queue's format can not change. Dropping a running
/// controller stops the stream.
pub struct StreamController {
    context: Arc<DeviceContext>,
    buffer_type: BufferType,
    state: StreamState,
}

impl StreamController {
    pub fn new(device: &DeviceHandle, buffer_type: BufferType) -> Self {
        Self {
            context: device.context().clone(),
            buffer_type,
            state: StreamState::Stopped,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    fn check_ring(&self, ring: &BufferRing) -> Result<()> {
        if !Arc::ptr_eq(&self.context, ring.context()) || ring.buffer_type() != self.buffer_type {
            return Err(Error::InvalidState {
                device: self.context.label(),
                buffer_type: self.buffer_type,
                detail: format!(
                    "ring of {} {} does not belong to this stream",
                    ring.context().label(),
                    ring.buffer_type()
                ),
            });
        }
        Ok(())
    }

    /// Starts streaming.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the stream is already running or `ring`
    ///   belongs to another queue
    /// - [`Error::StreamStartFailed`] if not every buffer of `ring` is queued,
    ///   or the driver refuses to start; the stream stays stopped
    pub fn start(&mut self, ring: &BufferRing) -> Result<()> {
        self.check_ring(ring)?;
        if self.state == StreamState::Running {
            return Err(Error::InvalidState {
                device: self.context.label(),
                buffer_type: self.buffer_type,
                detail: "stream is already running".to_string(),
            });
        }

        let queued = ring.queued();
        if queued != ring.len() as usize {
            return Err(Error::StreamStartFailed {
                device: self.context.label(),
                buffer_type: self.buffer_type,
                reason: format!("only {} of {} buffers are queued", queued, ring.len()),
                source: None,
            });
        }

        self.context
            .driver
            .stream_on(self.buffer_type)
            .map_err(|source| Error::StreamStartFailed {
                device: self.context.label(),
                buffer_type: self.buffer_type,
                reason: "driver refused stream-on".to_string(),
                source: Some(source),
            })?;

        self.state = StreamState::Running;
        self.context.set_streaming(self.buffer_type, true);
        info!("Stream {} {} started", self.context.label(), self.buffer_type);
        Ok(())
    }

    /// Stops streaming and returns every queued buffer to the application.
    ///
    /// Does nothing if the stream is stopped and nothing is queued.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if `ring` belongs to another queue
    /// - [`Error::StreamStopFailed`] if the driver refuses; buffer states are
    ///   left untouched
    pub fn stop(&mut self, ring: &mut BufferRing) -> Result<()> {
        self.check_ring(ring)?;
        if self.state == StreamState::Stopped && ring.queued() == 0 {
            debug!(
                "Stream {} {} already stopped",
                self.context.label(),
                self.buffer_type
            );
            return Ok(());
        }

        self.context
            .driver
            .stream_off(self.buffer_type)
            .map_err(|source| Error::StreamStopFailed {
                device: self.context.label(),
                buffer_type: self.buffer_type,
                source,
            })?;

        ring.reset_queued_to_free();
        self.state = StreamState::Stopped;
        self.context.set_streaming(self.buffer_type, false);
        info!("Stream {} {} stopped", self.context.label(), self.buffer_type);
        Ok(())
    }
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("device", &self.context.path)
            .field("buffer_type", &self.buffer_type)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if self.state != StreamState::Running {
            return;
        }
        warn!(
            "Dropping running stream {} {}, stopping it",
            self.context.label(),
            self.buffer_type
        );
        match self.context.driver.stream_off(self.buffer_type) {
            Ok(()) => self.context.set_streaming(self.buffer_type, false),
            Err(err) => tracing::error!("Failed to stop stream on drop: {:?}", err),
        }
    }
}
