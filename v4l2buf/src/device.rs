// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Device opening and capability verification.
//!
//! A [`DeviceHandle`] is the root of everything else: pools, rings and
//! streams keep a shared reference to its [`DeviceContext`], so the device
//! can not be closed while any of them is alive.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    os::{fd::OwnedFd, unix::fs::FileTypeExt},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, info};

use crate::{BufferType, Capabilities, DeviceCapabilities, Driver, Error, KernelDriver, Result};

/// What currently lives on one queue of the device.
#[derive(Debug, Clone, Copy, Default)]
struct QueueUsage {
    pools: u32,
    streaming: bool,
}

/// Shared per-device state.
///
/// Split from [`DeviceHandle`] so that buffer objects can hold on to the
/// driver without borrowing the handle.
pub(crate) struct DeviceContext {
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) path: PathBuf,
    pub(crate) capabilities: DeviceCapabilities,
    queues: Mutex<HashMap<BufferType, QueueUsage>>,
}

impl DeviceContext {
    /// Device identity used in log lines and errors.
    pub(crate) fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<BufferType, QueueUsage>> {
        // The map holds plain counters, a panicking holder can not corrupt it.
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a pool of `buffer_type` still holds a driver allocation.
    pub(crate) fn has_pool(&self, buffer_type: BufferType) -> bool {
        self.queues()
            .get(&buffer_type)
            .is_some_and(|usage| usage.pools > 0)
    }

    pub(crate) fn pool_allocated(&self, buffer_type: BufferType) {
        self.queues().entry(buffer_type).or_default().pools += 1;
    }

    pub(crate) fn pool_freed(&self, buffer_type: BufferType) {
        if let Some(usage) = self.queues().get_mut(&buffer_type) {
            usage.pools = usage.pools.saturating_sub(1);
        }
    }

    pub(crate) fn is_streaming(&self, buffer_type: BufferType) -> bool {
        self.queues()
            .get(&buffer_type)
            .is_some_and(|usage| usage.streaming)
    }

    pub(crate) fn set_streaming(&self, buffer_type: BufferType, streaming: bool) {
        self.queues().entry(buffer_type).or_default().streaming = streaming;
    }

    /// Refuses format changes on a queue that has buffers allocated.
    pub(crate) fn ensure_reconfigurable(&self, buffer_type: BufferType) -> Result<()> {
        if self.has_pool(buffer_type) {
            return Err(Error::InvalidState {
                device: self.label(),
                buffer_type,
                detail: "can not reconfigure while a buffer pool is allocated".to_string(),
            });
        }
        Ok(())
    }
}

/// An opened, capability-verified video device.
///
/// The handle carries no buffer type of its own: a memory-to-memory node has
/// an output and a capture queue, so the type is chosen per pool, ring,
/// stream and format negotiation.
///
/// # Examples
///
/// ```no_run
/// use v4l2buf::{Capabilities, DeviceHandle};
///
/// # fn main() -> Result<(), v4l2buf::Error> {
/// let device = DeviceHandle::open(
///     "/dev/video0",
///     Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
///     Capabilities::VIDEO_M2M,
/// )?;
/// println!("Capture card: {}", device.card());
/// device.close()?;
/// # Ok(())
/// # }
/// ```
pub struct DeviceHandle {
    context: Arc<DeviceContext>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("path", &self.context.path)
            .field("capabilities", &self.context.capabilities)
            .finish()
    }
}

impl DeviceHandle {
    /// Opens a device node and verifies its capabilities.
    ///
    /// # Arguments
    ///
    /// * `path` - Device node, e.g. `/dev/video0`
    /// * `required` - Every one of these capabilities must be present
    /// * `forbidden` - None of these capabilities may be present
    ///
    /// # Errors
    ///
    /// - [`Error::OpenFailed`] if the node can not be opened read/write
    /// - [`Error::NotCharDevice`] if the path is not a character device
    /// - [`Error::QueryFailed`] if the capability query fails
    /// - [`Error::MissingCapabilities`] / [`Error::ForbiddenCapabilities`]
    pub fn open(
        path: impl AsRef<Path>,
        required: Capabilities,
        forbidden: Capabilities,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::OpenFailed {
                path: path.to_owned(),
                source,
            })?;

        let metadata = file.metadata().map_err(|source| Error::OpenFailed {
            path: path.to_owned(),
            source,
        })?;
        if !metadata.file_type().is_char_device() {
            return Err(Error::NotCharDevice {
                path: path.to_owned(),
            });
        }

        let fd: OwnedFd = file.into();
        debug!("Device {} opened", path.display());

        Self::with_driver(path, KernelDriver::new(fd), required, forbidden)
    }

    /// Wraps an already opened driver and verifies its capabilities.
    ///
    /// This is how simulated or otherwise non-kernel devices are attached.
    pub fn with_driver(
        path: impl Into<PathBuf>,
        driver: impl Driver + 'static,
        required: Capabilities,
        forbidden: Capabilities,
    ) -> Result<Self> {
        let path = path.into();
        let device = path.display().to_string();

        let capabilities = driver
            .query_capabilities()
            .map_err(|source| Error::QueryFailed {
                device: device.clone(),
                source,
            })?;

        let effective = capabilities.effective();
        if !effective.contains(required) {
            return Err(Error::MissingCapabilities {
                device,
                missing: required.difference(effective),
            });
        }

        if effective.intersects(forbidden) {
            return Err(Error::ForbiddenCapabilities {
                device,
                present: effective & forbidden,
            });
        }

        info!(
            "Device {}: card \"{}\", driver \"{}\", capabilities {}",
            device, capabilities.card, capabilities.driver, effective
        );

        Ok(Self {
            context: Arc::new(DeviceContext {
                driver: Box::new(driver),
                path,
                capabilities,
                queues: Mutex::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.context.path
    }

    /// Card name captured at open time.
    pub fn card(&self) -> &str {
        &self.context.capabilities.card
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.context.capabilities
    }

    pub(crate) fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// Closes the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceInUse`] if a pool, ring or stream built on this
    /// device is still alive. The handle is dropped either way; the last
    /// holder then closes the descriptor.
    pub fn close(self) -> Result<()> {
        let device = self.context.label();
        let context = Arc::into_inner(self.context).ok_or_else(|| Error::DeviceInUse {
            device: device.clone(),
        })?;
        drop(context);
        debug!("Device {} closed", device);
        Ok(())
    }
}
