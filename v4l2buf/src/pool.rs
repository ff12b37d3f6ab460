// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer allocation and memory exposure.
//!
//! A pool is built in two steps: [`request`] asks the driver for exactly N
//! buffers, then one of the `expose_*` functions turns each of them into a
//! [`BufferDescriptor`]. Both steps are all-or-nothing: a failure part way
//! through undoes everything the step acquired before the error is returned.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    BufferDescriptor, BufferType, DeviceHandle, Error, Exposure, ExposureKind, MappedRegion,
    MemoryKind, Result, device::DeviceContext,
};

/// Requests exactly `count` buffers of the given memory kind.
///
/// # Errors
///
/// - [`Error::RequestFailed`] if the driver rejects the request
/// - [`Error::UnsupportedCapability`] if the driver grants zero buffers
/// - [`Error::CountMismatch`] if the driver grants any other count; the
///   partial allocation is handed back before returning
pub fn request(
    device: &DeviceHandle,
    buffer_type: BufferType,
    count: u32,
    memory: MemoryKind,
) -> Result<u32> {
    request_in(device.context(), buffer_type, count, memory)
}

pub(crate) fn request_in(
    context: &Arc<DeviceContext>,
    buffer_type: BufferType,
    count: u32,
    memory: MemoryKind,
) -> Result<u32> {
    debug!(
        "Obtaining {} {} buffers for {} {}",
        count,
        memory,
        context.label(),
        buffer_type
    );

    let granted = context
        .driver
        .request_buffers(buffer_type, memory, count)
        .map_err(|source| Error::RequestFailed {
            device: context.label(),
            buffer_type,
            memory,
            source,
        })?;

    if granted == 0 {
        return Err(Error::UnsupportedCapability {
            device: context.label(),
            buffer_type,
            memory,
        });
    }

    if granted != count {
        free_allocation(context, buffer_type, memory);
        return Err(Error::CountMismatch {
            device: context.label(),
            buffer_type,
            requested: count,
            granted,
        });
    }

    debug!("Got {} {} buffers", granted, buffer_type);
    Ok(granted)
}

/// Returns every buffer of a queue to the driver, logging failures.
fn free_allocation(context: &DeviceContext, buffer_type: BufferType, memory: MemoryKind) {
    if let Err(err) = context.driver.request_buffers(buffer_type, memory, 0) {
        warn!(
            "Failed to free {} {} buffers of {}: {}",
            memory,
            buffer_type,
            context.label(),
            err
        );
    }
}

/// Maps every buffer `0..count` shared and read/write.
///
/// # Errors
///
/// [`Error::QueryBufferFailed`] or [`Error::MapFailed`] for the first buffer
/// that fails. Regions mapped earlier in the call are unmapped first.
pub fn expose_mapped(
    device: &DeviceHandle,
    buffer_type: BufferType,
    count: u32,
) -> Result<Vec<BufferDescriptor>> {
    expose_mapped_in(device.context(), buffer_type, count)
}

fn expose_mapped_in(
    context: &Arc<DeviceContext>,
    buffer_type: BufferType,
    count: u32,
) -> Result<Vec<BufferDescriptor>> {
    let mut descriptors = Vec::with_capacity(count as usize);

    for index in 0..count {
        let mapped = context
            .driver
            .query_buffer(buffer_type, MemoryKind::Mmap, index)
            .map_err(|source| Error::QueryBufferFailed {
                device: context.label(),
                buffer_type,
                index,
                source,
            })
            .and_then(|info| {
                debug!(
                    "Got {} buffer #{}: length = {}",
                    buffer_type, index, info.length
                );
                context
                    .driver
                    .map(info.offset, info.length as usize)
                    .map(|address| (info, address))
                    .map_err(|source| Error::MapFailed {
                        device: context.label(),
                        buffer_type,
                        index,
                        source,
                    })
            });

        match mapped {
            Ok((info, address)) => descriptors.push(BufferDescriptor {
                index,
                length: info.length,
                exposure: Exposure::Mapped(MappedRegion::new(
                    context.clone(),
                    buffer_type,
                    index,
                    address,
                    info.length as usize,
                )),
            }),
            Err(err) => {
                unwind(context, buffer_type, descriptors);
                return Err(err);
            }
        }
    }

    Ok(descriptors)
}

/// Exports every buffer `0..count` as a DMABUF descriptor.
///
/// # Errors
///
/// [`Error::QueryBufferFailed`] or [`Error::ExportFailed`] for the first
/// buffer that fails. Descriptors exported earlier in the call are closed
/// first.
pub fn expose_exported(
    device: &DeviceHandle,
    buffer_type: BufferType,
    count: u32,
) -> Result<Vec<BufferDescriptor>> {
    expose_exported_in(device.context(), buffer_type, count)
}

fn expose_exported_in(
    context: &Arc<DeviceContext>,
    buffer_type: BufferType,
    count: u32,
) -> Result<Vec<BufferDescriptor>> {
    let mut descriptors = Vec::with_capacity(count as usize);

    for index in 0..count {
        let exported = context
            .driver
            .query_buffer(buffer_type, MemoryKind::Mmap, index)
            .map_err(|source| Error::QueryBufferFailed {
                device: context.label(),
                buffer_type,
                index,
                source,
            })
            .and_then(|info| {
                context
                    .driver
                    .export_buffer(buffer_type, index)
                    .map(|fd| (info, fd))
                    .map_err(|source| Error::ExportFailed {
                        device: context.label(),
                        buffer_type,
                        index,
                        source,
                    })
            });

        match exported {
            Ok((info, fd)) => {
                debug!("Exported {} buffer #{}: fd = {:?}", buffer_type, index, fd);
                descriptors.push(BufferDescriptor {
                    index,
                    length: info.length,
                    exposure: Exposure::Exported(fd),
                });
            }
            Err(err) => {
                unwind(context, buffer_type, descriptors);
                return Err(err);
            }
        }
    }

    Ok(descriptors)
}

/// Describes every buffer `0..count` of a DMABUF-import queue.
///
/// No memory is attached here; each queue supplies a descriptor.
pub fn expose_imported(
    device: &DeviceHandle,
    buffer_type: BufferType,
    count: u32,
) -> Result<Vec<BufferDescriptor>> {
    expose_imported_in(device.context(), buffer_type, count)
}

fn expose_imported_in(
    context: &Arc<DeviceContext>,
    buffer_type: BufferType,
    count: u32,
) -> Result<Vec<BufferDescriptor>> {
    (0..count)
        .map(|index| {
            let info = context
                .driver
                .query_buffer(buffer_type, MemoryKind::DmaBuf, index)
                .map_err(|source| Error::QueryBufferFailed {
                    device: context.label(),
                    buffer_type,
                    index,
                    source,
                })?;
            Ok(BufferDescriptor {
                index,
                length: info.length,
                exposure: Exposure::Imported,
            })
        })
        .collect()
}

/// Releases descriptors acquired by a failed expose call.
fn unwind(context: &DeviceContext, buffer_type: BufferType, descriptors: Vec<BufferDescriptor>) {
    if descriptors.is_empty() {
        return;
    }
    debug!(
        "Unwinding {} {} buffer(s) of {}",
        descriptors.len(),
        buffer_type,
        context.label()
    );
    for descriptor in descriptors {
        match descriptor.exposure {
            Exposure::Mapped(region) => {
                if let Err(err) = region.unmap() {
                    warn!("{}", err);
                }
            }
            Exposure::Exported(fd) => drop(fd),
            Exposure::Imported => {}
        }
    }
}

/// A fixed table of N buffers exposed to the application.
///
/// N and the exposure kind never change. The pool owns every mapping and
/// exported descriptor until [`BufferPool::release`] (or drop).
///
/// # Examples
///
/// ```no_run
/// use v4l2buf::{BufferPool, BufferType, Capabilities, DeviceHandle, ExposureKind};
///
/// # fn main() -> Result<(), v4l2buf::Error> {
/// let device = DeviceHandle::open(
///     "/dev/video0",
///     Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
///     Capabilities::empty(),
/// )?;
/// let mut pool = BufferPool::new(&device, BufferType::VideoCapture, 4, ExposureKind::Mapped)?;
/// assert_eq!(pool.len(), 4);
/// pool.release()?;
/// # Ok(())
/// # }
/// ```
pub struct BufferPool {
    context: Arc<DeviceContext>,
    buffer_type: BufferType,
    exposure: ExposureKind,
    count: u32,
    descriptors: Vec<BufferDescriptor>,
    released: bool,
}

impl BufferPool {
    /// Requests `count` buffers and exposes them.
    ///
    /// # Errors
    ///
    /// Any error of [`request`] or of the matching `expose_*` function. When
    /// exposing fails the driver allocation is handed back too, so a failed
    /// construction leaves nothing behind.
    pub fn new(
        device: &DeviceHandle,
        buffer_type: BufferType,
        count: u32,
        exposure: ExposureKind,
    ) -> Result<Self> {
        let context = device.context();
        let memory = exposure.memory();
        request_in(context, buffer_type, count, memory)?;

        let exposed = match exposure {
            ExposureKind::Mapped => expose_mapped_in(context, buffer_type, count),
            ExposureKind::Exported => expose_exported_in(context, buffer_type, count),
            ExposureKind::Imported => expose_imported_in(context, buffer_type, count),
        };

        let descriptors = match exposed {
            Ok(descriptors) => descriptors,
            Err(err) => {
                free_allocation(context, buffer_type, memory);
                return Err(err);
            }
        };

        context.pool_allocated(buffer_type);
        info!(
            "Pool of {} {} {} buffers ready on {}",
            count,
            exposure,
            buffer_type,
            context.label()
        );

        Ok(Self {
            context: context.clone(),
            buffer_type,
            exposure,
            count,
            descriptors,
            released: false,
        })
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn exposure(&self) -> ExposureKind {
        self.exposure
    }

    pub fn memory(&self) -> MemoryKind {
        self.exposure.memory()
    }

    /// Number of buffers, fixed at creation.
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Descriptors in index order. Empty once released.
    pub fn descriptors(&self) -> &[BufferDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, index: u32) -> Option<&BufferDescriptor> {
        self.descriptors.get(index as usize)
    }

    pub(crate) fn descriptor_mut(&mut self, index: u32) -> Option<&mut BufferDescriptor> {
        self.descriptors.get_mut(index as usize)
    }

    pub(crate) fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// Unmaps or closes every buffer and hands the allocation back to the
    /// driver.
    ///
    /// Calling it again after success is a no-op. The caller must make sure
    /// the driver holds none of the buffers; [`crate::BufferRing::release`]
    /// enforces that.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the queue is still streaming; nothing is
    ///   released
    /// - the first [`Error::UnmapFailed`] or [`Error::RequestFailed`]
    ///   encountered. Every buffer is unmapped or closed regardless, and a
    ///   failed hand-back is retried by the next call
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if self.context.is_streaming(self.buffer_type) {
            return Err(Error::InvalidState {
                device: self.context.label(),
                buffer_type: self.buffer_type,
                detail: "can not release buffers while streaming".to_string(),
            });
        }
        self.free()
    }

    fn free(&mut self) -> Result<()> {
        let mut first_error = None;
        for descriptor in self.descriptors.drain(..) {
            match descriptor.exposure {
                Exposure::Mapped(region) => {
                    if let Err(err) = region.unmap() {
                        warn!("{}", err);
                        first_error.get_or_insert(err);
                    }
                }
                Exposure::Exported(fd) => drop(fd),
                Exposure::Imported => {}
            }
        }

        let memory = self.exposure.memory();
        match self
            .context
            .driver
            .request_buffers(self.buffer_type, memory, 0)
        {
            Ok(_) => {
                self.released = true;
                self.context.pool_freed(self.buffer_type);
                debug!(
                    "Released {} {} pool of {}",
                    self.exposure,
                    self.buffer_type,
                    self.context.label()
                );
            }
            Err(source) => {
                first_error.get_or_insert(Error::RequestFailed {
                    device: self.context.label(),
                    buffer_type: self.buffer_type,
                    memory,
                    source,
                });
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("device", &self.context.path)
            .field("buffer_type", &self.buffer_type)
            .field("exposure", &self.exposure)
            .field("count", &self.count)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.free() {
            tracing::error!("Failed to release buffer pool on drop: {:?}", err);
        }
        if !self.released {
            self.context.pool_freed(self.buffer_type);
        }
    }
}
