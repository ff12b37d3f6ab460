// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Simulated V4L2 device shared by the integration tests.
//!
//! [`SimulatedDriver`] keeps its state behind an `Arc<Mutex<_>>` so that a
//! test can hand one clone to [`DeviceHandle::with_driver`] and keep another
//! to inject failures and inspect what the crate did.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use v4l2buf::{
    BufferInfo, BufferMetadata, BufferType, Capabilities, DeviceCapabilities, DeviceHandle,
    Driver, Field, Format, Fraction, MemoryKind, QueueRequest, Readiness, StreamParameters,
};

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

pub fn setup_logging() {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .init();
    });
}

pub const DEVICE_PATH: &str = "/dev/video-sim";

/// Default length of every simulated buffer.
pub const BUFFER_LENGTH: u32 = 640 * 480 * 2;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Per buffer type bookkeeping.
#[derive(Default)]
pub struct QueueState {
    pub allocated: u32,
    pub memory: Option<MemoryKind>,
    pub streaming: bool,
    /// Buffers currently owned by the simulated driver, oldest first.
    pub queued: VecDeque<QueueRequest>,
    /// Every accepted queue request, oldest first.
    pub history: Vec<QueueRequest>,
    pub stream_on_calls: u32,
    pub stream_off_calls: u32,
}

/// Knobs and observable state of the simulated device.
pub struct SimState {
    pub capabilities: DeviceCapabilities,
    pub buffer_length: u32,
    /// Grant this many buffers instead of the requested count.
    pub grant: Option<u32>,
    /// Payload reported for capture buffers; the buffer length when `None`.
    pub frame_size: Option<u32>,
    /// Adjust the format to this size instead of accepting the request.
    pub format_override: Option<(u32, u32)>,
    pub time_per_frame_supported: bool,
    pub time_per_frame: Fraction,
    /// Highest frame rate the simulated sensor can deliver.
    pub max_framerate: u32,
    pub fail_query_capabilities: bool,
    pub fail_set_format: bool,
    pub fail_stream_parameters: bool,
    pub fail_request: bool,
    pub fail_map_at: Option<u32>,
    pub fail_export_at: Option<u32>,
    pub fail_queue: bool,
    pub fail_dequeue: bool,
    pub fail_stream_on: bool,
    pub fail_stream_off: bool,
    /// Report this index on the next dequeue instead of the queued one.
    pub bogus_dequeue_index: Option<u32>,
    /// Report one byte more than the buffer length on dequeue.
    pub overreport_bytes_used: bool,
    pub queues: HashMap<BufferType, QueueState>,
    /// Live mappings: address to (offset, length).
    pub mappings: HashMap<usize, (u32, usize)>,
    /// Read ends of the pipes handed out as exported buffers.
    pub exports: Vec<OwnedFd>,
    pub sequence: u32,
}

impl SimState {
    pub fn queue(&mut self, buffer_type: BufferType) -> &mut QueueState {
        self.queues.entry(buffer_type).or_default()
    }

    pub fn queue_ref(&self, buffer_type: BufferType) -> Option<&QueueState> {
        self.queues.get(&buffer_type)
    }

    pub fn allocated(&self, buffer_type: BufferType) -> u32 {
        self.queue_ref(buffer_type).map_or(0, |q| q.allocated)
    }

    pub fn live_mappings(&self) -> usize {
        self.mappings.len()
    }

    /// Number of exported descriptors the application still holds open.
    pub fn open_exports(&self) -> usize {
        self.exports
            .iter()
            .filter(|read_end| {
                let mut byte = 0u8;
                let rc = unsafe {
                    libc::read(
                        read_end.as_raw_fd(),
                        (&mut byte as *mut u8).cast::<libc::c_void>(),
                        1,
                    )
                };
                // EOF means every write end is closed.
                rc != 0
            })
            .count()
    }

    fn mapping_for(&self, buffer_type: BufferType, index: u32) -> Option<(usize, usize)> {
        let offset = offset_of(buffer_type, index);
        self.mappings
            .iter()
            .find(|(_, (o, _))| *o == offset)
            .map(|(address, (_, length))| (*address, *length))
    }
}

fn offset_of(buffer_type: BufferType, index: u32) -> u32 {
    (buffer_type.as_raw() << 16) | index
}

/// A capture/output device living entirely in memory.
#[derive(Clone)]
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDriver {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                capabilities: DeviceCapabilities {
                    driver: "vsim".to_string(),
                    card: "Simulated camera".to_string(),
                    bus_info: "platform:vsim".to_string(),
                    capabilities: capabilities | Capabilities::DEVICE_CAPS,
                    device_caps: capabilities,
                },
                buffer_length: BUFFER_LENGTH,
                grant: None,
                frame_size: None,
                format_override: None,
                time_per_frame_supported: true,
                time_per_frame: Fraction::new(1, 25),
                max_framerate: 60,
                fail_query_capabilities: false,
                fail_set_format: false,
                fail_stream_parameters: false,
                fail_request: false,
                fail_map_at: None,
                fail_export_at: None,
                fail_queue: false,
                fail_dequeue: false,
                fail_stream_on: false,
                fail_stream_off: false,
                bogus_dequeue_index: None,
                overreport_bytes_used: false,
                queues: HashMap::new(),
                mappings: HashMap::new(),
                exports: Vec::new(),
                sequence: 0,
            })),
        }
    }

    /// A streaming single-planar capture device.
    pub fn capture() -> Self {
        Self::new(Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING)
    }

    /// A streaming memory-to-memory device, like a hardware encoder.
    pub fn m2m() -> Self {
        Self::new(Capabilities::VIDEO_M2M | Capabilities::STREAMING)
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }
}

/// Opens a simulated capture device.
pub fn open_capture(driver: &SimulatedDriver) -> DeviceHandle {
    setup_logging();
    DeviceHandle::with_driver(
        DEVICE_PATH,
        driver.clone(),
        Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
        Capabilities::empty(),
    )
    .unwrap()
}

impl Driver for SimulatedDriver {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        let state = self.state();
        if state.fail_query_capabilities {
            return Err(errno(libc::ENOTTY));
        }
        Ok(state.capabilities.clone())
    }

    fn set_format(&self, format: &Format) -> io::Result<Format> {
        let state = self.state();
        if state.fail_set_format {
            return Err(errno(libc::EINVAL));
        }
        let (width, height) = state
            .format_override
            .unwrap_or((format.width, format.height));
        Ok(Format {
            width,
            height,
            field: Field::None,
            bytes_per_line: width * 2,
            size_image: width * height * 2,
            ..*format
        })
    }

    fn stream_parameters(&self, _buffer_type: BufferType) -> io::Result<StreamParameters> {
        let state = self.state();
        if state.fail_stream_parameters {
            return Err(errno(libc::EINVAL));
        }
        Ok(StreamParameters {
            time_per_frame_supported: state.time_per_frame_supported,
            time_per_frame: state.time_per_frame,
        })
    }

    fn set_time_per_frame(
        &self,
        _buffer_type: BufferType,
        time_per_frame: Fraction,
    ) -> io::Result<Fraction> {
        let mut state = self.state();
        let denominator = time_per_frame.denominator.min(state.max_framerate);
        state.time_per_frame = Fraction::new(1, denominator);
        Ok(state.time_per_frame)
    }

    fn request_buffers(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
        count: u32,
    ) -> io::Result<u32> {
        let mut state = self.state();
        if state.fail_request {
            return Err(errno(libc::EINVAL));
        }
        let grant = state.grant;
        let queue = state.queue(buffer_type);
        if queue.streaming {
            return Err(errno(libc::EBUSY));
        }
        let granted = if count == 0 { 0 } else { grant.unwrap_or(count) };
        queue.allocated = granted;
        queue.memory = (granted > 0).then_some(memory);
        queue.queued.clear();
        Ok(granted)
    }

    fn query_buffer(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
        index: u32,
    ) -> io::Result<BufferInfo> {
        let mut state = self.state();
        let length = state.buffer_length;
        let queue = state.queue(buffer_type);
        if index >= queue.allocated || queue.memory != Some(memory) {
            return Err(errno(libc::EINVAL));
        }
        Ok(BufferInfo {
            index,
            length,
            offset: offset_of(buffer_type, index),
        })
    }

    fn map(&self, offset: u32, length: usize) -> io::Result<NonNull<u8>> {
        let mut state = self.state();
        if state.fail_map_at == Some(offset & 0xffff) {
            return Err(errno(libc::ENOMEM));
        }
        let memory = vec![0u8; length].into_boxed_slice();
        let address = Box::into_raw(memory).cast::<u8>();
        state.mappings.insert(address as usize, (offset, length));
        NonNull::new(address).ok_or_else(|| errno(libc::ENOMEM))
    }

    unsafe fn unmap(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        let mut state = self.state();
        match state.mappings.remove(&(address.as_ptr() as usize)) {
            Some((_, mapped)) if mapped == length => {
                let slice = std::ptr::slice_from_raw_parts_mut(address.as_ptr(), length);
                drop(unsafe { Box::from_raw(slice) });
                Ok(())
            }
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn export_buffer(&self, buffer_type: BufferType, index: u32) -> io::Result<OwnedFd> {
        let mut state = self.state();
        if state.fail_export_at == Some(index) || index >= state.allocated(buffer_type) {
            return Err(errno(libc::EIO));
        }
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY
        // pipe2 succeeded, both descriptors are fresh and owned here.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        state.exports.push(read_end);
        Ok(write_end)
    }

    fn queue_buffer(&self, request: &QueueRequest) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_queue {
            return Err(errno(libc::EINVAL));
        }
        let queue = state.queue(request.buffer_type);
        if request.index >= queue.allocated || queue.memory != Some(request.memory) {
            return Err(errno(libc::EINVAL));
        }
        if request.memory == MemoryKind::DmaBuf && request.dmabuf_fd.is_none() {
            return Err(errno(libc::EINVAL));
        }
        queue.queued.push_back(*request);
        queue.history.push(*request);
        Ok(())
    }

    fn dequeue_buffer(
        &self,
        buffer_type: BufferType,
        _memory: MemoryKind,
    ) -> io::Result<BufferMetadata> {
        let mut state = self.state();
        if state.fail_dequeue {
            return Err(errno(libc::EIO));
        }
        let frame_size = state.frame_size;
        let overreport = state.overreport_bytes_used;
        let bogus = state.bogus_dequeue_index.take();

        let queue = state.queue(buffer_type);
        if !queue.streaming {
            return Err(errno(libc::EINVAL));
        }
        let request = queue.queued.pop_front().ok_or_else(|| errno(libc::EAGAIN))?;

        state.sequence += 1;
        let sequence = state.sequence;

        let mut bytes_used = if buffer_type.is_output() {
            request.bytes_used
        } else {
            frame_size.unwrap_or(request.length).min(request.length)
        };
        if overreport {
            bytes_used = request.length + 1;
        }

        if !buffer_type.is_output()
            && let Some((address, length)) = state.mapping_for(buffer_type, request.index)
        {
            let fill = bytes_used.min(length as u32) as usize;
            unsafe { std::ptr::write_bytes(address as *mut u8, sequence as u8, fill) };
        }

        Ok(BufferMetadata {
            index: bogus.unwrap_or(request.index),
            bytes_used,
            flags: request.flags,
            field: Field::None,
            timestamp: Duration::from_millis(u64::from(sequence) * 40),
            sequence,
        })
    }

    fn stream_on(&self, buffer_type: BufferType) -> io::Result<()> {
        let mut state = self.state();
        let fail = state.fail_stream_on;
        let queue = state.queue(buffer_type);
        queue.stream_on_calls += 1;
        if fail || queue.allocated == 0 {
            return Err(errno(libc::EIO));
        }
        queue.streaming = true;
        Ok(())
    }

    fn stream_off(&self, buffer_type: BufferType) -> io::Result<()> {
        let mut state = self.state();
        let fail = state.fail_stream_off;
        let queue = state.queue(buffer_type);
        queue.stream_off_calls += 1;
        if fail {
            return Err(errno(libc::EIO));
        }
        queue.streaming = false;
        queue.queued.clear();
        Ok(())
    }

    fn poll(&self, buffer_type: BufferType, _timeout: Option<Duration>) -> io::Result<Readiness> {
        let state = self.state();
        let ready = state
            .queue_ref(buffer_type)
            .is_some_and(|queue| queue.streaming && !queue.queued.is_empty());
        Ok(Readiness {
            readable: ready && !buffer_type.is_output(),
            writable: ready && buffer_type.is_output(),
            error: false,
        })
    }
}
