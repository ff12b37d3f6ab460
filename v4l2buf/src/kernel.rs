// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! [`Driver`] implementation on a real V4L2 device node.

use std::{
    ffi::c_void,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    ptr::NonNull,
    time::Duration,
};

use v4l2buf_sys as sys;

use crate::{
    BufferFlags, BufferInfo, BufferMetadata, BufferType, Capabilities, DeviceCapabilities, Driver,
    Field, Format, FourCc, Fraction, MemoryKind, QueueRequest, Readiness, StreamParameters,
};

/// Kernel V4L2 driver reached through `ioctl(2)` on an owned descriptor.
///
/// The descriptor is closed when the driver is dropped.
#[derive(Debug)]
pub struct KernelDriver {
    fd: OwnedFd,
}

impl KernelDriver {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Issues one ioctl, restarting it when interrupted by a signal.
    fn ioctl<T>(&self, request: sys::IoctlRequest, arg: &mut T) -> io::Result<()> {
        loop {
            let rc = unsafe {
                libc::ioctl(
                    self.fd.as_raw_fd(),
                    request as libc::Ioctl,
                    arg as *mut T as *mut c_void,
                )
            };
            if rc != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn raw_buffer(buffer_type: BufferType, memory: MemoryKind) -> sys::v4l2_buffer {
        let mut buf: sys::v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.type_ = buffer_type.as_raw();
        buf.memory = memory.as_raw();
        buf
    }
}

/// NUL-trimmed string from a fixed-size kernel byte array.
fn c_bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn timestamp_from_timeval(tv: &sys::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}

fn format_from_raw(buffer_type: BufferType, fmt: &sys::v4l2_format) -> Format {
    if buffer_type.is_multiplanar() {
        let mp = unsafe { fmt.fmt.pix_mp };
        let plane = mp.plane_fmt[0];
        Format {
            buffer_type,
            width: mp.width,
            height: mp.height,
            fourcc: FourCc::from_u32(mp.pixelformat),
            field: Field::from_raw(mp.field).unwrap_or_default(),
            bytes_per_line: plane.bytesperline,
            size_image: plane.sizeimage,
        }
    } else {
        let pix = unsafe { fmt.fmt.pix };
        Format {
            buffer_type,
            width: pix.width,
            height: pix.height,
            fourcc: FourCc::from_u32(pix.pixelformat),
            field: Field::from_raw(pix.field).unwrap_or_default(),
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        }
    }
}

impl Driver for KernelDriver {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        let mut cap: sys::v4l2_capability = unsafe { std::mem::zeroed() };
        self.ioctl(sys::VIDIOC_QUERYCAP, &mut cap)?;
        Ok(DeviceCapabilities {
            driver: c_bytes_to_string(&cap.driver),
            card: c_bytes_to_string(&cap.card),
            bus_info: c_bytes_to_string(&cap.bus_info),
            capabilities: Capabilities::from_bits_retain(cap.capabilities),
            device_caps: Capabilities::from_bits_retain(cap.device_caps),
        })
    }

    fn set_format(&self, format: &Format) -> io::Result<Format> {
        let mut fmt: sys::v4l2_format = unsafe { std::mem::zeroed() };
        fmt.type_ = format.buffer_type.as_raw();
        if format.buffer_type.is_multiplanar() {
            let mut mp: sys::v4l2_pix_format_mplane = unsafe { std::mem::zeroed() };
            mp.width = format.width;
            mp.height = format.height;
            mp.pixelformat = format.fourcc.to_u32();
            mp.field = format.field.as_raw();
            mp.num_planes = 1;
            mp.plane_fmt[0].bytesperline = format.bytes_per_line;
            mp.plane_fmt[0].sizeimage = format.size_image;
            fmt.fmt.pix_mp = mp;
        } else {
            let mut pix: sys::v4l2_pix_format = unsafe { std::mem::zeroed() };
            pix.width = format.width;
            pix.height = format.height;
            pix.pixelformat = format.fourcc.to_u32();
            pix.field = format.field.as_raw();
            pix.bytesperline = format.bytes_per_line;
            pix.sizeimage = format.size_image;
            fmt.fmt.pix = pix;
        }

        self.ioctl(sys::VIDIOC_S_FMT, &mut fmt)?;
        Ok(format_from_raw(format.buffer_type, &fmt))
    }

    fn stream_parameters(&self, buffer_type: BufferType) -> io::Result<StreamParameters> {
        let mut parm: sys::v4l2_streamparm = unsafe { std::mem::zeroed() };
        parm.type_ = buffer_type.as_raw();
        self.ioctl(sys::VIDIOC_G_PARM, &mut parm)?;

        let (capability, timeperframe) = if buffer_type.is_output() {
            let output = unsafe { parm.parm.output };
            (output.capability, output.timeperframe)
        } else {
            let capture = unsafe { parm.parm.capture };
            (capture.capability, capture.timeperframe)
        };

        Ok(StreamParameters {
            time_per_frame_supported: capability & sys::V4L2_CAP_TIMEPERFRAME != 0,
            time_per_frame: Fraction::new(timeperframe.numerator, timeperframe.denominator),
        })
    }

    fn set_time_per_frame(
        &self,
        buffer_type: BufferType,
        time_per_frame: Fraction,
    ) -> io::Result<Fraction> {
        let mut parm: sys::v4l2_streamparm = unsafe { std::mem::zeroed() };
        parm.type_ = buffer_type.as_raw();
        self.ioctl(sys::VIDIOC_G_PARM, &mut parm)?;

        let fract = sys::v4l2_fract {
            numerator: time_per_frame.numerator,
            denominator: time_per_frame.denominator,
        };
        unsafe {
            if buffer_type.is_output() {
                parm.parm.output.timeperframe = fract;
            } else {
                parm.parm.capture.timeperframe = fract;
            }
        }

        self.ioctl(sys::VIDIOC_S_PARM, &mut parm)?;

        let applied = if buffer_type.is_output() {
            unsafe { parm.parm.output.timeperframe }
        } else {
            unsafe { parm.parm.capture.timeperframe }
        };
        Ok(Fraction::new(applied.numerator, applied.denominator))
    }

    fn request_buffers(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
        count: u32,
    ) -> io::Result<u32> {
        let mut reqbuf = sys::v4l2_requestbuffers {
            count,
            type_: buffer_type.as_raw(),
            memory: memory.as_raw(),
            ..Default::default()
        };
        self.ioctl(sys::VIDIOC_REQBUFS, &mut reqbuf)?;
        Ok(reqbuf.count)
    }

    fn query_buffer(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
        index: u32,
    ) -> io::Result<BufferInfo> {
        let mut buf = Self::raw_buffer(buffer_type, memory);
        buf.index = index;

        if buffer_type.is_multiplanar() {
            let mut plane: sys::v4l2_plane = unsafe { std::mem::zeroed() };
            buf.length = 1;
            buf.m.planes = &mut plane;
            self.ioctl(sys::VIDIOC_QUERYBUF, &mut buf)?;
            return Ok(BufferInfo {
                index,
                length: plane.length,
                offset: unsafe { plane.m.mem_offset },
            });
        }

        self.ioctl(sys::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferInfo {
            index,
            length: buf.length,
            offset: unsafe { buf.m.offset },
        })
    }

    fn map(&self, offset: u32, length: usize) -> io::Result<NonNull<u8>> {
        let address = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(address.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
    }

    unsafe fn unmap(&self, address: NonNull<u8>, length: usize) -> io::Result<()> {
        let rc = unsafe { libc::munmap(address.as_ptr().cast::<c_void>(), length) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn export_buffer(&self, buffer_type: BufferType, index: u32) -> io::Result<OwnedFd> {
        let mut ebuf = sys::v4l2_exportbuffer {
            type_: buffer_type.as_raw(),
            index,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            ..Default::default()
        };
        self.ioctl(sys::VIDIOC_EXPBUF, &mut ebuf)?;
        // SAFETY
        // A successful EXPBUF returns a fresh descriptor owned by the caller.
        Ok(unsafe { OwnedFd::from_raw_fd(ebuf.fd) })
    }

    fn queue_buffer(&self, request: &QueueRequest) -> io::Result<()> {
        let mut buf = Self::raw_buffer(request.buffer_type, request.memory);
        buf.index = request.index;
        buf.flags = request.flags.bits();
        buf.field = request.field.as_raw();
        buf.timestamp.tv_sec = request.timestamp.as_secs() as _;
        buf.timestamp.tv_usec = request.timestamp.subsec_micros() as _;

        if request.buffer_type.is_multiplanar() {
            let mut plane: sys::v4l2_plane = unsafe { std::mem::zeroed() };
            plane.bytesused = request.bytes_used;
            plane.length = request.length;
            if let Some(fd) = request.dmabuf_fd {
                plane.m.fd = fd;
            }
            buf.length = 1;
            buf.m.planes = &mut plane;
            return self.ioctl(sys::VIDIOC_QBUF, &mut buf);
        }

        buf.bytesused = request.bytes_used;
        if let Some(fd) = request.dmabuf_fd {
            buf.m.fd = fd;
            buf.length = request.length;
        }
        self.ioctl(sys::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(
        &self,
        buffer_type: BufferType,
        memory: MemoryKind,
    ) -> io::Result<BufferMetadata> {
        let mut buf = Self::raw_buffer(buffer_type, memory);
        let mut plane: sys::v4l2_plane = unsafe { std::mem::zeroed() };
        if buffer_type.is_multiplanar() {
            buf.length = 1;
            buf.m.planes = &mut plane;
        }

        self.ioctl(sys::VIDIOC_DQBUF, &mut buf)?;

        let bytes_used = if buffer_type.is_multiplanar() {
            plane.bytesused
        } else {
            buf.bytesused
        };
        Ok(BufferMetadata {
            index: buf.index,
            bytes_used,
            flags: BufferFlags::from_bits_retain(buf.flags),
            field: Field::from_raw(buf.field).unwrap_or_default(),
            timestamp: timestamp_from_timeval(&buf.timestamp),
            sequence: buf.sequence,
        })
    }

    fn stream_on(&self, buffer_type: BufferType) -> io::Result<()> {
        let mut ty = buffer_type.as_raw() as libc::c_int;
        self.ioctl(sys::VIDIOC_STREAMON, &mut ty)
    }

    fn stream_off(&self, buffer_type: BufferType) -> io::Result<()> {
        let mut ty = buffer_type.as_raw() as libc::c_int;
        self.ioctl(sys::VIDIOC_STREAMOFF, &mut ty)
    }

    fn poll(&self, buffer_type: BufferType, timeout: Option<Duration>) -> io::Result<Readiness> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: if buffer_type.is_output() {
                libc::POLLOUT
            } else {
                libc::POLLIN
            },
            revents: 0,
        };
        let timeout_ms = timeout
            .map(|timeout| timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let rc = loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        if rc == 0 {
            return Ok(Readiness::default());
        }
        Ok(Readiness {
            readable: pfd.revents & libc::POLLIN != 0,
            writable: pfd.revents & libc::POLLOUT != 0,
            error: pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
        })
    }
}
