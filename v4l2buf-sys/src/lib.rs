// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! # v4l2buf-sys: Raw V4L2 uAPI layouts
//!
//! This crate provides the low-level structure layouts and constants of the
//! Linux Video4Linux2 userspace API, generated with `bindgen` from
//! `<linux/videodev2.h>`, plus the `VIDIOC_*` ioctl request codes.
//!
//! ## Usage
//!
//! **Most users should NOT use this crate directly.** Use the safe
//! [`v4l2buf`] crate instead, which provides:
//! - RAII ownership of mapped and exported buffers
//! - An explicit per-buffer custody state machine
//! - Rust-idiomatic error handling with `Result`
//!
//! ## Safety
//!
//! Every structure here is passed by pointer to `ioctl(2)`. The caller is
//! responsible for zero-initialising reserved fields, selecting the right
//! union member for the buffer type and memory kind, and keeping any
//! pointers stored inside (e.g. `m.planes`) alive for the duration of the
//! call.
//!
//! [`v4l2buf`]: https://docs.rs/v4l2buf

// Suppress expected warnings from bindgen-generated code.
// See https://github.com/rust-lang/rust-bindgen/issues/1651.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(missing_docs)]
#![allow(rustdoc::broken_intra_doc_links)]
#![allow(rustdoc::invalid_html_tags)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]

use core::ffi::{c_int, c_ulong};
use core::mem::size_of;

// Include bindgen-generated uAPI layouts
include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// Request code type accepted by `ioctl(2)`.
pub type IoctlRequest = c_ulong;

#[cfg(any(
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc",
    target_arch = "sparc64",
))]
compile_error!(
    "v4l2buf-sys encodes ioctl requests with the asm-generic _IOC layout, \
     which this architecture does not use"
);

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Magic number of the video device ioctls (`'V'`).
const VIDIOC_MAGIC: u32 = b'V' as u32;

/// Encodes a request code the way the generic `_IOC` macro does.
///
/// This is the `include/uapi/asm-generic/ioctl.h` layout used by x86, arm,
/// aarch64 and riscv. Building for an architecture with its own layout is a
/// compile error.
pub const fn ioc(dir: u32, ty: u32, nr: u32, size: usize) -> IoctlRequest {
    ((dir << IOC_DIRSHIFT)
        | (ty << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as IoctlRequest
}

const fn ior<T>(nr: u32) -> IoctlRequest {
    ioc(IOC_READ, VIDIOC_MAGIC, nr, size_of::<T>())
}

const fn iow<T>(nr: u32) -> IoctlRequest {
    ioc(IOC_WRITE, VIDIOC_MAGIC, nr, size_of::<T>())
}

const fn iowr<T>(nr: u32) -> IoctlRequest {
    ioc(IOC_READ | IOC_WRITE, VIDIOC_MAGIC, nr, size_of::<T>())
}

pub const VIDIOC_QUERYCAP: IoctlRequest = ior::<v4l2_capability>(0);
pub const VIDIOC_G_FMT: IoctlRequest = iowr::<v4l2_format>(4);
pub const VIDIOC_S_FMT: IoctlRequest = iowr::<v4l2_format>(5);
pub const VIDIOC_REQBUFS: IoctlRequest = iowr::<v4l2_requestbuffers>(8);
pub const VIDIOC_QUERYBUF: IoctlRequest = iowr::<v4l2_buffer>(9);
pub const VIDIOC_QBUF: IoctlRequest = iowr::<v4l2_buffer>(15);
pub const VIDIOC_EXPBUF: IoctlRequest = iowr::<v4l2_exportbuffer>(16);
pub const VIDIOC_DQBUF: IoctlRequest = iowr::<v4l2_buffer>(17);
pub const VIDIOC_STREAMON: IoctlRequest = iow::<c_int>(18);
pub const VIDIOC_STREAMOFF: IoctlRequest = iow::<c_int>(19);
pub const VIDIOC_G_PARM: IoctlRequest = iowr::<v4l2_streamparm>(21);
pub const VIDIOC_S_PARM: IoctlRequest = iowr::<v4l2_streamparm>(22);
