// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Build script for the `v4l2buf-sys` FFI crate.
//!
//! Generates Rust layouts for the V4L2 uAPI structures declared in
//! `<linux/videodev2.h>` using `bindgen`. Only `v4l2_*` types and `V4L2_*`
//! constants are emitted; the `VIDIOC_*` request codes are function-like
//! macros that bindgen cannot evaluate and are encoded by hand in `lib.rs`.

use std::env;
use std::path::PathBuf;

/// Header pulling in the kernel video device uAPI.
const WRAPPER_HEADER: &str = "wrapper.h";

/// Extra include directories, e.g. a cross sysroot's kernel headers.
///
/// Colon separated, read from `V4L2BUF_SYS_INCLUDE_DIRS`.
fn include_dirs() -> Vec<String> {
    println!("cargo:rerun-if-env-changed=V4L2BUF_SYS_INCLUDE_DIRS");
    env::var("V4L2BUF_SYS_INCLUDE_DIRS")
        .map(|dirs| {
            dirs.split(':')
                .filter(|dir| !dir.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Main build entry point.
fn main() {
    println!("cargo:rerun-if-changed={WRAPPER_HEADER}");

    let includes_dirs = include_dirs();
    for include_dir in &includes_dirs {
        println!("cargo:include={include_dir}");
    }

    let bindings = bindgen::builder()
        .clang_args(includes_dirs.iter().map(|dir| format!("-I{dir}")))
        .header(WRAPPER_HEADER)
        .allowlist_type("v4l2_.*")
        .allowlist_var("V4L2_.*")
        .derive_default(true)
        .derive_debug(true)
        .prepend_enum_name(false)
        .layout_tests(false)
        .generate()
        .expect("Unable to generate V4L2 bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("failed to get output directory"));
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Could not write bindings");
}
