// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Common utilities shared across examples.

use tracing::level_filters::LevelFilter;

/// Initializes tracing subscriber for examples.
///
/// Configures logging to stderr with `default` as the level filter,
/// respecting the `RUST_LOG` environment variable for custom log levels.
pub fn setup_logging(default: LevelFilter) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .init();
}

/// Maps repeated `-v` flags onto a level, starting from INFO.
pub fn verbosity(count: u8) -> LevelFilter {
    match count {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
