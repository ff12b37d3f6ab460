// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Capture session configuration.
//!
//! A [`CaptureConfig`] describes one capture queue: which device to open,
//! the format to negotiate and the pool to build. It is plain data loaded
//! from JSON; every field is optional and falls back to the defaults below.
//!
//! ```json
//! {
//!     "device": "/dev/video0",
//!     "width": 1280,
//!     "height": 720,
//!     "fourcc": "M420",
//!     "framerate": 25,
//!     "buffer_count": 4,
//!     "exposure": "mapped"
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BufferType, Error, ExposureKind, FourCc, Result};

/// Number of buffers in a pool unless configured otherwise.
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Settings for one capture queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub device: PathBuf,
    pub buffer_type: BufferType,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    /// Frames per second; zero keeps the device's current rate.
    pub framerate: u32,
    pub buffer_count: u32,
    pub exposure: ExposureKind,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            buffer_type: BufferType::VideoCapture,
            width: 1280,
            height: 720,
            fourcc: FourCc::M420,
            framerate: 0,
            buffer_count: DEFAULT_BUFFER_COUNT,
            exposure: ExposureKind::Mapped,
        }
    }
}

impl CaptureConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigParse`] if the document is not valid JSON for this
    ///   structure
    /// - [`Error::InvalidConfig`] if a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Checks the values a driver could never accept.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "frame size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(Error::InvalidConfig(
                "buffer_count must be at least 1".to_string(),
            ));
        }
        if self.buffer_type.is_output() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a capture buffer type",
                self.buffer_type
            )));
        }
        if self.exposure == ExposureKind::Imported {
            return Err(Error::InvalidConfig(
                "capture queues own their memory; use \"mapped\" or \"exported\"".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses a `WIDTHxHEIGHT` frame size such as `1280x720`.
    pub fn parse_size(size: &str) -> Result<(u32, u32)> {
        let invalid = || Error::InvalidConfig(format!("frame size \"{size}\" is not WIDTHxHEIGHT"));
        let (width, height) = size.split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = width.trim().parse().map_err(|_| invalid())?;
        let height = height.trim().parse().map_err(|_| invalid())?;
        Ok((width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = CaptureConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CaptureConfig::default());
        assert_eq!(config.width, 1280);
        assert_eq!(config.height, 720);
        assert_eq!(config.fourcc, FourCc::M420);
        assert_eq!(config.buffer_count, 4);
        assert_eq!(config.exposure, ExposureKind::Mapped);
    }

    #[test]
    fn fields_are_read_from_json() {
        let config = CaptureConfig::from_json_str(
            r#"{
                "device": "/dev/video3",
                "buffer_type": "vid-cap-mplane",
                "width": 640,
                "height": 480,
                "fourcc": "YUYV",
                "framerate": 30,
                "buffer_count": 6,
                "exposure": "exported"
            }"#,
        )
        .unwrap();

        assert_eq!(config.device, PathBuf::from("/dev/video3"));
        assert_eq!(config.buffer_type, BufferType::VideoCaptureMplane);
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.fourcc, FourCc::YUYV);
        assert_eq!(config.framerate, 30);
        assert_eq!(config.buffer_count, 6);
        assert_eq!(config.exposure, ExposureKind::Exported);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"buffer_count": 0}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"width": 0}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"buffer_type": "vid-out"}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"exposure": "imported"}"#),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"fourcc": "TOOLONG"}"#),
            Err(Error::ConfigParse(_))
        ));
        assert!(matches!(
            CaptureConfig::from_json_str(r#"{"colour": "red"}"#),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn frame_sizes_parse() {
        assert_eq!(CaptureConfig::parse_size("640x480").unwrap(), (640, 480));
        assert_eq!(CaptureConfig::parse_size("1920X1080").unwrap(), (1920, 1080));
        assert!(CaptureConfig::parse_size("640").is_err());
        assert!(CaptureConfig::parse_size("ax480").is_err());
    }
}
