// SPDX-FileCopyrightText: 2025 Contributors to the v4l2buf project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer types, memory kinds, pixel formats and one-shot format negotiation.
//!
//! Negotiation has no lifecycle: each call is a single request/verify round
//! trip. Once a pool exists on a device the format must be treated as
//! frozen until that pool is released.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{DeviceHandle, Error, Fraction, Result};

/// Kind of data stream a buffer queue carries.
///
/// This is the closed V4L2 set. Short names match the ones used by
/// `v4l2-ctl` (`vid-cap`, `vid-out`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferType {
    VideoCapture,
    VideoOverlay,
    VideoOutput,
    VbiCapture,
    VbiOutput,
    SlicedVbiCapture,
    SlicedVbiOutput,
    VideoOutputOverlay,
    VideoCaptureMplane,
    VideoOutputMplane,
    SdrCapture,
}

impl BufferType {
    /// Every buffer type, in kernel numbering order.
    pub const ALL: [BufferType; 11] = [
        BufferType::VideoCapture,
        BufferType::VideoOutput,
        BufferType::VideoOverlay,
        BufferType::VbiCapture,
        BufferType::VbiOutput,
        BufferType::SlicedVbiCapture,
        BufferType::SlicedVbiOutput,
        BufferType::VideoOutputOverlay,
        BufferType::VideoCaptureMplane,
        BufferType::VideoOutputMplane,
        BufferType::SdrCapture,
    ];

    /// Raw `enum v4l2_buf_type` value.
    pub fn as_raw(self) -> u32 {
        match self {
            BufferType::VideoCapture => v4l2buf_sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            BufferType::VideoOverlay => v4l2buf_sys::V4L2_BUF_TYPE_VIDEO_OVERLAY,
            BufferType::VideoOutput => v4l2buf_sys::V4L2_BUF_TYPE_VIDEO_OUTPUT,
            BufferType::VbiCapture => v4l2buf_sys::V4L2_BUF_TYPE_VBI_CAPTURE,
            BufferType::VbiOutput => v4l2buf_sys::V4L2_BUF_TYPE_VBI_OUTPUT,
            BufferType::SlicedVbiCapture => v4l2buf_sys::V4L2_BUF_TYPE_SLICED_VBI_CAPTURE,
            BufferType::SlicedVbiOutput => v4l2buf_sys::V4L2_BUF_TYPE_SLICED_VBI_OUTPUT,
            BufferType::VideoOutputOverlay => v4l2buf_sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_OVERLAY,
            BufferType::VideoCaptureMplane => v4l2buf_sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            BufferType::VideoOutputMplane => v4l2buf_sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            BufferType::SdrCapture => v4l2buf_sys::V4L2_BUF_TYPE_SDR_CAPTURE,
        }
    }

    /// Converts a raw kernel value, `None` for values outside the set.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_raw() == raw)
    }

    /// Short human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            BufferType::VideoCapture => "vid-cap",
            BufferType::VideoOverlay => "vid-overlay",
            BufferType::VideoOutput => "vid-out",
            BufferType::VbiCapture => "vbi-cap",
            BufferType::VbiOutput => "vbi-out",
            BufferType::SlicedVbiCapture => "sliced-vbi-cap",
            BufferType::SlicedVbiOutput => "sliced-vbi-out",
            BufferType::VideoOutputOverlay => "vid-out-overlay",
            BufferType::VideoCaptureMplane => "vid-cap-mplane",
            BufferType::VideoOutputMplane => "vid-out-mplane",
            BufferType::SdrCapture => "sdr-cap",
        }
    }

    /// Whether the application produces the data (driver consumes it).
    pub fn is_output(self) -> bool {
        matches!(
            self,
            BufferType::VideoOutput
                | BufferType::VbiOutput
                | BufferType::SlicedVbiOutput
                | BufferType::VideoOutputOverlay
                | BufferType::VideoOutputMplane
        )
    }

    /// Whether buffers of this type are described with a plane array.
    pub fn is_multiplanar(self) -> bool {
        matches!(
            self,
            BufferType::VideoCaptureMplane | BufferType::VideoOutputMplane
        )
    }

    /// Whether this is a video stream, i.e. one with pixel formats and
    /// time-per-frame streaming parameters.
    pub fn is_video(self) -> bool {
        matches!(
            self,
            BufferType::VideoCapture
                | BufferType::VideoOutput
                | BufferType::VideoCaptureMplane
                | BufferType::VideoOutputMplane
        )
    }
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How buffer memory is allocated and shared with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Mmap,
    UserPtr,
    Overlay,
    DmaBuf,
}

impl MemoryKind {
    const ALL: [MemoryKind; 4] = [
        MemoryKind::Mmap,
        MemoryKind::UserPtr,
        MemoryKind::Overlay,
        MemoryKind::DmaBuf,
    ];

    /// Raw `enum v4l2_memory` value.
    pub fn as_raw(self) -> u32 {
        match self {
            MemoryKind::Mmap => v4l2buf_sys::V4L2_MEMORY_MMAP,
            MemoryKind::UserPtr => v4l2buf_sys::V4L2_MEMORY_USERPTR,
            MemoryKind::Overlay => v4l2buf_sys::V4L2_MEMORY_OVERLAY,
            MemoryKind::DmaBuf => v4l2buf_sys::V4L2_MEMORY_DMABUF,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|memory| memory.as_raw() == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Mmap => "mmap",
            MemoryKind::UserPtr => "userptr",
            MemoryKind::Overlay => "overlay",
            MemoryKind::DmaBuf => "dmabuf",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Field order of the frames in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Field {
    #[default]
    Any,
    None,
    Top,
    Bottom,
    Interlaced,
    SeqTb,
    SeqBt,
    Alternate,
    InterlacedTb,
    InterlacedBt,
}

impl Field {
    const ALL: [Field; 10] = [
        Field::Any,
        Field::None,
        Field::Top,
        Field::Bottom,
        Field::Interlaced,
        Field::SeqTb,
        Field::SeqBt,
        Field::Alternate,
        Field::InterlacedTb,
        Field::InterlacedBt,
    ];

    /// Raw `enum v4l2_field` value.
    pub fn as_raw(self) -> u32 {
        match self {
            Field::Any => v4l2buf_sys::V4L2_FIELD_ANY,
            Field::None => v4l2buf_sys::V4L2_FIELD_NONE,
            Field::Top => v4l2buf_sys::V4L2_FIELD_TOP,
            Field::Bottom => v4l2buf_sys::V4L2_FIELD_BOTTOM,
            Field::Interlaced => v4l2buf_sys::V4L2_FIELD_INTERLACED,
            Field::SeqTb => v4l2buf_sys::V4L2_FIELD_SEQ_TB,
            Field::SeqBt => v4l2buf_sys::V4L2_FIELD_SEQ_BT,
            Field::Alternate => v4l2buf_sys::V4L2_FIELD_ALTERNATE,
            Field::InterlacedTb => v4l2buf_sys::V4L2_FIELD_INTERLACED_TB,
            Field::InterlacedBt => v4l2buf_sys::V4L2_FIELD_INTERLACED_BT,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_raw() == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Any => "any",
            Field::None => "none",
            Field::Top => "top",
            Field::Bottom => "bottom",
            Field::Interlaced => "interlaced",
            Field::SeqTb => "seq-tb",
            Field::SeqBt => "seq-bt",
            Field::Alternate => "alternate",
            Field::InterlacedTb => "interlaced-tb",
            Field::InterlacedBt => "interlaced-bt",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name of a raw enum value, or `"unknown"` when it is out of range.
///
/// Useful when printing values straight from the kernel.
pub fn raw_name<T: fmt::Display>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Four-character pixel format code.
///
/// Serialized as its four-character string, e.g. `"M420"`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Elvees macroblock 4:2:0.
    pub const M420: FourCc = FourCc(*b"M420");
    pub const H264: FourCc = FourCc(*b"H264");
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    pub const NV12: FourCc = FourCc(*b"NV12");
    pub const MJPG: FourCc = FourCc(*b"MJPG");

    /// Little-endian packing used by the kernel (`v4l2_fourcc`).
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_u32(raw: u32) -> Self {
        FourCc(raw.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl FromStr for FourCc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| Error::InvalidConfig(format!("FourCC \"{s}\" must be 4 bytes")))?;
        if !bytes.iter().all(|byte| byte.is_ascii_graphic() || *byte == b' ') {
            return Err(Error::InvalidConfig(format!(
                "FourCC \"{s}\" must be printable ASCII"
            )));
        }
        Ok(FourCc(bytes))
    }
}

impl TryFrom<String> for FourCc {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FourCc> for String {
    fn from(value: FourCc) -> Self {
        value.to_string()
    }
}

/// A single-plane image format as requested from or reported by a driver.
///
/// For multi-planar buffer types only the first plane is described.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub buffer_type: BufferType,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub field: Field,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl Format {
    /// Builds a request with field "any", letting the driver fill in the
    /// line stride and image size.
    pub fn new(buffer_type: BufferType, fourcc: FourCc, width: u32, height: u32) -> Self {
        Self {
            buffer_type,
            width,
            height,
            fourcc,
            field: Field::Any,
            bytes_per_line: 0,
            size_image: 0,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={}, width={}, height={}, pixelformat={}, field={}, bytesperline={}, sizeimage={}",
            self.buffer_type,
            self.width,
            self.height,
            self.fourcc,
            self.field,
            self.bytes_per_line,
            self.size_image
        )
    }
}

/// One-shot pixel format and frame rate configuration of a device.
///
/// # Examples
///
/// ```no_run
/// use v4l2buf::{BufferType, Capabilities, DeviceHandle, FormatNegotiator, FourCc};
///
/// # fn main() -> Result<(), v4l2buf::Error> {
/// let device = DeviceHandle::open(
///     "/dev/video0",
///     Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
///     Capabilities::empty(),
/// )?;
/// let negotiator = FormatNegotiator::new(&device);
/// let format = negotiator.configure(BufferType::VideoCapture, FourCc::YUYV, 640, 480)?;
/// negotiator.configure_framerate(BufferType::VideoCapture, 30)?;
/// println!("sizeimage = {}", format.size_image);
/// # Ok(())
/// # }
/// ```
pub struct FormatNegotiator<'a> {
    device: &'a DeviceHandle,
}

impl<'a> FormatNegotiator<'a> {
    pub fn new(device: &'a DeviceHandle) -> Self {
        Self { device }
    }

    /// Sets the pixel format and resolution and verifies the driver kept
    /// them unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a pool of `buffer_type` is allocated
    /// - [`Error::FormatRejected`] if the driver refuses the request
    /// - [`Error::FormatMismatch`] if the driver adjusted the size or pixel
    ///   format
    pub fn configure(
        &self,
        buffer_type: BufferType,
        fourcc: FourCc,
        width: u32,
        height: u32,
    ) -> Result<Format> {
        let context = self.device.context();
        context.ensure_reconfigurable(buffer_type)?;
        debug!(device = %context.label(), %buffer_type, "Setup format");

        let requested = Format::new(buffer_type, fourcc, width, height);
        let actual = context
            .driver
            .set_format(&requested)
            .map_err(|source| Error::FormatRejected {
                device: context.label(),
                buffer_type,
                source,
            })?;

        if actual.width != width || actual.height != height {
            return Err(Error::FormatMismatch {
                device: context.label(),
                buffer_type,
                requested: format!("{width}x{height}"),
                actual: format!("{}x{}", actual.width, actual.height),
            });
        }

        if actual.fourcc != fourcc {
            return Err(Error::FormatMismatch {
                device: context.label(),
                buffer_type,
                requested: fourcc.to_string(),
                actual: actual.fourcc.to_string(),
            });
        }

        debug!(
            "Configured: pixelformat = {}, width = {}, height = {}, sizeimage = {}",
            actual.fourcc, actual.width, actual.height, actual.size_image
        );
        trace!(format = %actual, "Negotiated format");

        Ok(actual)
    }

    /// Sets the frame rate to `framerate` frames per second.
    ///
    /// A `framerate` of zero leaves the device untouched. Devices that do not
    /// support time-per-frame adjustment are left as they are with a warning,
    /// as are non-video buffer types.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a pool of `buffer_type` is allocated
    /// - [`Error::ParameterQueryFailed`] if the parameters can not be read or
    ///   written
    /// - [`Error::FramerateMismatch`] if the driver picked a different rate
    pub fn configure_framerate(&self, buffer_type: BufferType, framerate: u32) -> Result<()> {
        let context = self.device.context();
        if framerate == 0 {
            return Ok(());
        }
        context.ensure_reconfigurable(buffer_type)?;

        debug!(device = %context.label(), %buffer_type, framerate, "Setup framerate");
        let to_error = |source| Error::ParameterQueryFailed {
            device: context.label(),
            buffer_type,
            source,
        };

        let parameters = context
            .driver
            .stream_parameters(buffer_type)
            .map_err(to_error)?;

        if !buffer_type.is_video() {
            warn!(
                "Device {} {} has no framerate parameters",
                context.label(),
                buffer_type
            );
            return Ok(());
        }

        if !parameters.time_per_frame_supported {
            warn!(
                "Device {} {} does not support framerate adjustment",
                context.label(),
                buffer_type
            );
            return Ok(());
        }

        let actual = context
            .driver
            .set_time_per_frame(buffer_type, Fraction::new(1, framerate))
            .map_err(to_error)?;

        if actual.denominator != framerate {
            return Err(Error::FramerateMismatch {
                device: context.label(),
                buffer_type,
                requested: framerate,
                actual,
            });
        }

        Ok(())
    }

    /// Returns the current frame rate, or `None` if it can not be read.
    pub fn framerate(&self, buffer_type: BufferType) -> Option<f64> {
        let context = self.device.context();
        match context.driver.stream_parameters(buffer_type) {
            Ok(parameters) => parameters.time_per_frame.as_rate(),
            Err(err) => {
                warn!(
                    "Can not get device {} {} streaming parameters: {}",
                    context.label(),
                    buffer_type,
                    err
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_type_names_follow_kernel_numbering() {
        for ty in BufferType::ALL {
            assert_eq!(BufferType::from_raw(ty.as_raw()), Some(ty));
        }
        assert_eq!(BufferType::VideoCapture.to_string(), "vid-cap");
        assert_eq!(BufferType::SdrCapture.name(), "sdr-cap");
        assert_eq!(raw_name(BufferType::from_raw(0xff)), "unknown");
    }

    #[test]
    fn output_and_multiplanar_classification() {
        assert!(BufferType::VideoOutputMplane.is_output());
        assert!(BufferType::VideoOutputMplane.is_multiplanar());
        assert!(!BufferType::VideoCapture.is_output());
        assert!(!BufferType::VbiCapture.is_video());
    }

    #[test]
    fn memory_and_field_names() {
        assert_eq!(MemoryKind::DmaBuf.to_string(), "dmabuf");
        assert_eq!(MemoryKind::from_raw(1), Some(MemoryKind::Mmap));
        assert_eq!(Field::from_raw(9), Some(Field::InterlacedBt));
        assert_eq!(Field::SeqTb.to_string(), "seq-tb");
        assert_eq!(raw_name(Field::from_raw(42)), "unknown");
    }

    #[test]
    fn fourcc_packs_little_endian() {
        assert_eq!(FourCc::YUYV.to_u32(), 0x5659_5559);
        assert_eq!(FourCc::from_u32(0x3436_3248), FourCc::H264);
        assert_eq!("M420".parse::<FourCc>().unwrap(), FourCc::M420);
        assert!("M42".parse::<FourCc>().is_err());
        assert_eq!(FourCc::from_u32(0x0000_0041).to_string(), "A...");
    }
}
