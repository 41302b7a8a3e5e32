use std::fmt;

use anyhow::Error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest frame rate a capture device is asked for.
pub const MIN_FPS: u32 = 1;
/// Highest frame rate a capture device is asked for.
pub const MAX_FPS: u32 = 30;

/// Raw frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Rgb8,
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgb8 | FrameFormat::Bgr8 => 3,
        }
    }
}

impl Frame {
    /// Buffer length implied by the frame dimensions and pixel format.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let expected = self.expected_len();
        if self.width == 0 || self.height == 0 || self.data.len() != expected {
            return Err(CaptureError::InvalidFrame {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Rotate the packed pixel buffer by 180 degrees in place.
    pub fn rotate_180(&mut self) {
        let bpp = self.format.bytes_per_pixel();
        let pixels = self.data.len() / bpp;
        for index in 0..pixels / 2 {
            let mirror = pixels - 1 - index;
            for channel in 0..bpp {
                self.data.swap(index * bpp + channel, mirror * bpp + channel);
            }
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Geometric rotation applied to raw buffers after capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg180,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg180 => 180,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value % 360 {
            0 => Ok(Rotation::Deg0),
            180 => Ok(Rotation::Deg180),
            other => Err(format!("unsupported rotation {other}; expected 0 or 180")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Device-affecting capture parameters.
///
/// Two parameter sets are equivalent iff every field matches; any difference
/// requires the capture session to be rebuilt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureParameters {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub rotation: Rotation,
    pub jpeg_quality: u8,
}

impl Default for CaptureParameters {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 20,
            rotation: Rotation::Deg0,
            jpeg_quality: 85,
        }
    }
}

impl CaptureParameters {
    /// Clamp frame rate and encode quality into their supported ranges.
    pub fn clamped(self) -> Self {
        Self {
            fps: self.fps.clamp(MIN_FPS, MAX_FPS),
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
            ..self
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?} after {attempts} attempt(s): {reason}")]
    Open {
        uri: String,
        attempts: u32,
        reason: String,
    },
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("capture session is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Transient faults are retried by the caller; the rest force a reopen.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CaptureError::Read(_) | CaptureError::InvalidFrame { .. } | CaptureError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            data,
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Rgb8,
        }
    }

    #[test]
    fn rotate_180_reverses_pixel_order() {
        let mut f = frame(vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4], 2, 2);
        f.rotate_180();
        assert_eq!(f.data, vec![4, 4, 4, 3, 3, 3, 2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn rotate_180_twice_is_identity() {
        let original: Vec<u8> = (0..27).collect();
        let mut f = frame(original.clone(), 3, 3);
        f.rotate_180();
        f.rotate_180();
        assert_eq!(f.data, original);
    }

    #[test]
    fn validate_rejects_short_buffers() {
        let f = frame(vec![0; 10], 2, 2);
        match f.validate() {
            Err(CaptureError::InvalidFrame { expected, actual }) => {
                assert_eq!(expected, 12);
                assert_eq!(actual, 10);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rotation_parses_degrees() {
        assert_eq!(Rotation::try_from(180).unwrap(), Rotation::Deg180);
        assert_eq!(Rotation::try_from(360).unwrap(), Rotation::Deg0);
        assert!(Rotation::try_from(90).is_err());
    }

    #[test]
    fn parameters_clamp_rate_and_quality() {
        let params = CaptureParameters {
            fps: 120,
            jpeg_quality: 0,
            ..CaptureParameters::default()
        }
        .clamped();
        assert_eq!(params.fps, MAX_FPS);
        assert_eq!(params.jpeg_quality, 1);
    }

    #[test]
    fn parameters_roundtrip_rotation_as_integer() {
        let params = CaptureParameters {
            rotation: Rotation::Deg180,
            ..CaptureParameters::default()
        };
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["rotation"], 180);
        let back: CaptureParameters = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }
}
