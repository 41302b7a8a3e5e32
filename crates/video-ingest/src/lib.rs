//! Capture sessions over pluggable camera devices.
//!
//! A [`CaptureSession`] owns one device for a configuration epoch: it opens
//! with bounded retries, hands out raw frames, and tears the device down
//! deterministically. Devices come from a [`CameraSource`]; the synthetic,
//! ffmpeg and (feature-gated) OpenCV backends live here.

#[cfg(feature = "opencv")]
mod camera;
mod device;
mod ffmpeg;
mod session;
mod synthetic;
mod types;

use std::sync::Arc;

#[cfg(feature = "opencv")]
pub use camera::OpenCvSource;
pub use device::{CameraDevice, CameraSource, parse_device_index};
pub use ffmpeg::FfmpegSource;
pub use session::{CaptureSession, RetryPolicy};
pub use synthetic::{SyntheticPattern, SyntheticSource, SyntheticStats};
pub use types::{
    CaptureError, CaptureParameters, Frame, FrameFormat, MAX_FPS, MIN_FPS, Rotation,
};

/// Pick a capture backend from a source URI.
///
/// `synthetic` or `synthetic:<label>` yields the simulated camera,
/// `opencv:<uri>` the OpenCV backend (when compiled in), and anything else is
/// handed to ffmpeg.
pub fn source_from_uri(uri: &str) -> Result<Arc<dyn CameraSource>, CaptureError> {
    if uri == "synthetic" {
        return Ok(Arc::new(SyntheticSource::new("default")));
    }
    if let Some(label) = uri.strip_prefix("synthetic:") {
        return Ok(Arc::new(SyntheticSource::new(label)));
    }
    if let Some(rest) = uri.strip_prefix("opencv:") {
        #[cfg(feature = "opencv")]
        {
            return Ok(Arc::new(OpenCvSource::new(rest)));
        }
        #[cfg(not(feature = "opencv"))]
        {
            return Err(CaptureError::Other(anyhow::anyhow!(
                "{rest}: built without the `opencv` feature"
            )));
        }
    }
    Ok(Arc::new(FfmpegSource::new(uri)))
}
