//! Device seams shared by every capture backend.

use crate::types::{CaptureError, CaptureParameters, Frame};

/// A single acquired capture device.
///
/// Devices are created fresh for every open attempt and torn down in two
/// steps: `stop` halts acquisition, `release` gives the handle back.
pub trait CameraDevice: Send {
    /// Configure the device for `params` and begin acquisition.
    fn start(&mut self, params: &CaptureParameters) -> Result<(), CaptureError>;
    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Frame, CaptureError>;
    fn stop(&mut self) -> Result<(), CaptureError>;
    fn release(&mut self) -> Result<(), CaptureError>;
}

/// Factory producing devices for one configured source.
pub trait CameraSource: Send + Sync {
    /// Human readable identifier used in logs and errors.
    fn uri(&self) -> &str;
    fn create(&self) -> Result<Box<dyn CameraDevice>, CaptureError>;
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::parse_device_index;

    #[test]
    fn device_index_from_path_or_number() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }
}
