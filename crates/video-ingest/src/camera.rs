//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    device::{CameraDevice, CameraSource, parse_device_index},
    types::{CaptureError, CaptureParameters, Frame, FrameFormat},
};

pub struct OpenCvSource {
    uri: String,
}

impl OpenCvSource {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }
}

impl CameraSource for OpenCvSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create(&self) -> Result<Box<dyn CameraDevice>, CaptureError> {
        Ok(Box::new(OpenCvCamera {
            uri: self.uri.clone(),
            cap: None,
            frame: Mat::default(),
            scratch: Mat::default(),
            size: (0, 0),
        }))
    }
}

struct OpenCvCamera {
    uri: String,
    cap: Option<VideoCapture>,
    frame: Mat,
    scratch: Mat,
    size: (i32, i32),
}

impl CameraDevice for OpenCvCamera {
    fn start(&mut self, params: &CaptureParameters) -> Result<(), CaptureError> {
        let mut cap = open_video_capture(&self.uri)?;
        let size = (params.width as i32, params.height as i32);
        configure_camera(&mut cap, size, params.fps as f64);
        self.cap = Some(cap);
        self.size = size;
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let cap = self.cap.as_mut().ok_or(CaptureError::Closed)?;
        let grabbed = cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || size.width <= 0 {
            return Err(CaptureError::Read("device returned an empty frame".into()));
        }

        let (target_w, target_h) = self.size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: target_w as u32,
            height: target_h as u32,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(cap) = self.cap.as_mut() {
            cap.release().map_err(|e| CaptureError::Other(e.into()))?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        self.cap = None;
        Ok(())
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
        attempts: 1,
        reason: "no backend could open the source".into(),
    })
}

/// Apply capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
