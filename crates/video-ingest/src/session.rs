//! Capture session lifecycle: bounded-retry open, frame reads, idempotent close.

use std::{thread, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    device::{CameraDevice, CameraSource},
    types::{CaptureError, CaptureParameters, Frame, Rotation},
};

/// Bounded retry policy applied when opening a device.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the first failed attempt; grows linearly per attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        self.base_delay.saturating_mul(failed_attempt.max(1))
    }
}

/// Owns one capture device for a single configuration epoch.
pub struct CaptureSession {
    device: Option<Box<dyn CameraDevice>>,
    params: CaptureParameters,
    uri: String,
}

impl CaptureSession {
    /// Open a device for `params`, retrying up to `policy.attempts` times.
    ///
    /// Every failed attempt releases whatever the device acquired before the
    /// next try.
    pub fn open(
        source: &dyn CameraSource,
        params: CaptureParameters,
        policy: &RetryPolicy,
    ) -> Result<Self, CaptureError> {
        let attempts = policy.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match try_open(source, &params) {
                Ok(device) => {
                    info!(
                        uri = source.uri(),
                        attempt,
                        width = params.width,
                        height = params.height,
                        fps = params.fps,
                        rotation = params.rotation.degrees(),
                        "capture session opened"
                    );
                    return Ok(Self {
                        device: Some(device),
                        params,
                        uri: source.uri().to_string(),
                    });
                }
                Err(err) => {
                    warn!(uri = source.uri(), attempt, "capture open failed: {err}");
                    last_error = err.to_string();
                    if attempt < attempts {
                        thread::sleep(policy.delay_for(attempt));
                    }
                }
            }
        }

        Err(CaptureError::Open {
            uri: source.uri().to_string(),
            attempts,
            reason: last_error,
        })
    }

    pub fn params(&self) -> &CaptureParameters {
        &self.params
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Read one frame, applying the configured rotation to the raw buffer.
    pub fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let device = self.device.as_mut().ok_or(CaptureError::Closed)?;
        let mut frame = device.read()?;
        frame.validate()?;
        if self.params.rotation == Rotation::Deg180 {
            frame.rotate_180();
        }
        Ok(frame)
    }

    /// Stop acquisition, then release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            release_quietly(device.as_mut());
            debug!(uri = %self.uri, "capture session closed");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn try_open(
    source: &dyn CameraSource,
    params: &CaptureParameters,
) -> Result<Box<dyn CameraDevice>, CaptureError> {
    let mut device = source.create()?;
    if let Err(err) = device.start(params) {
        release_quietly(device.as_mut());
        return Err(err);
    }
    Ok(device)
}

fn release_quietly(device: &mut dyn CameraDevice) {
    if let Err(err) = device.stop() {
        debug!("ignoring device stop failure: {err}");
    }
    if let Err(err) = device.release() {
        debug!("ignoring device release failure: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::synthetic::{SyntheticPattern, SyntheticSource};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn small_params() -> CaptureParameters {
        CaptureParameters {
            width: 8,
            height: 4,
            ..CaptureParameters::default()
        }
    }

    #[test]
    fn open_succeeds_after_transient_failures() {
        let source = SyntheticSource::new("flaky").with_open_failures(2);
        let session = CaptureSession::open(&source, small_params(), &fast_policy())
            .expect("third attempt should succeed");
        assert!(session.is_open());
        let stats = source.stats();
        assert_eq!(stats.start_attempts, 3);
        assert_eq!(stats.releases, 2);
    }

    #[test]
    fn open_reports_failure_after_exhausting_retries() {
        let source = SyntheticSource::new("dead").with_open_failures(3);
        let err = match CaptureSession::open(&source, small_params(), &fast_policy()) {
            Ok(_) => panic!("open should fail"),
            Err(err) => err,
        };
        assert!(!err.is_recoverable());
        match &err {
            CaptureError::Open { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(source.stats().releases, 3);
    }

    #[test]
    fn close_is_idempotent() {
        let source = SyntheticSource::new("cam");
        let mut session = CaptureSession::open(&source, small_params(), &fast_policy()).unwrap();
        session.close();
        session.close();
        drop(session);
        let stats = source.stats();
        assert_eq!(stats.stops, 1);
        assert_eq!(stats.releases, 1);
    }

    #[test]
    fn read_after_close_reports_closed() {
        let source = SyntheticSource::new("cam");
        let mut session = CaptureSession::open(&source, small_params(), &fast_policy()).unwrap();
        session.close();
        assert!(matches!(session.read_frame(), Err(CaptureError::Closed)));
    }

    #[test]
    fn read_applies_rotation() {
        let source = SyntheticSource::new("cam").with_pattern(SyntheticPattern::Gradient);
        let params = small_params();
        let mut upright = CaptureSession::open(&source, params, &fast_policy()).unwrap();
        let mut rotated = CaptureSession::open(
            &source,
            CaptureParameters {
                rotation: Rotation::Deg180,
                ..params
            },
            &fast_policy(),
        )
        .unwrap();

        let a = upright.read_frame().unwrap();
        let b = rotated.read_frame().unwrap();
        let bpp = 3;
        let pixels = a.data.len() / bpp;
        assert_eq!(&a.data[..bpp], &b.data[(pixels - 1) * bpp..]);
    }
}
