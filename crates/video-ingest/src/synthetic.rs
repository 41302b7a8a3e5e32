//! Simulated camera producing a moving test pattern.
//!
//! Faults can be injected at open and read time so that retry and recovery
//! paths can be exercised without hardware.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use chrono::Utc;

use crate::{
    device::{CameraDevice, CameraSource},
    types::{CaptureError, CaptureParameters, Frame, FrameFormat},
};

const BAR_WIDTH: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticPattern {
    /// Colour gradient with a white bar sweeping left to right.
    Gradient,
    /// Uniform colour, useful for brightness and overlay checks.
    Solid([u8; 3]),
}

/// Counters describing how the source's devices have been driven.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub created: u32,
    pub start_attempts: u32,
    pub stops: u32,
    pub releases: u32,
    pub frames: u64,
}

#[derive(Default)]
struct Faults {
    open_failures: AtomicU32,
    read_failures: AtomicU32,
    created: AtomicU32,
    start_attempts: AtomicU32,
    stops: AtomicU32,
    releases: AtomicU32,
    frames: AtomicU64,
}

/// Source handing out synthetic devices that share one fault schedule.
#[derive(Clone)]
pub struct SyntheticSource {
    uri: String,
    pattern: SyntheticPattern,
    faults: Arc<Faults>,
}

impl SyntheticSource {
    pub fn new(label: &str) -> Self {
        Self {
            uri: format!("synthetic:{label}"),
            pattern: SyntheticPattern::Gradient,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn with_pattern(mut self, pattern: SyntheticPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Make the next `count` device starts fail.
    pub fn with_open_failures(self, count: u32) -> Self {
        self.fail_next_opens(count);
        self
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.faults.open_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` frame reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.faults.read_failures.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SyntheticStats {
        SyntheticStats {
            created: self.faults.created.load(Ordering::SeqCst),
            start_attempts: self.faults.start_attempts.load(Ordering::SeqCst),
            stops: self.faults.stops.load(Ordering::SeqCst),
            releases: self.faults.releases.load(Ordering::SeqCst),
            frames: self.faults.frames.load(Ordering::SeqCst),
        }
    }
}

impl CameraSource for SyntheticSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create(&self) -> Result<Box<dyn CameraDevice>, CaptureError> {
        self.faults.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticCamera {
            pattern: self.pattern,
            faults: self.faults.clone(),
            params: None,
            frame_index: 0,
        }))
    }
}

struct SyntheticCamera {
    pattern: SyntheticPattern,
    faults: Arc<Faults>,
    params: Option<CaptureParameters>,
    frame_index: u32,
}

impl CameraDevice for SyntheticCamera {
    fn start(&mut self, params: &CaptureParameters) -> Result<(), CaptureError> {
        self.faults.start_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.faults.open_failures) {
            return Err(CaptureError::Other(anyhow::anyhow!(
                "simulated device busy"
            )));
        }
        self.params = Some(*params);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let params = self.params.ok_or(CaptureError::Closed)?;
        if take_one(&self.faults.read_failures) {
            return Err(CaptureError::Read("simulated read timeout".into()));
        }

        let data = match self.pattern {
            SyntheticPattern::Gradient => gradient(&params, self.frame_index),
            SyntheticPattern::Solid(rgb) => rgb.repeat(params.width as usize * params.height as usize),
        };
        self.frame_index = self.frame_index.wrapping_add(1);
        self.faults.frames.fetch_add(1, Ordering::SeqCst);

        Ok(Frame {
            data,
            width: params.width,
            height: params.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb8,
        })
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.faults.stops.fetch_add(1, Ordering::SeqCst);
        self.params = None;
        Ok(())
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        self.faults.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn gradient(params: &CaptureParameters, frame_index: u32) -> Vec<u8> {
    let (width, height) = (params.width.max(1), params.height.max(1));
    let bar_start = (frame_index.wrapping_mul(BAR_WIDTH)) % width;
    let blue = (frame_index.wrapping_mul(4) % 256) as u8;
    let mut data = Vec::with_capacity(params.frame_bytes());
    for y in 0..height {
        for x in 0..width {
            if x >= bar_start && x < bar_start + BAR_WIDTH {
                data.extend_from_slice(&[255, 255, 255]);
            } else {
                let r = (x * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                data.extend_from_slice(&[r, g, blue]);
            }
        }
    }
    data
}
