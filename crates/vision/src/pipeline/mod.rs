//! Stream loop: the single producer that owns the capture session.
//!
//! Each iteration checks for a pending capture change, reads one raw frame,
//! composites the current overlay, encodes and publishes the result, then
//! sleeps out the rest of the frame interval. Capture faults never end the
//! loop; it drops into a degraded state and keeps reopening the device on a
//! slower cadence.

pub mod controller;
pub mod stats;
pub mod telemetry;
pub mod watchdog;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use image::RgbImage;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CameraSource, CaptureParameters, CaptureSession, RetryPolicy};

use crate::{
    analysis::{self, MotionDetector},
    annotation,
    config::OverlayConfig,
    data::{FramePacket, FramePublisher},
    encoding::encode_jpeg,
};
use controller::ReconfigController;
use stats::PipelineTelemetry;
use watchdog::{HealthComponent, PipelineHealth};

const HEARTBEAT_EVERY: u64 = 30;
const FPS_SMOOTHING: f32 = 0.9;

/// Timing policy of the stream loop.
#[derive(Clone, Copy, Debug)]
pub struct PipelineTiming {
    /// Bounded retry used for every open attempt.
    pub retry: RetryPolicy,
    /// Delay between reopen attempts once retries are exhausted.
    pub degraded_retry: Duration,
    /// Pause after a failed read.
    pub read_failure_pause: Duration,
    /// Consecutive read failures that force the session closed.
    pub max_consecutive_read_failures: u32,
    /// Wait between closing a device and reopening it.
    pub release_settle: Duration,
    /// Upper bound on how long `stop` waits for the producer thread.
    pub join_timeout: Duration,
}

impl Default for PipelineTiming {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            degraded_retry: Duration::from_secs(2),
            read_failure_pause: Duration::from_millis(50),
            max_consecutive_read_failures: 10,
            release_settle: Duration::from_millis(200),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Host telemetry shown in the status line (CPU temperature, load, ...).
pub trait StatusSource: Send + Sync {
    fn status_line(&self) -> Option<String>;
}

/// Draws the overlay onto a frame; [`annotation::composite`] unless replaced.
pub type Compositor = fn(RgbImage, &OverlayConfig, Option<&str>) -> RgbImage;

/// Everything the stream loop needs, wired by the caller.
pub struct PipelineContext {
    pub source: Arc<dyn CameraSource>,
    pub controller: Arc<ReconfigController>,
    pub publisher: Arc<FramePublisher>,
    pub telemetry: Arc<PipelineTelemetry>,
    pub health: Arc<PipelineHealth>,
    pub status: Option<Arc<dyn StatusSource>>,
    pub compositor: Compositor,
    pub timing: PipelineTiming,
}

impl PipelineContext {
    pub fn new(
        source: Arc<dyn CameraSource>,
        controller: Arc<ReconfigController>,
        publisher: Arc<FramePublisher>,
    ) -> Self {
        Self {
            source,
            controller,
            publisher,
            telemetry: Arc::new(PipelineTelemetry::new()),
            health: Arc::new(PipelineHealth::new()),
            status: None,
            compositor: annotation::composite,
            timing: PipelineTiming::default(),
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSource>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_compositor(mut self, compositor: Compositor) -> Self {
        self.compositor = compositor;
        self
    }

    pub fn with_timing(mut self, timing: PipelineTiming) -> Self {
        self.timing = timing;
        self
    }
}

/// Handle to the running producer thread.
pub struct StreamLoop {
    shutdown: Arc<AtomicBool>,
    controller: Arc<ReconfigController>,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
    join_timeout: Duration,
}

impl StreamLoop {
    /// Spawn the producer. The capture session is opened on the new thread.
    pub fn start(ctx: PipelineContext) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (exit_tx, exited) = bounded::<()>(0);
        let controller = ctx.controller.clone();
        let join_timeout = ctx.timing.join_timeout;
        let producer = Producer::new(ctx, shutdown.clone(), exit_tx);
        let handle = telemetry::spawn_thread("stream-loop", move || producer.run())?;
        Ok(Self {
            shutdown,
            controller,
            handle: Some(handle),
            exited,
            join_timeout,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Signal the producer to exit and join it, waiting at most the configured
    /// join timeout. Returns `false` if the thread had to be left behind.
    pub fn stop(mut self) -> bool {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        self.controller.nudge();
        match self.exited.recv_timeout(self.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "stream loop did not exit within {:?}; detaching",
                    self.join_timeout
                );
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("stream loop panicked during shutdown");
                }
                true
            }
        }
    }
}

impl Drop for StreamLoop {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

enum Step {
    Published,
    Dropped,
    ReadFailed,
}

struct Producer {
    ctx: PipelineContext,
    shutdown: Arc<AtomicBool>,
    session: Option<CaptureSession>,
    motion: MotionDetector,
    /// Sequence of the last packet handed to the publisher.
    sequence: u64,
    /// Frames this producer has published.
    published: u64,
    read_failures: u32,
    smoothed_fps: f32,
    last_publish: Option<Instant>,
    // Dropped when the thread exits, which disconnects the receiver in `StreamLoop`.
    _exit: Sender<()>,
}

impl Producer {
    fn new(ctx: PipelineContext, shutdown: Arc<AtomicBool>, exit: Sender<()>) -> Self {
        // Continue numbering after whatever an earlier loop left in the slot.
        let sequence = ctx.publisher.latest().map_or(0, |packet| packet.sequence);
        Self {
            ctx,
            shutdown,
            session: None,
            motion: MotionDetector::new(),
            sequence,
            published: 0,
            read_failures: 0,
            smoothed_fps: 0.0,
            last_publish: None,
            _exit: exit,
        }
    }

    fn run(mut self) {
        let span = info_span!("vision.pipeline", source = self.ctx.source.uri());
        let _guard = span.enter();

        let Some(params) = self.ctx.controller.mark_running() else {
            error!("stream loop started while not stopped; exiting");
            return;
        };
        info!("stream loop started");
        self.open_session(params);

        let mut next_deadline = Instant::now();
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Some(params) = self.ctx.controller.begin_restart() {
                self.restart(params);
                next_deadline = Instant::now();
                continue;
            }

            if self.session.is_none() {
                // Woken early by a capture change or a stop request: re-check both first.
                if self.ctx.controller.wait_for_change(self.ctx.timing.degraded_retry)
                    || self.shutdown.load(Ordering::SeqCst)
                {
                    continue;
                }
                let params = self.ctx.controller.capture_params();
                self.open_session(params);
                next_deadline = Instant::now();
                continue;
            }

            let interval = frame_interval(self.ctx.controller.capture_params().fps);
            match self.step() {
                Step::ReadFailed => {
                    thread::sleep(self.ctx.timing.read_failure_pause);
                    next_deadline = Instant::now();
                }
                Step::Published | Step::Dropped => {
                    next_deadline += interval;
                    let now = Instant::now();
                    if next_deadline > now {
                        thread::sleep(next_deadline - now);
                    } else {
                        // Overran the interval: do not try to catch up.
                        next_deadline = now;
                    }
                }
            }
        }

        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.ctx.controller.mark_stopped();
        info!(frames = self.published, "stream loop stopped");
    }

    fn restart(&mut self, params: CaptureParameters) {
        let span = info_span!(
            "pipeline.restart",
            width = params.width,
            height = params.height,
            fps = params.fps,
            rotation = params.rotation.degrees()
        );
        let _guard = span.enter();
        info!("capture parameters changed; rebuilding capture session");

        if let Some(mut session) = self.session.take() {
            session.close();
            thread::sleep(self.ctx.timing.release_settle);
        }
        self.open_session(params);
        self.ctx.controller.finish_restart();
    }

    fn open_session(&mut self, params: CaptureParameters) {
        match CaptureSession::open(self.ctx.source.as_ref(), params, &self.ctx.timing.retry) {
            Ok(session) => {
                self.session = Some(session);
                self.read_failures = 0;
                self.motion.reset();
                self.last_publish = None;
                self.ctx.telemetry.update(|s| {
                    s.degraded = false;
                    s.consecutive_read_failures = 0;
                });
            }
            Err(err) => {
                error!(
                    "capture unavailable, retrying every {:?}: {err}",
                    self.ctx.timing.degraded_retry
                );
                metrics::counter!("rearview_open_failures_total").increment(1);
                self.ctx.telemetry.update(|s| {
                    s.degraded = true;
                    s.open_failures += 1;
                });
            }
        }
    }

    fn step(&mut self) -> Step {
        let Some(session) = self.session.as_mut() else {
            return Step::ReadFailed;
        };

        let capture_start = Instant::now();
        let read = session.read_frame();
        let params = *session.params();
        let frame = match read {
            Ok(frame) => frame,
            Err(err) => {
                self.read_failures += 1;
                metrics::counter!("rearview_read_errors_total").increment(1);
                warn!(failures = self.read_failures, "frame read failed: {err}");
                let give_up = !err.is_recoverable()
                    || self.read_failures >= self.ctx.timing.max_consecutive_read_failures;
                if give_up {
                    warn!(
                        "closing capture session after {} consecutive read failure(s)",
                        self.read_failures
                    );
                    if let Some(mut session) = self.session.take() {
                        session.close();
                    }
                }
                let failures = self.read_failures;
                self.ctx.telemetry.update(|s| {
                    s.read_errors += 1;
                    s.consecutive_read_failures = failures;
                    s.degraded = give_up;
                });
                return Step::ReadFailed;
            }
        };
        self.read_failures = 0;
        self.ctx.health.beat(HealthComponent::Capture);
        let timestamp_ms = frame.timestamp_ms;
        let image = match annotation::frame_to_rgb(frame) {
            Ok(image) => image,
            Err(err) => {
                warn!("discarding malformed frame: {err}");
                return Step::Dropped;
            }
        };
        metrics::histogram!("rearview_stage_latency_seconds", "stage" => "capture")
            .record(capture_start.elapsed().as_secs_f64());

        let overlay = self.ctx.controller.overlay();
        let luma = analysis::mean_luma(&image);
        let lux = analysis::approx_lux(luma);
        let motion = self.motion.update(&image);
        let status = (overlay.enabled && overlay.show_status).then(|| self.status_line(lux));

        let composite_start = Instant::now();
        let annotated = composite_or_passthrough(self.ctx.compositor, image, &overlay, status.as_deref());
        metrics::histogram!("rearview_stage_latency_seconds", "stage" => "composite")
            .record(composite_start.elapsed().as_secs_f64());

        let encode_start = Instant::now();
        let jpeg = match encode_jpeg(&annotated, params.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                warn!("dropping frame: {err}");
                metrics::counter!("rearview_encode_errors_total").increment(1);
                self.ctx.telemetry.update(|s| s.encode_errors += 1);
                return Step::Dropped;
            }
        };
        metrics::histogram!("rearview_stage_latency_seconds", "stage" => "encode")
            .record(encode_start.elapsed().as_secs_f64());

        let sequence = self.sequence + 1;
        let accepted = self.ctx.publisher.publish(FramePacket {
            jpeg,
            sequence,
            timestamp_ms: if timestamp_ms > 0 {
                timestamp_ms
            } else {
                Utc::now().timestamp_millis()
            },
            width: annotated.width(),
            height: annotated.height(),
            target_fps: params.fps,
        });
        if !accepted {
            // Another writer moved the slot ahead; resume numbering after it.
            let current = self.ctx.publisher.latest().map_or(0, |packet| packet.sequence);
            warn!(sequence, current, "publisher rejected stale frame");
            self.sequence = current;
            return Step::Dropped;
        }
        self.sequence = sequence;
        self.published += 1;
        self.ctx.health.beat(HealthComponent::Publish);
        self.record_publish(luma, lux, motion);
        Step::Published
    }

    fn record_publish(&mut self, luma: f32, lux: u32, motion: f32) {
        let now = Instant::now();
        if let Some(previous) = self.last_publish.replace(now) {
            let elapsed = now.duration_since(previous).as_secs_f32();
            if elapsed > 0.0 {
                let instant_fps = 1.0 / elapsed;
                self.smoothed_fps = if self.smoothed_fps == 0.0 {
                    instant_fps
                } else {
                    FPS_SMOOTHING * self.smoothed_fps + (1.0 - FPS_SMOOTHING) * instant_fps
                };
            }
        }

        metrics::counter!("rearview_frames_published_total").increment(1);
        metrics::gauge!("rearview_pipeline_fps").set(self.smoothed_fps as f64);
        metrics::gauge!("rearview_brightness_luma").set(luma as f64);
        metrics::gauge!("rearview_motion_score").set(motion as f64);

        let (published, fps) = (self.published, self.smoothed_fps);
        self.ctx.telemetry.update(|s| {
            s.luma = luma;
            s.lux = lux;
            s.motion = motion;
            s.fps = fps;
            s.frames_published += 1;
            s.consecutive_read_failures = 0;
            s.degraded = false;
        });

        if published % HEARTBEAT_EVERY == 0 {
            debug!(frame = published, fps, lux, motion, "stream loop heartbeat");
        }
    }

    fn status_line(&self, lux: u32) -> String {
        let brightness = format!("~{lux} lux");
        match self.ctx.status.as_ref().and_then(|source| source.status_line()) {
            Some(host) if !host.is_empty() => format!("{host} | {brightness}"),
            _ => brightness,
        }
    }
}

/// Composite, falling back to the bare frame if drawing panics.
fn composite_or_passthrough(
    draw: Compositor,
    image: RgbImage,
    overlay: &OverlayConfig,
    status: Option<&str>,
) -> RgbImage {
    if !overlay.enabled {
        return image;
    }
    let fallback = image.clone();
    match panic::catch_unwind(AssertUnwindSafe(|| draw(image, overlay, status))) {
        Ok(annotated) => annotated,
        Err(_) => {
            error!("overlay rendering panicked; publishing unannotated frame");
            fallback
        }
    }
}

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_interval_matches_rate() {
        assert_eq!(frame_interval(20), Duration::from_millis(50));
        assert_eq!(frame_interval(0), Duration::from_secs(1));
    }

    fn broken_draw(_: RgbImage, _: &OverlayConfig, _: Option<&str>) -> RgbImage {
        panic!("glyph table corrupted");
    }

    #[test]
    fn panicking_draw_falls_back_to_the_bare_frame() {
        let image = RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]));
        let overlay = OverlayConfig::default();
        let out = composite_or_passthrough(broken_draw, image.clone(), &overlay, Some("x"));
        assert_eq!(out, image);
    }

    #[test]
    fn disabled_overlay_skips_drawing() {
        let image = RgbImage::new(4, 4);
        let overlay = OverlayConfig {
            enabled: false,
            ..OverlayConfig::default()
        };
        assert_eq!(composite_or_passthrough(broken_draw, image.clone(), &overlay, None), image);
    }

    #[test]
    fn default_timing_matches_documented_constants() {
        let timing = PipelineTiming::default();
        assert_eq!(timing.retry.attempts, 3);
        assert_eq!(timing.retry.base_delay, Duration::from_millis(250));
        assert_eq!(timing.degraded_retry, Duration::from_secs(2));
        assert_eq!(timing.max_consecutive_read_failures, 10);
        assert_eq!(timing.release_settle, Duration::from_millis(200));
    }
}
