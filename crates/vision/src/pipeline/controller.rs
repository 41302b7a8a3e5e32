//! Reconfiguration controller.
//!
//! Owns the active capture parameters, the overlay configuration, the pending
//! capture change and the [`StreamState`], all behind one lock. Callers hand
//! over complete settings records through [`ReconfigController::apply_config`];
//! the controller decides whether the change can be applied in place or needs
//! the stream loop to rebuild its capture session.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Serialize;
use tracing::{debug, info, warn};
use video_ingest::CaptureParameters;

use crate::config::{ConfigError, OverlayConfig, PipelineSettings, SETTINGS_VERSION};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamState {
    Stopped,
    Running,
    Restarting,
}

/// What [`ReconfigController::apply_config`] did with a settings record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyOutcome {
    Unchanged,
    /// Overlay swapped; takes effect on the next composited frame.
    OverlayUpdated,
    /// Capture parameters differ; the stream loop will rebuild the session.
    RestartScheduled,
}

struct ControllerState {
    state: StreamState,
    applied: CaptureParameters,
    /// Newest unapplied capture change. A later request overwrites it.
    pending: Option<CaptureParameters>,
    overlay: Arc<OverlayConfig>,
    restarts: u64,
}

pub struct ReconfigController {
    inner: Mutex<ControllerState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl ReconfigController {
    pub fn new(settings: PipelineSettings) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            inner: Mutex::new(ControllerState {
                state: StreamState::Stopped,
                applied: settings.capture,
                pending: None,
                overlay: Arc::new(settings.overlay),
                restarts: 0,
            }),
            wake_tx,
            wake_rx,
        }
    }

    /// Validate and adopt `settings`.
    ///
    /// Overlay changes are visible to the very next frame. Capture changes are
    /// recorded as the pending configuration and picked up by the stream loop
    /// at the top of its next iteration.
    pub fn apply_config(&self, settings: PipelineSettings) -> Result<ApplyOutcome, ConfigError> {
        let settings = settings.validate()?;
        let mut inner = self.lock();

        let overlay_changed = *inner.overlay != settings.overlay;
        if overlay_changed {
            inner.overlay = Arc::new(settings.overlay);
        }

        let restart = if settings.capture == inner.applied {
            if inner.pending.take().is_some() {
                debug!("pending capture change cancelled by a newer request");
            }
            false
        } else {
            if let Some(previous) = inner.pending.replace(settings.capture) {
                if previous != settings.capture {
                    debug!("superseding unapplied capture change");
                }
            }
            true
        };
        drop(inner);

        let outcome = if restart {
            self.nudge();
            ApplyOutcome::RestartScheduled
        } else if overlay_changed {
            ApplyOutcome::OverlayUpdated
        } else {
            ApplyOutcome::Unchanged
        };
        info!(?outcome, "settings applied");
        Ok(outcome)
    }

    /// Effective settings, with any pending capture change already folded in.
    pub fn settings(&self) -> PipelineSettings {
        let inner = self.lock();
        PipelineSettings {
            version: SETTINGS_VERSION,
            capture: inner.pending.unwrap_or(inner.applied),
            overlay: (*inner.overlay).clone(),
        }
    }

    pub fn overlay(&self) -> Arc<OverlayConfig> {
        self.lock().overlay.clone()
    }

    /// Parameters of the current capture epoch.
    pub fn capture_params(&self) -> CaptureParameters {
        self.lock().applied
    }

    pub fn pending(&self) -> Option<CaptureParameters> {
        self.lock().pending
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Number of Running -> Restarting transitions so far.
    pub fn restart_count(&self) -> u64 {
        self.lock().restarts
    }

    /// Stopped -> Running. Any pending change becomes the starting epoch
    /// without counting as a restart. Returns the parameters to open with.
    pub(crate) fn mark_running(&self) -> Option<CaptureParameters> {
        let mut inner = self.lock();
        if !transition(&mut inner, StreamState::Stopped, StreamState::Running) {
            return None;
        }
        if let Some(pending) = inner.pending.take() {
            inner.applied = pending;
        }
        Some(inner.applied)
    }

    /// Running -> Restarting when a capture change is pending. The pending
    /// parameters become the applied ones and are returned.
    pub(crate) fn begin_restart(&self) -> Option<CaptureParameters> {
        let mut inner = self.lock();
        if inner.state != StreamState::Running {
            return None;
        }
        let params = inner.pending.take()?;
        transition(&mut inner, StreamState::Running, StreamState::Restarting);
        inner.applied = params;
        inner.restarts += 1;
        metrics::counter!("rearview_restarts_total").increment(1);
        Some(params)
    }

    /// Restarting -> Running, whether or not the reopen succeeded.
    pub(crate) fn finish_restart(&self) {
        let mut inner = self.lock();
        transition(&mut inner, StreamState::Restarting, StreamState::Running);
    }

    pub(crate) fn mark_stopped(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        if from != StreamState::Stopped {
            transition(&mut inner, from, StreamState::Stopped);
        }
    }

    /// Block for up to `timeout` or until a capture change or stop request
    /// arrives. Returns `true` when woken early.
    pub(crate) fn wait_for_change(&self, timeout: Duration) -> bool {
        self.wake_rx.recv_timeout(timeout).is_ok()
    }

    /// Wake a loop parked in [`Self::wait_for_change`].
    pub(crate) fn nudge(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transition(inner: &mut ControllerState, from: StreamState, to: StreamState) -> bool {
    if inner.state != from {
        warn!(current = ?inner.state, ?from, ?to, "ignoring invalid stream state transition");
        return false;
    }
    info!(?from, ?to, "stream state changed");
    inner.state = to;
    true
}

#[cfg(test)]
mod tests {
    use video_ingest::Rotation;

    use super::*;
    use crate::config::Anchor;

    fn running_controller() -> ReconfigController {
        let controller = ReconfigController::new(PipelineSettings::default());
        controller.mark_running();
        controller
    }

    fn with_width(width: u32) -> PipelineSettings {
        let mut settings = PipelineSettings::default();
        settings.capture.width = width;
        settings
    }

    #[test]
    fn identical_settings_are_unchanged() {
        let controller = running_controller();
        let outcome = controller.apply_config(PipelineSettings::default()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(controller.pending(), None);
    }

    #[test]
    fn overlay_change_applies_in_place() {
        let controller = running_controller();
        let mut settings = PipelineSettings::default();
        settings.overlay.text.enabled = true;
        settings.overlay.text.position = Anchor::Center;

        let outcome = controller.apply_config(settings).unwrap();
        assert_eq!(outcome, ApplyOutcome::OverlayUpdated);
        assert!(controller.overlay().text.enabled);
        assert_eq!(controller.pending(), None);
        assert_eq!(controller.begin_restart(), None);
        assert_eq!(controller.restart_count(), 0);
    }

    #[test]
    fn capture_change_schedules_exactly_one_restart() {
        let controller = running_controller();
        let outcome = controller.apply_config(with_width(320)).unwrap();
        assert_eq!(outcome, ApplyOutcome::RestartScheduled);

        let params = controller.begin_restart().unwrap();
        assert_eq!(params.width, 320);
        assert_eq!(controller.state(), StreamState::Restarting);
        assert_eq!(controller.capture_params().width, 320);
        controller.finish_restart();

        assert_eq!(controller.state(), StreamState::Running);
        assert_eq!(controller.begin_restart(), None);
        assert_eq!(controller.restart_count(), 1);
    }

    #[test]
    fn pending_change_is_last_writer_wins() {
        let controller = running_controller();
        controller.apply_config(with_width(320)).unwrap();
        controller.apply_config(with_width(800)).unwrap();
        let params = controller.begin_restart().unwrap();
        assert_eq!(params.width, 800);
        controller.finish_restart();
        assert_eq!(controller.restart_count(), 1);
    }

    #[test]
    fn request_mid_restart_waits_for_next_cycle() {
        let controller = running_controller();
        controller.apply_config(with_width(320)).unwrap();
        controller.begin_restart().unwrap();

        let mut rotated = with_width(320);
        rotated.capture.rotation = Rotation::Deg180;
        controller.apply_config(rotated).unwrap();
        // Still restarting: no second restart can begin.
        assert_eq!(controller.begin_restart(), None);
        controller.finish_restart();

        let next = controller.begin_restart().unwrap();
        assert_eq!(next.rotation, Rotation::Deg180);
        controller.finish_restart();
        assert_eq!(controller.restart_count(), 2);
    }

    #[test]
    fn reverting_before_restart_cancels_it() {
        let controller = running_controller();
        controller.apply_config(with_width(320)).unwrap();
        let outcome = controller.apply_config(PipelineSettings::default()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(controller.begin_restart(), None);
    }

    #[test]
    fn pending_change_before_start_is_folded_into_first_epoch() {
        let controller = ReconfigController::new(PipelineSettings::default());
        controller.apply_config(with_width(320)).unwrap();
        let params = controller.mark_running().unwrap();
        assert_eq!(params.width, 320);
        assert_eq!(controller.restart_count(), 0);
        assert_eq!(controller.begin_restart(), None);
    }

    #[test]
    fn invalid_settings_leave_state_untouched() {
        let controller = running_controller();
        assert!(controller.apply_config(with_width(0)).is_err());
        assert_eq!(controller.settings(), PipelineSettings::default());
    }

    #[test]
    fn settings_reports_pending_capture() {
        let controller = running_controller();
        controller.apply_config(with_width(320)).unwrap();
        assert_eq!(controller.settings().capture.width, 320);
        assert_eq!(controller.capture_params().width, 640);
    }

    #[test]
    fn capture_change_wakes_waiters() {
        let controller = running_controller();
        controller.apply_config(with_width(320)).unwrap();
        assert!(controller.wait_for_change(Duration::from_millis(10)));
        assert!(!controller.wait_for_change(Duration::from_millis(10)));
    }
}
