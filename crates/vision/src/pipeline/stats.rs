//! Snapshot of what the stream loop last observed, for status reporting.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub luma: f32,
    pub lux: u32,
    pub motion: f32,
    /// Exponentially smoothed production rate.
    pub fps: f32,
    pub frames_published: u64,
    pub encode_errors: u64,
    pub read_errors: u64,
    pub consecutive_read_failures: u32,
    pub open_failures: u64,
    /// No capture session is open; the loop is retrying on the slow cadence.
    pub degraded: bool,
}

/// Shared, lock-protected telemetry written only by the stream loop.
#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    inner: Mutex<TelemetrySnapshot>,
}

impl PipelineTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut TelemetrySnapshot)) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_visible_in_snapshots() {
        let telemetry = PipelineTelemetry::new();
        telemetry.update(|s| {
            s.frames_published += 2;
            s.degraded = true;
        });
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.frames_published, 2);
        assert!(snapshot.degraded);
        assert_eq!(snapshot.encode_errors, 0);
    }
}
