//! Heartbeat tracking for the capture and publish stages.
//!
//! The stream loop beats after every successful read and every published
//! frame. A stage that has not beaten recently is reported by
//! [`PipelineHealth::stale_component`], which backs the health endpoint.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

/// Time without a heartbeat before a component is considered stalled.
pub const STALE_THRESHOLD_MS: u64 = 3_000;
/// Grace period at startup allowing the device to come up before monitoring.
pub const STARTUP_GRACE_MS: u64 = 5_000;

/// Logical components monitored for liveness.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthComponent {
    Capture,
    Publish,
}

impl HealthComponent {
    /// Human readable label used in log messages and responses.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Publish => "publish",
        }
    }
}

#[derive(Debug)]
pub struct PipelineHealth {
    capture: AtomicU64,
    publish: AtomicU64,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    /// Start tracking with the startup grace period applied to every component.
    pub fn new() -> Self {
        Self::starting_at(current_millis())
    }

    pub fn starting_at(now_ms: u64) -> Self {
        let grace_deadline = now_ms.saturating_add(STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            publish: AtomicU64::new(grace_deadline),
        }
    }

    /// Register a heartbeat for the supplied component.
    pub fn beat(&self, component: HealthComponent) {
        self.beat_at(component, current_millis());
    }

    pub fn beat_at(&self, component: HealthComponent, now_ms: u64) {
        match component {
            HealthComponent::Capture => self.capture.store(now_ms, Ordering::Relaxed),
            HealthComponent::Publish => self.publish.store(now_ms, Ordering::Relaxed),
        }
    }

    /// Returns the first component that has not produced a heartbeat recently.
    pub fn stale_component(&self, now_ms: u64) -> Option<HealthComponent> {
        [
            (HealthComponent::Capture, &self.capture),
            (HealthComponent::Publish, &self.publish),
        ]
        .into_iter()
        .find(|(_, last)| now_ms.saturating_sub(last.load(Ordering::Relaxed)) > STALE_THRESHOLD_MS)
        .map(|(component, _)| component)
    }

    pub fn check_now(&self) -> Option<HealthComponent> {
        self.stale_component(current_millis())
    }
}

pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
