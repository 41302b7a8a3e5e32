//! Host telemetry for the status line: CPU temperature and load average.

use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use vision::StatusSource;

const REFRESH: Duration = Duration::from_secs(1);

pub struct HostStatus {
    thermal_path: PathBuf,
    loadavg_path: PathBuf,
    cache: Mutex<Option<(Instant, Option<String>)>>,
}

impl Default for HostStatus {
    fn default() -> Self {
        Self::with_paths(
            "/sys/class/thermal/thermal_zone0/temp",
            "/proc/loadavg",
        )
    }
}

impl HostStatus {
    pub fn with_paths(thermal: impl Into<PathBuf>, loadavg: impl Into<PathBuf>) -> Self {
        Self {
            thermal_path: thermal.into(),
            loadavg_path: loadavg.into(),
            cache: Mutex::new(None),
        }
    }

    /// CPU temperature in degrees Celsius; the kernel reports millidegrees.
    fn cpu_temp_c(&self) -> Option<f32> {
        let raw = fs::read_to_string(&self.thermal_path).ok()?;
        let millis: f32 = raw.trim().parse().ok()?;
        Some(millis / 1000.0)
    }

    /// One-minute load average.
    fn load_avg(&self) -> Option<f32> {
        let raw = fs::read_to_string(&self.loadavg_path).ok()?;
        raw.split_whitespace().next()?.parse().ok()
    }

    fn read(&self) -> Option<String> {
        let parts: Vec<String> = [
            self.cpu_temp_c().map(|t| format!("CPU {t:.1}°C")),
            self.load_avg().map(|l| format!("load {l:.2}")),
        ]
        .into_iter()
        .flatten()
        .collect();
        (!parts.is_empty()).then(|| parts.join(" | "))
    }
}

impl StatusSource for HostStatus {
    fn status_line(&self) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((taken, line)) = cache.as_ref() {
            if taken.elapsed() < REFRESH {
                return line.clone();
            }
        }
        let line = self.read();
        *cache = Some((Instant::now(), line.clone()));
        line
    }
}
