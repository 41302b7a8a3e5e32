//! JSON settings file with atomic saves.

use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::info;
use vision::PipelineSettings;

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "RCAM_CONFIG";
const SYSTEM_PATH: &str = "/opt/rpi-reversing-cam/config.json";
const USER_PATH: &str = ".config/rpi-reversing-cam/config.json";

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Locate the settings file: explicit path, then `$RCAM_CONFIG`, then the
    /// system and per-user locations.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        Self::new(pick_path(
            explicit,
            env::var_os(CONFIG_ENV),
            env::var_os("HOME"),
            Path::exists,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the stored settings. A missing file yields defaults.
    pub fn load(&self) -> Result<PipelineSettings> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no settings file; using defaults");
            return Ok(PipelineSettings::default());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("{} is not valid JSON", self.path.display()))?;
        PipelineSettings::from_json_value(value)
            .with_context(|| format!("invalid settings in {}", self.path.display()))
    }

    /// Write `settings` to a temporary sibling, then rename it into place.
    pub fn save(&self, settings: &PipelineSettings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut body = serde_json::to_vec_pretty(settings)?;
        body.push(b'\n');
        fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn pick_path(
    explicit: Option<PathBuf>,
    from_env: Option<OsString>,
    home: Option<OsString>,
    exists: impl Fn(&Path) -> bool,
) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(path) = from_env.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }

    let system = PathBuf::from(SYSTEM_PATH);
    let user = home
        .filter(|h| !h.is_empty())
        .map(|home| PathBuf::from(home).join(USER_PATH));
    let candidates: Vec<PathBuf> = std::iter::once(system.clone()).chain(user.clone()).collect();
    if let Some(found) = candidates.iter().find(|path| exists(path.as_path())) {
        return found.clone();
    }
    // Nothing stored yet: prefer the system location when it is provisioned.
    match (system.parent().is_some_and(&exists), user) {
        (true, _) | (false, None) => system,
        (false, Some(user)) => user,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn explicit_path_wins() {
        let path = pick_path(
            Some("/tmp/a.json".into()),
            Some("/tmp/b.json".into()),
            None,
            |_| true,
        );
        assert_eq!(path, PathBuf::from("/tmp/a.json"));
    }

    #[test]
    fn environment_beats_standard_locations() {
        let path = pick_path(None, Some("/tmp/b.json".into()), Some("/home/pi".into()), |_| true);
        assert_eq!(path, PathBuf::from("/tmp/b.json"));
    }

    #[test]
    fn existing_user_file_is_found() {
        let path = pick_path(None, None, Some("/home/pi".into()), |p| {
            p == Path::new("/home/pi/.config/rpi-reversing-cam/config.json")
        });
        assert_eq!(path, PathBuf::from("/home/pi/.config/rpi-reversing-cam/config.json"));
    }

    #[test]
    fn unprovisioned_host_falls_back_to_user_location() {
        let path = pick_path(None, Some("".into()), Some("/home/pi".into()), |_| false);
        assert_eq!(path, PathBuf::from("/home/pi/.config/rpi-reversing-cam/config.json"));
        assert_eq!(pick_path(None, None, None, |_| false), PathBuf::from(SYSTEM_PATH));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().unwrap(), PipelineSettings::default());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested/config.json"));
        let mut settings = PipelineSettings::default();
        settings.capture.width = 1280;
        settings.capture.height = 720;
        settings.overlay.text.enabled = true;

        store.save(&settings).unwrap();
        assert!(!dir.path().join("nested/config.json.tmp").exists());
        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, json!({ "capture": { "fps": 10 } }).to_string()).unwrap();
        let settings = SettingsStore::new(&path).load().unwrap();
        assert_eq!(settings.capture.fps, 10);
        assert_eq!(settings.capture.width, 640);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ \"capture\": { \"width\": 0 } }").unwrap();
        assert!(SettingsStore::new(&path).load().is_err());
        fs::write(&path, "not json").unwrap();
        assert!(SettingsStore::new(&path).load().is_err());
    }
}
