//! Settings records shared by the stream loop, the compositor, and the settings
//! store.
//!
//! Stored JSON is deep-merged over [`PipelineSettings::default`] before it is
//! deserialised, so a file only has to carry the keys it changes. Every record
//! rejects unknown keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use video_ingest::CaptureParameters;

/// Newest settings layout this build understands.
pub const SETTINGS_VERSION: u32 = 1;

pub const MAX_DIMENSION: u32 = 4096;
pub const MIN_FONT_SIZE: u32 = 6;
pub const MAX_FONT_SIZE: u32 = 128;
pub const MAX_LINE_WIDTH: u32 = 64;
/// Longest text-block content accepted, in characters.
pub const MAX_TEXT_CHARS: usize = 256;
const MAX_MARGIN: u32 = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be between 1 and {max}, got {value}")]
    Dimension {
        field: &'static str,
        value: u32,
        max: u32,
    },
    #[error("overlay text is {len} characters long; the limit is {max}")]
    TextTooLong { len: usize, max: usize },
    #[error("settings version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("malformed settings: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Versioned settings record: capture parameters plus overlay configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub version: u32,
    pub capture: CaptureParameters,
    pub overlay: OverlayConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            capture: CaptureParameters::default(),
            overlay: OverlayConfig::default(),
        }
    }
}

impl PipelineSettings {
    /// Build settings from a (possibly partial) JSON document layered over the
    /// defaults.
    pub fn from_json_value(value: Value) -> Result<Self, ConfigError> {
        Self::default().merged_with(value)
    }

    /// Apply a partial JSON update on top of `self`, then validate.
    pub fn merged_with(&self, patch: Value) -> Result<Self, ConfigError> {
        let mut base = serde_json::to_value(self)?;
        merge_json(&mut base, patch);
        let merged: PipelineSettings = serde_json::from_value(base)?;
        merged.validate()
    }

    /// Reject values that cannot be honoured and clamp the rest into range.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.version > SETTINGS_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: SETTINGS_VERSION,
            });
        }
        for (field, value) in [
            ("capture.width", self.capture.width),
            ("capture.height", self.capture.height),
        ] {
            if value == 0 || value > MAX_DIMENSION {
                return Err(ConfigError::Dimension {
                    field,
                    value,
                    max: MAX_DIMENSION,
                });
            }
        }
        let len = self.overlay.text.content.chars().count();
        if len > MAX_TEXT_CHARS {
            return Err(ConfigError::TextTooLong {
                len,
                max: MAX_TEXT_CHARS,
            });
        }

        Ok(Self {
            version: SETTINGS_VERSION,
            capture: self.capture.clamped(),
            overlay: self.overlay.clamped(),
        })
    }
}

/// Everything drawn on top of the captured image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    pub enabled: bool,
    /// Draw the host/brightness status line at the bottom-left corner.
    pub show_status: bool,
    pub text: TextOverlay,
    pub lines: Vec<GuideLine>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            show_status: true,
            text: TextOverlay::default(),
            lines: vec![
                GuideLine {
                    enabled: true,
                    start: NormalizedPoint::new(0.15, 0.75),
                    end: NormalizedPoint::new(0.85, 0.75),
                    width_px: 4,
                    color: "#00FF00".into(),
                    alpha: 0.7,
                },
                GuideLine {
                    enabled: true,
                    start: NormalizedPoint::new(0.25, 0.9),
                    end: NormalizedPoint::new(0.75, 0.9),
                    width_px: 4,
                    color: "#FF0000".into(),
                    alpha: 0.7,
                },
            ],
        }
    }
}

impl OverlayConfig {
    fn clamped(self) -> Self {
        Self {
            text: TextOverlay {
                font_size: self.text.font_size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE),
                margin: self.text.margin.min(MAX_MARGIN),
                ..self.text
            },
            lines: self
                .lines
                .into_iter()
                .map(|line| GuideLine {
                    width_px: line.width_px.clamp(1, MAX_LINE_WIDTH),
                    alpha: clamp_unit(line.alpha),
                    ..line
                })
                .collect(),
            ..self
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TextOverlay {
    pub enabled: bool,
    pub content: String,
    pub position: Anchor,
    pub font_size: u32,
    pub margin: u32,
}

impl Default for TextOverlay {
    fn default() -> Self {
        Self {
            enabled: false,
            content: "RPi Cam".into(),
            position: Anchor::TopLeft,
            font_size: 20,
            margin: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    #[default]
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuideLine {
    pub enabled: bool,
    pub start: NormalizedPoint,
    pub end: NormalizedPoint,
    pub width_px: u32,
    /// `#RRGGBB` or `#RGB`; anything else renders green.
    pub color: String,
    pub alpha: f32,
}

impl Default for GuideLine {
    fn default() -> Self {
        Self {
            enabled: true,
            start: NormalizedPoint::new(0.1, 0.7),
            end: NormalizedPoint::new(0.9, 0.7),
            width_px: 4,
            color: "#00FF00".into(),
            alpha: 1.0,
        }
    }
}

/// Point expressed as fractions of the frame width and height.
///
/// Components are clamped to `[0, 1]` on construction and deserialisation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct NormalizedPoint {
    x: f32,
    y: f32,
}

impl NormalizedPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: clamp_unit(x),
            y: clamp_unit(y),
        }
    }

    pub fn x(self) -> f32 {
        self.x
    }

    pub fn y(self) -> f32 {
        self.y
    }
}

impl From<[f32; 2]> for NormalizedPoint {
    fn from([x, y]: [f32; 2]) -> Self {
        Self::new(x, y)
    }
}

impl From<NormalizedPoint> for [f32; 2] {
    fn from(point: NormalizedPoint) -> Self {
        [point.x, point.y]
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Recursively merge `patch` into `base`. Objects merge key by key; any other
/// value, arrays included, replaces what was there.
pub fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
