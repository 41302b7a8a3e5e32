//! Frame pipeline and hot-reconfiguration engine.
//!
//! The [`pipeline::StreamLoop`] owns the capture session and is the only
//! writer of the [`data::FramePublisher`]. Settings flow in through the
//! [`pipeline::controller::ReconfigController`]; encoded frames flow out
//! through any number of [`stream::mjpeg_stream`] sinks.

pub mod analysis;
pub mod annotation;
pub mod config;
pub mod data;
pub mod encoding;
pub mod font;
pub mod pipeline;
pub mod stream;

pub use config::{
    Anchor, ConfigError, GuideLine, NormalizedPoint, OverlayConfig, PipelineSettings,
    SETTINGS_VERSION, TextOverlay, merge_json,
};
pub use data::{FrameInfo, FramePacket, FramePublisher};
pub use encoding::EncodeError;
pub use pipeline::{
    Compositor, PipelineContext, PipelineTiming, StatusSource, StreamLoop,
    controller::{ApplyOutcome, ReconfigController, StreamState},
    stats::{PipelineTelemetry, TelemetrySnapshot},
    watchdog::{HealthComponent, PipelineHealth},
};
