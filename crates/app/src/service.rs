//! Wires capture, the stream loop and the HTTP surface together and waits for
//! a shutdown signal.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use vision::{
    FramePublisher, PipelineContext, ReconfigController, StreamLoop,
    pipeline::telemetry::{init_metrics_recorder, init_tracing},
    stream::SinkOptions,
};

use crate::{
    cli::ServeConfig,
    host::HostStatus,
    server::{ServerState, spawn_http_server},
    store::SettingsStore,
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub fn serve(config: ServeConfig) -> Result<()> {
    let _telemetry = init_tracing(&config.telemetry);
    init_metrics_recorder();

    let shutdown = install_shutdown_handler();

    let store = Arc::new(SettingsStore::new(config.store.clone()));
    let settings = store.load()?;
    info!(
        path = %store.path().display(),
        source = %config.source,
        width = settings.capture.width,
        height = settings.capture.height,
        fps = settings.capture.fps,
        "starting rearview"
    );

    let source = video_ingest::source_from_uri(&config.source)
        .with_context(|| format!("unsupported capture source {}", config.source))?;
    let controller = Arc::new(ReconfigController::new(settings));
    let publisher = Arc::new(FramePublisher::new());
    let ctx = PipelineContext::new(source, controller.clone(), publisher.clone())
        .with_status(Arc::new(HostStatus::default()));
    let telemetry = ctx.telemetry.clone();
    let health = ctx.health.clone();

    let stream_loop = StreamLoop::start(ctx).context("failed to start stream loop")?;

    let server = match spawn_http_server(
        ServerState {
            publisher,
            controller,
            telemetry,
            health,
            store,
            sink: SinkOptions::default(),
            settings_gate: Mutex::new(()),
        },
        config.bind,
    ) {
        Ok(server) => server,
        Err(err) => {
            stream_loop.stop();
            return Err(err);
        }
    };

    while !shutdown.load(Ordering::SeqCst) {
        if stream_loop.is_finished() {
            error!("stream loop exited unexpectedly");
            break;
        }
        thread::sleep(SHUTDOWN_POLL);
    }

    info!("shutting down");
    if !stream_loop.stop() {
        warn!("stream loop was detached during shutdown");
    }
    server.stop();
    info!("shutdown complete");
    Ok(())
}

fn install_shutdown_handler() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}
