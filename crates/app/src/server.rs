//! Actix Web server exposing the MJPEG stream, snapshots, status and settings.
//!
//! The server runs on a dedicated thread so the stream loop never shares a
//! runtime with request handling. Every handler only reads shared state,
//! except the settings POST which goes through the reconfiguration controller.

use std::{net::SocketAddr, sync::Arc, thread};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tracing::{error, info, warn};
use vision::{
    ApplyOutcome, FrameInfo, FramePublisher, PipelineHealth, PipelineTelemetry,
    ReconfigController, StreamState, TelemetrySnapshot,
    pipeline::telemetry::{prometheus_handle, spawn_thread},
    stream::{CONTENT_TYPE, SinkOptions, mjpeg_stream},
};

use crate::{html, store::SettingsStore};

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) publisher: Arc<FramePublisher>,
    pub(crate) controller: Arc<ReconfigController>,
    pub(crate) telemetry: Arc<PipelineTelemetry>,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) store: Arc<SettingsStore>,
    pub(crate) sink: SinkOptions,
    /// Held across merge, save and apply so the stored file always matches
    /// the active settings.
    pub(crate) settings_gate: Mutex<()>,
}

/// Handle for the HTTP server thread.
pub(crate) struct HttpHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HttpHandle {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("HTTP server thread panicked");
            }
        }
    }
}

/// Register every route on `cfg`.
pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/stream.mjpg", web::get().to(stream_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/api/status", web::get().to(status_handler))
        .route("/api/settings", web::get().to(settings_get))
        .route("/api/settings", web::post().to(settings_post))
        .route("/healthz", web::get().to(health_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Bind `addr` and serve on a dedicated thread. Returns once the listener is
/// bound, so address errors surface to the caller.
pub(crate) fn spawn_http_server(state: ServerState, addr: SocketAddr) -> Result<HttpHandle> {
    let data = web::Data::new(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<()>>(1);

    let handle = spawn_thread("http-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || {
                App::new().app_data(data.clone()).configure(routes)
            })
            .bind(addr)
            {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("failed to spawn HTTP server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!(%addr, "HTTP server listening");
            Ok(HttpHandle {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).with_context(|| format!("failed to bind {addr}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("HTTP server thread exited before binding {addr}"))
        }
    }
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(html::INDEX_HTML)
}

/// Latest encoded frame, or 204 until the first one is published.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.publisher.latest() {
        Some(packet) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header(("X-Sequence", packet.sequence.to_string()))
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream the MJPEG feed over a multipart response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let frames = mjpeg_stream(state.publisher.clone(), state.sink)
        .map(Ok::<Bytes, actix_web::Error>);

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONTENT_TYPE, CONTENT_TYPE))
        .streaming(frames)
}

#[derive(Serialize)]
struct StatusResponse {
    state: StreamState,
    restarts: u64,
    restart_pending: bool,
    telemetry: TelemetrySnapshot,
    latest_frame: Option<FrameInfo>,
    latest_frame_age_ms: Option<i64>,
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let latest = state.publisher.latest().map(|packet| packet.info());
    let now = Utc::now().timestamp_millis();
    HttpResponse::Ok().json(StatusResponse {
        state: state.controller.state(),
        restarts: state.controller.restart_count(),
        restart_pending: state.controller.pending().is_some(),
        telemetry: state.telemetry.snapshot(),
        latest_frame_age_ms: latest.map(|info| (now - info.timestamp_ms).max(0)),
        latest_frame: latest,
    })
}

async fn settings_get(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.controller.settings())
}

#[derive(Serialize)]
struct SettingsReply {
    outcome: ApplyOutcome,
    settings: vision::PipelineSettings,
}

/// Merge a partial settings document over the current settings, persist the
/// result, then hand it to the controller.
async fn settings_post(state: web::Data<ServerState>, patch: web::Json<Value>) -> HttpResponse {
    let _gate = state.settings_gate.lock().await;
    let settings = match state.controller.settings().merged_with(patch.into_inner()) {
        Ok(settings) => settings,
        Err(err) => {
            warn!("rejected settings update: {err}");
            return HttpResponse::BadRequest().json(json!({ "error": err.to_string() }));
        }
    };

    let store = state.store.clone();
    let to_save = settings.clone();
    match web::block(move || store.save(&to_save)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!("failed to persist settings: {err:#}");
            return HttpResponse::InternalServerError()
                .json(json!({ "error": format!("failed to persist settings: {err:#}") }));
        }
        Err(err) => {
            error!("settings writer failed: {err}");
            return HttpResponse::InternalServerError().json(json!({ "error": err.to_string() }));
        }
    }

    match state.controller.apply_config(settings) {
        Ok(outcome) => HttpResponse::Ok().json(SettingsReply {
            outcome,
            settings: state.controller.settings(),
        }),
        Err(err) => HttpResponse::BadRequest().json(json!({ "error": err.to_string() })),
    }
}

async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    if state.controller.state() == StreamState::Stopped {
        return HttpResponse::ServiceUnavailable().body("stream loop stopped");
    }
    match state.health.check_now() {
        None => HttpResponse::Ok().body("ok"),
        Some(component) => {
            HttpResponse::ServiceUnavailable().body(format!("stale: {}", component.label()))
        }
    }
}

async fn metrics_handler() -> HttpResponse {
    let body = prometheus_handle()
        .map(|handle| handle.render())
        .unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test};
    use futures::future::join_all;
    use vision::{FramePacket, PipelineSettings};

    use super::*;

    struct Fixture {
        state: web::Data<ServerState>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = web::Data::new(ServerState {
            publisher: Arc::new(FramePublisher::new()),
            controller: Arc::new(ReconfigController::new(PipelineSettings::default())),
            telemetry: Arc::new(PipelineTelemetry::new()),
            health: Arc::new(PipelineHealth::new()),
            store: Arc::new(SettingsStore::new(dir.path().join("config.json"))),
            sink: SinkOptions::default(),
            settings_gate: Mutex::new(()),
        });
        Fixture { state, _dir: dir }
    }

    fn packet(sequence: u64) -> FramePacket {
        FramePacket {
            jpeg: Bytes::from_static(b"\xFF\xD8jpeg"),
            sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
            width: 4,
            height: 4,
            target_fps: 20,
        }
    }

    #[actix_web::test]
    async fn frame_is_no_content_until_published() {
        let fx = fixture();
        let app =
            test::init_service(App::new().app_data(fx.state.clone()).configure(routes)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        fx.state.publisher.publish(packet(1));
        let resp = test::call_service(&app, test::TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"\xFF\xD8jpeg");
    }

    #[actix_web::test]
    async fn settings_post_reports_outcomes_and_persists() {
        let fx = fixture();
        let app =
            test::init_service(App::new().app_data(fx.state.clone()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/settings")
            .set_json(json!({ "overlay": { "text": { "enabled": true } } }))
            .to_request();
        let reply: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(reply["outcome"], "overlay-updated");

        let req = test::TestRequest::post()
            .uri("/api/settings")
            .set_json(json!({ "capture": { "width": 320, "height": 240 } }))
            .to_request();
        let reply: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(reply["outcome"], "restart-scheduled");
        assert_eq!(reply["settings"]["capture"]["width"], 320);

        let stored = fx.state.store.load().unwrap();
        assert_eq!(stored.capture.width, 320);
        assert!(stored.overlay.text.enabled);
    }

    #[actix_web::test]
    async fn concurrent_settings_posts_all_land_and_match_the_store() {
        let fx = fixture();
        let app =
            test::init_service(App::new().app_data(fx.state.clone()).configure(routes)).await;

        let patches = [
            json!({ "capture": { "fps": 10 } }),
            json!({ "overlay": { "text": { "content": "BACK" } } }),
            json!({ "capture": { "jpeg_quality": 70 } }),
            json!({ "overlay": { "show_status": false } }),
        ];
        let responses = join_all(patches.into_iter().map(|patch| {
            let req = test::TestRequest::post()
                .uri("/api/settings")
                .set_json(patch)
                .to_request();
            test::call_service(&app, req)
        }))
        .await;
        for resp in responses {
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let active = fx.state.controller.settings();
        assert_eq!(active.capture.fps, 10);
        assert_eq!(active.capture.jpeg_quality, 70);
        assert_eq!(active.overlay.text.content, "BACK");
        assert!(!active.overlay.show_status);
        assert_eq!(fx.state.store.load().unwrap(), active);
    }

    #[actix_web::test]
    async fn invalid_settings_are_rejected_without_saving() {
        let fx = fixture();
        let app =
            test::init_service(App::new().app_data(fx.state.clone()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/settings")
            .set_json(json!({ "capture": { "width": 0 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!fx.state.store.path().exists());
        assert_eq!(fx.state.controller.settings(), PipelineSettings::default());
    }

    #[actix_web::test]
    async fn status_and_health_report_pipeline_state() {
        let fx = fixture();
        let app =
            test::init_service(App::new().app_data(fx.state.clone()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        fx.state.publisher.publish(packet(3));
        let req = test::TestRequest::get().uri("/api/status").to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["state"], "stopped");
        assert_eq!(status["latest_frame"]["sequence"], 3);
        assert_eq!(status["restarts"], 0);
    }

    #[actix_web::test]
    async fn stream_uses_multipart_content_type() {
        let fx = fixture();
        fx.state.publisher.publish(packet(1));
        let app =
            test::init_service(App::new().app_data(fx.state.clone()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/stream.mjpg").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }
}
