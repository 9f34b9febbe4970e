use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    extract::{ConnectInfo, FromRef, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use sensornet_common::{
    host_http::{handle_static_file, node_routes, request_params, text_response, NodeWeb, RuntimeStore},
    readings::parse_report,
    web, FlashStore, Indicator, RuntimeConfig, SensorRegistry,
};

const DEFAULT_ASSETS: &[(&str, &str)] = &[("/index.html", include_str!("../data/index.html"))];

#[derive(Clone)]
struct AppState {
    node: NodeWeb,
    registry: Arc<Mutex<SensorRegistry>>,
}

impl FromRef<AppState> for NodeWeb {
    fn from_ref(state: &AppState) -> Self {
        state.node.clone()
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("SENSORNET_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("collector-data"));
    let state = build_state(&data_dir).await?;

    let port = std::env::var("COLLECTOR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind collector server at {addr}"))?;

    info!("collector listening on http://{addr}");
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn build_state(data_dir: &Path) -> anyhow::Result<AppState> {
    let flash = FlashStore::new(data_dir.join("spiffs"));
    flash.mount().context("failed to mount flash storage")?;
    if let Err(err) = flash.seed_missing(DEFAULT_ASSETS) {
        warn!("failed to seed default web assets: {err}");
    }
    flash.log_inventory();

    let runtime_store = RuntimeStore::new(data_dir.join("runtime.json"));
    let runtime = runtime_store.load().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err}");
        RuntimeConfig::default()
    });

    let node = NodeWeb::new(flash, runtime_store, data_dir, runtime.led.brightness);
    node.set_led(Indicator::Connected);

    Ok(AppState {
        node,
        registry: Arc::new(Mutex::new(SensorRegistry::new())),
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(web::ROUTE_SENSOR, post(handle_sensor))
        .route(web::ROUTE_SENSOR_DATA, get(handle_get_sensor_data))
        .merge(node_routes::<AppState>())
        .fallback(handle_static_file)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_sensor(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let params = request_params(query, &body);
    let report = parse_report(&params);
    let sender = remote.ip().to_string();

    debug!(
        "sensor update from {sender}: clientId={}, value={}",
        report.client_id, report.value
    );
    state
        .registry
        .lock()
        .await
        .update(&sender, &report.client_id, report.value);
    state.node.set_led(Indicator::Sensor(report.value));

    text_response(200, "OK")
}

async fn handle_get_sensor_data(State(state): State<AppState>) -> Response {
    let json = state.registry.lock().await.to_json();
    ([(header::CONTENT_TYPE, web::CONTENT_TYPE_JSON)], json).into_response()
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        extract::connect_info::MockConnectInfo,
        http::{Request, StatusCode},
    };
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sensornet-collector-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    async fn app(tag: &str, peer: [u8; 4]) -> (Router, AppState) {
        let state = build_state(&temp_dir(tag)).await.unwrap();
        let router = build_router(state.clone())
            .layer(MockConnectInfo(SocketAddr::from((peer, 51000))));
        (router, state)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn multipart(uri: &str, filename: &str, content: &[u8]) -> Request<Body> {
        let boundary = "XBOUNDARY";
        let mut body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn get_json(router: &Router, uri: &str) -> serde_json::Value {
        let response = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    fn post_form(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn sensor_reports_are_keyed_by_sender_ip() {
        let (router, state) = app("ingest", [192, 168, 1, 42]).await;

        let response = router
            .clone()
            .oneshot(post_form("/sensor", "clientId=7&value=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");

        let response = router
            .oneshot(Request::get("/sensorData").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            r#"{"192.168.1.42":{"clientId":"7","value":1}}"#
        );

        assert_eq!(state.node.led.lock().unwrap().colour(), sensornet_common::Rgb::BLUE);
    }

    #[tokio::test]
    async fn query_parameters_are_accepted_and_values_use_to_int() {
        let (router, state) = app("query", [10, 0, 0, 5]).await;

        let response = router
            .oneshot(post_form("/sensor?clientId=3&value=12abc", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let registry = state.registry.lock().await;
        let reading = registry.get("10.0.0.5").unwrap();
        assert_eq!(reading.client_id, "3");
        assert_eq!(reading.value, 12);
        drop(registry);
        assert_eq!(state.node.led.lock().unwrap().colour(), sensornet_common::Rgb::RED);
    }

    #[tokio::test]
    async fn later_report_from_same_sender_overwrites() {
        let (router, state) = app("overwrite", [192, 168, 1, 50]).await;
        router
            .clone()
            .oneshot(post_form("/sensor", "clientId=1&value=1"))
            .await
            .unwrap();
        router
            .oneshot(post_form("/sensor", "clientId=2&value=0"))
            .await
            .unwrap();

        let registry = state.registry.lock().await;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("192.168.1.50").unwrap().client_id, "2");
    }

    #[tokio::test]
    async fn empty_registry_serves_empty_object() {
        let (router, _) = app("empty", [127, 0, 0, 1]).await;
        let response = router
            .oneshot(Request::get("/sensorData").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "{}");
    }

    #[tokio::test]
    async fn root_serves_seeded_index_and_static_files_fall_back_to_flash() {
        let (router, state) = app("static", [127, 0, 0, 1]).await;

        let response = router
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("SensorNet Collector"));

        state.node.flash.write("/style.css", b"body{}").unwrap();
        let response = router
            .clone()
            .oneshot(Request::get("/style.css").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
        assert_eq!(body_text(response).await, "body{}");

        state.node.flash.write("/app.js", b"run()").unwrap();
        let response = router
            .clone()
            .oneshot(Request::get("/app.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/javascript"
        );

        let response = router
            .clone()
            .oneshot(Request::get("/missing.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(post_form("/style.css", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_index_reports_spiffs_error() {
        let (router, state) = app("noindex", [127, 0, 0, 1]).await;
        state.node.flash.remove("/index.html").unwrap();

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "File not found in SPIFFS");
    }

    #[tokio::test]
    async fn delete_reports_original_messages() {
        let (router, state) = app("delete", [127, 0, 0, 1]).await;
        state.node.flash.write("/old.txt", b"x").unwrap();

        let response = router
            .clone()
            .oneshot(post_form("/delete", "file=old.txt"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            "SUCCESS: File '/old.txt' deleted successfully"
        );

        let response = router
            .clone()
            .oneshot(post_form("/delete", "file=old.txt"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router.oneshot(post_form("/delete", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "ERROR: No filename specified");
    }

    #[tokio::test]
    async fn multipart_upload_lands_in_flash() {
        let (router, state) = app("upload", [127, 0, 0, 1]).await;
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello flash\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::post("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, web::UPLOAD_COMPLETE);
        assert_eq!(state.node.flash.read("/notes.txt").unwrap(), b"hello flash");

        let response = router
            .oneshot(Request::get("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let files: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(files
            .as_array()
            .unwrap()
            .iter()
            .any(|file| file["name"] == "/notes.txt" && file["size"] == 11));
    }

    #[tokio::test]
    async fn color_route_sets_custom_colour() {
        let (router, state) = app("color", [127, 0, 0, 1]).await;
        let response = router
            .oneshot(
                Request::get("/color?r=10&g=300&b=x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.node.led.lock().unwrap().colour(),
            sensornet_common::Rgb::new(10, 255, 0)
        );
    }

    #[tokio::test]
    async fn firmware_upload_requires_ota_password() {
        let (router, state) = app("otaauth", [127, 0, 0, 1]).await;
        let request = Request::post("/update?password=wrong")
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=B")
            .body(Body::from("--B--\r\n"))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!state.node.ota.snapshot().in_progress);
    }

    #[tokio::test]
    async fn stored_firmware_is_staged_with_digest() {
        let (router, state) = app("otastored", [127, 0, 0, 1]).await;
        state.node.flash.write("/fw.bin", b"abcdef").unwrap();

        let response = router
            .clone()
            .oneshot(post_form("/firmware", "file=/fw.bin&password=admin"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            std::fs::read(state.node.staged_firmware.as_ref()).unwrap(),
            b"abcdef"
        );

        let response = router
            .oneshot(Request::get("/api/ota/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(status["inProgress"], false);
        assert_eq!(status["bytesWritten"], 6);
        assert_eq!(
            status["lastSha256"],
            "bef57ec7f53a6d40beb640a780a639c83bc29ac8a9816f1fc6c5c6dcd93c4721"
        );
    }

    #[tokio::test]
    async fn uploaded_firmware_is_staged_with_digest() {
        let (router, state) = app("otaupload", [127, 0, 0, 1]).await;

        let response = router
            .clone()
            .oneshot(multipart("/update?password=admin", "fw.bin", b"abcdef"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.starts_with("Update complete from upload"));
        assert_eq!(
            std::fs::read(state.node.staged_firmware.as_ref()).unwrap(),
            b"abcdef"
        );

        let status = get_json(&router, "/api/ota/status").await;
        assert_eq!(status["inProgress"], false);
        assert_eq!(status["bytesWritten"], 6);
        assert_eq!(
            status["lastSha256"],
            "bef57ec7f53a6d40beb640a780a639c83bc29ac8a9816f1fc6c5c6dcd93c4721"
        );
    }

    #[tokio::test]
    async fn large_firmware_upload_is_written_in_full() {
        let (router, state) = app("otalarge", [127, 0, 0, 1]).await;
        let image: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

        let response = router
            .oneshot(multipart("/update?password=admin", "big.bin", &image))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            std::fs::read(state.node.staged_firmware.as_ref()).unwrap(),
            image
        );
        assert_eq!(state.node.ota.snapshot().bytes_written, image.len() as u64);
    }

    #[tokio::test]
    async fn non_firmware_upload_is_rejected_without_staging() {
        let (router, state) = app("otabadext", [127, 0, 0, 1]).await;

        let response = router
            .oneshot(multipart("/update?password=admin", "run.sh", b"#!/bin/sh"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.node.staged_firmware.exists());
        assert!(!state.node.ota.snapshot().in_progress);
    }

    #[tokio::test]
    async fn firmware_upload_during_update_conflicts() {
        let (router, state) = app("otabusy", [127, 0, 0, 1]).await;
        state.node.ota.begin("other.bin", None).unwrap();

        let response = router
            .oneshot(multipart("/update?password=admin", "fw.bin", b"abcdef"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_text(response).await.contains("already in progress"));
        assert!(state.node.ota.snapshot().in_progress);
    }

    #[tokio::test]
    async fn network_settings_hide_secrets() {
        let (router, state) = app("netget", [127, 0, 0, 1]).await;
        let mut runtime = state.node.runtime.load().await.unwrap();
        runtime.network.wifi_ssid = "home".to_string();
        runtime.network.wifi_pass = "hunter22".to_string();
        state.node.runtime.save(&runtime).await.unwrap();

        let response = router
            .oneshot(Request::get("/api/network").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(!text.contains("hunter22"));
        assert!(!text.contains("\"admin\""));

        let view: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(view["wifiSsid"], "home");
        assert_eq!(view["wifiPassSet"], true);
        assert_eq!(view["otaPasswordSet"], true);
        assert!(view.get("wifiPass").is_none());
        assert!(view.get("otaPassword").is_none());
    }

    #[tokio::test]
    async fn network_update_reports_restart_and_persists() {
        let (router, state) = app("netput", [127, 0, 0, 1]).await;
        let put = |body: serde_json::Value| {
            Request::put("/api/network")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = router
            .clone()
            .oneshot(put(serde_json::json!({
                "wifiSsid": "lab",
                "wifiPass": "secret-pass",
                "useStaticIp": false,
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(!text.contains("secret-pass"));
        let payload: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["restartRequired"], true);
        assert_eq!(payload["network"]["wifiSsid"], "lab");
        assert_eq!(payload["network"]["wifiPassSet"], true);

        let view = get_json(&router, "/api/network").await;
        assert_eq!(view["wifiSsid"], "lab");
        assert_eq!(
            state.node.runtime.load().await.unwrap().network.wifi_pass,
            "secret-pass"
        );

        let response = router
            .clone()
            .oneshot(put(serde_json::json!({
                "wifiSsid": "lab",
                "otaPassword": "changed",
                "useStaticIp": false,
            })))
            .await
            .unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(payload["restartRequired"], false);

        let response = router
            .oneshot(put(serde_json::json!({
                "wifiSsid": "lab",
                "useStaticIp": true,
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
